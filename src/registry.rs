//! The set of traced threads, keyed by thread id.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::process::{Pid, Process, ProcessFlags, Step};


/// Verdict of a visitor passed to [`Registry::walk()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visit {
    Continue,
    Stop,
    /// Remove the visited process, then continue.
    Remove,
}

#[derive(Debug, Default)]
pub struct Registry {
    processes: HashMap<Pid, Process>,
    limit: Option<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Refuse to register more than `limit` threads. Refused inserts fail as if memory
    /// for the record could not be allocated.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Register a new traced thread, marked as not yet seen stopped.
    ///
    /// An existing record with the same `tid` is replaced. Fails only if memory for the
    /// record cannot be allocated, or the limit set by [`Registry::set_limit()`] is
    /// reached.
    pub fn insert(
        &mut self,
        tid: Pid,
        tgid: Option<Pid>,
        step: Step,
        flags: ProcessFlags,
    ) -> Result<&mut Process> {
        let full = self.limit.map_or(false, |limit| self.processes.len() >= limit);

        if full && !self.contains(tid) {
            return Err(Error::Alloc { pid: tid });
        }

        self.processes
            .try_reserve(1)
            .map_err(|_| Error::Alloc { pid: tid })?;

        let process = Process::new(tid, tgid, flags, step);
        info!(pid = %tid, ?flags, "new process");

        if self.processes.insert(tid, process).is_some() {
            debug!(pid = %tid, "replaced stale process record");
        }

        self.get_mut(tid)
            .ok_or_else(|| Error::Internal(format!("process {tid} missing after insert")))
    }

    pub fn get(&self, tid: Pid) -> Option<&Process> {
        self.processes.get(&tid)
    }

    pub fn get_mut(&mut self, tid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&tid)
    }

    pub fn contains(&self, tid: Pid) -> bool {
        self.processes.contains_key(&tid)
    }

    /// Remove a thread, dropping its record and user data.
    ///
    /// Returns `false` if the thread was not registered.
    pub fn remove(&mut self, tid: Pid) -> bool {
        match self.processes.remove(&tid) {
            Some(_) => {
                info!(pid = %tid, "removed process");
                true
            },
            None => false,
        }
    }

    /// Take a record out of the registry, to be put back with [`Registry::restore()`].
    pub(crate) fn take(&mut self, tid: Pid) -> Option<Process> {
        self.processes.remove(&tid)
    }

    pub(crate) fn restore(&mut self, process: Process) {
        self.processes.insert(process.tid(), process);
    }

    /// Move the record of `from` to `to`, replacing and dropping any record of `to`.
    pub(crate) fn relabel(&mut self, from: Pid, to: Pid) -> Option<&mut Process> {
        let mut process = self.processes.remove(&from)?;
        process.set_tid(to);

        if self.processes.insert(to, process).is_some() {
            info!(pid = %to, "removed process");
        }

        debug!(from = %from, to = %to, "relabeled process");

        self.processes.get_mut(&to)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    /// Call `visit` on each process until it returns [`Visit::Stop`], returning the
    /// number of processes visited.
    ///
    /// The visitor may ask for the visited process to be removed.
    pub fn walk<F>(&mut self, mut visit: F) -> usize
    where
        F: FnMut(&mut Process) -> Visit,
    {
        let mut visited = 0;

        for tid in self.pids() {
            let Some(process) = self.processes.get_mut(&tid) else {
                continue;
            };

            visited += 1;

            match visit(process) {
                Visit::Continue => {},
                Visit::Stop => break,
                Visit::Remove => {
                    self.remove(tid);
                },
            }
        }

        visited
    }
}
