//! The event loop: waiting for tracee state changes, and dispatching them to callbacks.

use std::ops::ControlFlow;

use libc::{c_int, pid_t};
use nix::errno::Errno;
use tracing::{debug, trace, warn};

use crate::callback::{Callbacks, Flow, Outcome};
use crate::context::{kernel_version, Context};
use crate::error::{ErrorKind, Failure};
use crate::event::{Event, Status, SYSCALL_TRAP};
use crate::process::{Pid, ProcessFlags, Step, Tracee};
use crate::trace::Ptrace;


/// Before Linux 3.0, the exec event message does not hold the former tid.
const EXEC_TID_RELEASE: u32 = kernel_version(3, 0, 0);

type Next = ControlFlow<()>;

const NEXT: Next = ControlFlow::Continue(());
const STOP: Next = ControlFlow::Break(());

impl<C: Callbacks, P: Ptrace> Context<C, P> {
    /// Run the event loop until no traced process is left, a fatal error occurs or a
    /// callback aborts.
    ///
    /// Returns the value of [`Callbacks::cleanup()`]. On abort, the remaining tracees
    /// are left as they are.
    pub fn run(&mut self) -> i32 {
        while !self.registry.is_empty() {
            let waited = self.wait();

            if let Some(sig) = self.interrupts.take() {
                debug!(sig, "interrupted");

                if self.callbacks.interrupt(sig).contains(Flow::ABORT) {
                    self.abort();
                    break;
                }
            }

            let (tid, status) = match waited {
                Ok(waited) => waited,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    self.report(&Failure::Wait { errno }, true);
                    break;
                },
            };

            trace!(pid = %tid, ?status, "wait");

            if self.dispatch(tid, status).is_break() {
                break;
            }
        }

        let outcome = Outcome {
            error: self.error,
            fatal: self.fatal,
            process_count: self.registry.len(),
        };

        debug!(?outcome, "event loop finished");

        self.callbacks.cleanup(&outcome)
    }

    fn wait(&mut self) -> Result<(Pid, Status), Errno> {
        if let Err(err) = self.interrupts.unblock() {
            warn!("could not unblock interrupts: {err}");
        }

        let waited = if self.interrupts.pending() {
            Err(Errno::EINTR)
        } else {
            self.ptrace.wait()
        };

        if let Err(err) = self.interrupts.block() {
            warn!("could not block interrupts: {err}");
        }

        waited
    }

    fn dispatch(&mut self, tid: Pid, status: Status) -> Next {
        let event = status.event();

        if event == Event::Exec {
            self.switch_exec_thread(tid);

            if self.registry.contains(tid) {
                return self.handle_exec(tid);
            }
        }

        if !self.registry.contains(tid) {
            if status.terminated() {
                debug!(pid = %tid, ?status, "ignoring termination of unknown process");
                return NEXT;
            }

            // The child of a fork or clone may stop before its parent reports the
            // event. Leave it stopped until the parent does.
            if self.registry.insert(tid, None, Step::Default, ProcessFlags::SUSPENDED).is_err() {
                self.report(&Failure::Alloc { context: "suspended process" }, true);
                return STOP;
            }

            debug!(pid = %tid, "suspended until its parent reports it");
            return NEXT;
        }

        if status.terminated() {
            self.registry.remove(tid);

            if self.callbacks.exit(tid, status).contains(Flow::ABORT) {
                self.abort();
                return STOP;
            }

            return NEXT;
        }

        if !status.stopped() {
            self.process_error(tid, "WIFSTOPPED");
            return NEXT;
        }

        if self.has_flags(tid, ProcessFlags::STARTUP) && !self.startup(tid) {
            return NEXT;
        }

        match event {
            Event::Fork | Event::Vfork | Event::Clone => {
                if self.handle_new_child(tid).is_break() {
                    return STOP;
                }

                if !self.registry.contains(tid) {
                    return NEXT;
                }
            },
            Event::Exit => {
                let msg = match self.ptrace.get_event_message(tid) {
                    Ok(msg) => msg,
                    Err(errno) => {
                        self.ptrace_error(tid, "geteventmsg", errno);
                        return NEXT;
                    },
                };

                let status = Status::from_raw(msg as c_int);
                let flow = self.with_tracee(tid, |cb, tracee| cb.pre_exit(tracee, status));

                if let Some(next) = self.honor(tid, flow) {
                    return next;
                }
            },
            Event::Seccomp => {
                let data = match self.ptrace.get_event_message(tid) {
                    Ok(data) => data,
                    Err(errno) => {
                        self.ptrace_error(tid, "geteventmsg", errno);
                        return NEXT;
                    },
                };

                let flow = self.with_tracee(tid, |cb, tracee| cb.seccomp(tracee, data));

                if let Some(next) = self.honor(tid, flow) {
                    return next;
                }
            },
            _ => {},
        }

        if event != Event::None {
            self.step(tid, 0);
            return NEXT;
        }

        let sig = status.stop_signal().unwrap_or(0);

        if sig == libc::SIGSTOP && self.has_flags(tid, ProcessFlags::IGNORE_ONE_SIGSTOP) {
            if let Some(process) = self.registry.get_mut(tid) {
                process.remove_flags(ProcessFlags::IGNORE_ONE_SIGSTOP);
            }

            debug!(pid = %tid, "absorbed initial SIGSTOP");
            self.step(tid, 0);
            return NEXT;
        }

        if sig != SYSCALL_TRAP {
            let flow = self.with_tracee(tid, |cb, tracee| cb.signal(tracee, status));

            if let Some(next) = self.honor(tid, flow) {
                return next;
            }

            let sig = if flow.contains(Flow::SIGIGN) { 0 } else { sig };
            self.step(tid, sig);
            return NEXT;
        }

        self.handle_syscall(tid)
    }

    /// Under Linux, a non-leader thread calling `execve()` takes over the tid of its
    /// thread group leader, which vanishes without an exit report. Drop the record of
    /// the leader, and move the record of the exec'ing thread to the leader's tid.
    fn switch_exec_thread(&mut self, tid: Pid) {
        if self.config.os_release() < EXEC_TID_RELEASE {
            return;
        }

        let old_tid = match self.ptrace.get_event_message(tid) {
            Ok(msg) => Pid::from_raw(msg as pid_t),
            Err(errno) => {
                debug!(pid = %tid, "could not get former tid of exec'ing thread: {errno}");
                return;
            },
        };

        if old_tid.as_raw() <= 0 || old_tid == tid || !self.registry.contains(old_tid) {
            return;
        }

        debug!(pid = %tid, old = %old_tid, "exec'ing thread takes over leader tid");

        self.registry.remove(tid);
        self.registry.relabel(old_tid, tid);
    }

    fn handle_exec(&mut self, tid: Pid) -> Next {
        let Some(old_abi) = self.registry.get(tid).map(|p| p.abi()) else {
            return NEXT;
        };

        let regs = match self.ptrace.get_registers(tid) {
            Ok(regs) => regs,
            Err(errno) => {
                self.ptrace_error(tid, "getregs", errno);
                return NEXT;
            },
        };

        let abi = match regs.abi() {
            Ok(abi) => abi,
            Err(err) => {
                self.ptrace_error(tid, "abi", err.errno().unwrap_or(Errno::ENOTSUP));
                return NEXT;
            },
        };

        if let Some(process) = self.registry.get_mut(tid) {
            if abi != old_abi {
                debug!(pid = %tid, %old_abi, %abi, "ABI changed");
            }

            process.set_abi(abi);
        }

        let flow = self.with_tracee(tid, |cb, tracee| cb.exec(tracee, &regs, old_abi));

        if let Some(next) = self.honor(tid, flow) {
            return next;
        }

        // Carry on with the exec event stop.
        if self.has_flags(tid, ProcessFlags::STARTUP) && !self.startup(tid) {
            return NEXT;
        }

        self.step(tid, 0);
        NEXT
    }

    /// Associate the child reported by a fork, vfork or clone event of `tid`.
    fn handle_new_child(&mut self, tid: Pid) -> Next {
        let child = match self.ptrace.get_event_message(tid) {
            Ok(msg) => Pid::from_raw(msg as pid_t),
            Err(errno) => {
                self.ptrace_error(tid, "geteventmsg", errno);
                return NEXT;
            },
        };

        let Some(parent_abi) = self.registry.get(tid).map(|p| p.abi()) else {
            return NEXT;
        };

        match self.registry.get_mut(child) {
            Some(process) => {
                // The child already stopped, and is waiting for its parent.
                process.set_tgid(Some(tid));
                process.set_abi(parent_abi);
                process.remove_flags(ProcessFlags::SUSPENDED);

                debug!(pid = %child, parent = %tid, "resuming suspended child");

                if self.startup(child) {
                    self.step(child, 0);
                }

                NEXT
            },
            None => {
                // The initial stop of the child is yet to come.
                let flags = ProcessFlags::IGNORE_ONE_SIGSTOP;

                match self.registry.insert(child, Some(tid), Step::Default, flags) {
                    Ok(process) => {
                        process.set_abi(parent_abi);
                        NEXT
                    },
                    Err(_) => {
                        self.report(&Failure::Alloc { context: "child process" }, true);
                        STOP
                    },
                }
            },
        }
    }

    fn handle_syscall(&mut self, tid: Pid) -> Next {
        let Some(process) = self.registry.get_mut(tid) else {
            return NEXT;
        };

        let flags = process.flags() ^ ProcessFlags::IN_SYSCALL;
        let entering = flags.contains(ProcessFlags::IN_SYSCALL);

        if entering {
            process.insert_flags(ProcessFlags::IN_SYSCALL);
        } else {
            process.remove_flags(ProcessFlags::IN_SYSCALL);
        }

        let regs = match self.ptrace.get_registers(tid) {
            Ok(regs) => regs,
            Err(errno) => {
                self.ptrace_error(tid, "getregs", errno);
                return NEXT;
            },
        };

        let flow = self.with_tracee(tid, |cb, tracee| cb.syscall(tracee, &regs, entering));

        if let Some(next) = self.honor(tid, flow) {
            return next;
        }

        self.step(tid, 0);
        NEXT
    }

    /// Handle the first stop of a process. Returns `false` if it was torn down.
    fn startup(&mut self, tid: Pid) -> bool {
        if let Err(errno) = self.ptrace.set_options(tid, self.config.options()) {
            self.ptrace_error(tid, "setup", errno);
            return false;
        }

        let Some(mut process) = self.registry.take(tid) else {
            return false;
        };

        if self.config.follows_fork() {
            process.insert_flags(ProcessFlags::FOLLOW_FORK);
        }

        let parent = process.tgid().and_then(|tgid| self.registry.get(tgid));
        let mut tracee = Tracee::new(&mut process, &self.ptrace, &self.memory);
        self.callbacks.startup(&mut tracee, parent);

        process.remove_flags(ProcessFlags::STARTUP);
        debug!(pid = %tid, flags = ?process.flags(), "started up");

        self.registry.restore(process);

        true
    }

    /// Resume a process per its step mode, delivering `sig` if it is not 0.
    fn step(&mut self, tid: Pid, sig: c_int) {
        let Some(process) = self.registry.get(tid) else {
            return;
        };

        let res = match self.config.resolve_step(process.step()) {
            Step::SingleStep => self.ptrace.singlestep(tid, sig),
            Step::Resume => self.ptrace.resume(tid, sig),
            Step::Syscall | Step::Default => self.ptrace.syscall_step(tid, sig),
        };

        if let Err(errno) = res {
            self.ptrace_error(tid, "step", errno);
        }
    }

    fn with_tracee<F>(&mut self, tid: Pid, f: F) -> Flow
    where
        F: FnOnce(&mut C, &mut Tracee<'_>) -> Flow,
    {
        let Some(process) = self.registry.get_mut(tid) else {
            return Flow::empty();
        };

        let mut tracee = Tracee::new(process, &self.ptrace, &self.memory);
        f(&mut self.callbacks, &mut tracee)
    }

    /// Act on the `ABORT` and `DROP` flags of a callback's answer.
    fn honor(&mut self, tid: Pid, flow: Flow) -> Option<Next> {
        if flow.contains(Flow::ABORT) {
            self.abort();
            return Some(STOP);
        }

        if flow.contains(Flow::DROP) {
            debug!(pid = %tid, "dropped by callback");
            self.registry.remove(tid);
            return Some(NEXT);
        }

        None
    }

    fn abort(&mut self) {
        debug!("aborted by callback");
        self.error = Some(ErrorKind::CallbackAbort);
        self.fatal = true;
    }

    fn has_flags(&self, tid: Pid, flags: ProcessFlags) -> bool {
        self.registry.get(tid).map_or(false, |p| p.flags().contains(flags))
    }

    /// Tear down a process after a failed request. `ESRCH` means it died, and is not
    /// reported as an error.
    fn ptrace_error(&mut self, tid: Pid, context: &'static str, errno: Errno) {
        let Some(process) = self.registry.get(tid) else {
            return;
        };

        if errno == Errno::ESRCH {
            debug!(pid = %tid, context, "process vanished");
            self.callbacks.teardown(process);
        } else {
            let failure = Failure::Trace { process, context, errno };
            warn!(pid = %tid, "{failure}");

            self.error = Some(ErrorKind::Trace);
            self.fatal = false;
            self.callbacks.error(&failure);
        }

        self.registry.remove(tid);
    }

    fn process_error(&mut self, tid: Pid, context: &'static str) {
        let Some(process) = self.registry.get(tid) else {
            return;
        };

        let failure = Failure::Process { process, context };
        warn!(pid = %tid, "{failure}");

        self.error = Some(ErrorKind::Process);
        self.fatal = false;
        self.callbacks.error(&failure);

        self.registry.remove(tid);
    }
}
