//! Traced threads, and handles for operating on them while they are stopped.

use std::any::Any;
use std::ops::{Deref, DerefMut};

use bitflags::bitflags;
use libc::c_int;
use nix::errno::Errno;

use crate::abi::Abi;
use crate::error::{Error, Result, ResultExt};
use crate::memory::Memory;
use crate::regs::Registers;
use crate::trace::Ptrace;

pub use nix::unistd::Pid;


bitflags! {
    /// State of a traced thread, as tracked by the event loop.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ProcessFlags: u32 {
        /// Attached with `PTRACE_ATTACH`, rather than spawned. Detached when resumed.
        const ATTACHED = 1 << 0;

        /// Not yet seen stopped. Trace options are set on the first stop.
        const STARTUP = 1 << 1;

        /// The next `SIGSTOP` is an artifact of attaching or spawning, and is absorbed.
        const IGNORE_ONE_SIGSTOP = 1 << 2;

        /// New child seen before the fork, vfork or clone event of its parent.
        const SUSPENDED = 1 << 3;

        /// Between syscall entry and exit.
        const IN_SYSCALL = 1 << 4;

        /// Children are traced automatically.
        const FOLLOW_FORK = 1 << 5;

        /// Member of a thread group, created by `clone()`.
        const CLONE_THREAD = 1 << 6;
    }
}

/// How to resume a stopped tracee.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Step {
    /// Use the step mode configured for the context.
    #[default]
    Default,

    /// Stop after each instruction.
    SingleStep,

    /// Stop at each syscall entry and exit.
    Syscall,

    /// Run until the next signal or event.
    Resume,
}

/// A traced thread.
///
/// Owned by the [`Registry`](crate::Registry). Any user data is dropped along with the
/// record, when the thread is removed.
#[derive(Debug)]
pub struct Process {
    tid: Pid,
    tgid: Option<Pid>,
    abi: Abi,
    flags: ProcessFlags,
    step: Step,
    user_data: Option<Box<dyn Any>>,
}

impl Process {
    pub(crate) fn new(tid: Pid, tgid: Option<Pid>, flags: ProcessFlags, step: Step) -> Self {
        Self {
            tid,
            tgid,
            abi: Abi::native(),
            flags: (flags | ProcessFlags::STARTUP) - ProcessFlags::IN_SYSCALL,
            step,
            user_data: None,
        }
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    pub(crate) fn set_tid(&mut self, tid: Pid) {
        self.tid = tid;
    }

    /// Thread group of the thread, if it was created by `clone()` with `CLONE_THREAD`
    /// or attached as part of a group.
    pub fn tgid(&self) -> Option<Pid> {
        self.tgid
    }

    pub(crate) fn set_tgid(&mut self, tgid: Option<Pid>) {
        self.tgid = tgid;
    }

    /// The ABI the thread was last seen executing under.
    pub fn abi(&self) -> Abi {
        self.abi
    }

    pub(crate) fn set_abi(&mut self, abi: Abi) {
        self.abi = abi;
    }

    pub fn flags(&self) -> ProcessFlags {
        self.flags
    }

    pub(crate) fn insert_flags(&mut self, flags: ProcessFlags) {
        self.flags.insert(flags);
    }

    pub(crate) fn remove_flags(&mut self, flags: ProcessFlags) {
        self.flags.remove(flags);
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn set_step(&mut self, step: Step) {
        self.step = step;
    }

    pub fn is_attached(&self) -> bool {
        self.flags.contains(ProcessFlags::ATTACHED)
    }

    pub fn is_clone(&self) -> bool {
        self.flags.contains(ProcessFlags::CLONE_THREAD)
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.contains(ProcessFlags::SUSPENDED)
    }

    pub fn in_syscall(&self) -> bool {
        self.flags.contains(ProcessFlags::IN_SYSCALL)
    }

    pub fn follows_fork(&self) -> bool {
        self.flags.contains(ProcessFlags::FOLLOW_FORK)
    }

    /// Override whether children of this thread are expected to be traced.
    pub fn set_follow_fork(&mut self, follow: bool) {
        self.flags.set(ProcessFlags::FOLLOW_FORK, follow);
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref()
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut()
    }

    /// Attach user data to the thread, dropping any previous data.
    pub fn set_user_data<T: Any>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.user_data.take()
    }
}

/// A stopped traced thread, with the means to inspect and modify it.
///
/// Handed to callbacks. Operations on a tracee that died since it was last seen stopped
/// fail with [`Error::TraceeDied`].
pub struct Tracee<'a> {
    process: &'a mut Process,
    ptrace: &'a dyn Ptrace,
    memory: &'a Memory,
}

impl<'a> Tracee<'a> {
    pub fn new(process: &'a mut Process, ptrace: &'a dyn Ptrace, memory: &'a Memory) -> Self {
        Self { process, ptrace, memory }
    }

    pub fn process(&self) -> &Process {
        self.process
    }

    pub fn registers(&self) -> Result<Registers> {
        let tid = self.tid();
        self.ptrace.get_registers(tid).died_if_esrch(tid, "getregs")
    }

    pub fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        let tid = self.tid();
        self.ptrace.set_registers(tid, regs).died_if_esrch(tid, "setregs")
    }

    /// Decode the syscall number from `regs`, reading the trapping instruction if needed.
    pub fn syscall_number(&self, regs: &Registers) -> Result<i64> {
        let (tid, abi) = (self.tid(), self.abi());

        regs.syscall_number(abi, |addr| {
            let mut insn = [0u8; 4];
            let count = self.memory.read(self.ptrace, tid, abi, addr, &mut insn)?;

            if count < insn.len() {
                return Err(Error::Memory { pid: tid, addr, source: Errno::EFAULT });
            }

            Ok(u32::from_ne_bytes(insn))
        })
    }

    pub fn argument(&self, regs: &Registers, index: usize) -> Result<i64> {
        regs.argument(self.abi(), index)
    }

    pub fn return_value(&self, regs: &Registers) -> Result<(i64, Option<Errno>)> {
        regs.return_value(self.abi())
    }

    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        self.memory.read(self.ptrace, self.tid(), self.abi(), addr, buf)
    }

    /// Read a NUL-terminated string into `buf`, returning its length.
    pub fn read_string(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        self.memory.read_until_nul(self.ptrace, self.tid(), self.abi(), addr, buf)
    }

    pub fn read_string_array(&self, array: u64, index: usize, buf: &mut [u8]) -> Result<Option<usize>> {
        self.memory.read_string_array(self.ptrace, self.tid(), self.abi(), array, index, buf)
    }

    pub fn write_memory(&self, addr: u64, buf: &[u8]) -> Result<usize> {
        self.memory.write(self.ptrace, self.tid(), self.abi(), addr, buf)
    }

    /// Send a signal to the thread with `tgkill(2)`, addressing it within its thread
    /// group if it is a clone, and as its own thread group otherwise.
    pub fn kill(&self, sig: c_int) -> Result<()> {
        let tid = self.tid();
        let tgid = if self.is_clone() { self.tgid() } else { Some(tid) };

        self.ptrace.kill(tid, tgid, sig).died_if_esrch(tid, "kill")
    }

    /// Let the thread run freely: detach it if it was attached, continue it otherwise.
    pub fn resume(&self, sig: c_int) -> Result<()> {
        let tid = self.tid();

        if self.is_attached() {
            self.ptrace.detach(tid, sig).died_if_esrch(tid, "detach")
        } else {
            self.ptrace.resume(tid, sig).died_if_esrch(tid, "resume")
        }
    }
}

impl Deref for Tracee<'_> {
    type Target = Process;

    fn deref(&self) -> &Process {
        self.process
    }
}

impl DerefMut for Tracee<'_> {
    fn deref_mut(&mut self) -> &mut Process {
        self.process
    }
}
