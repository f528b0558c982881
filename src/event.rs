//! Decoding of raw `waitpid()` status words.
//!
//! Signals are kept as raw numbers, so realtime signals and the `SIGTRAP | 0x80`
//! syscall-stop marker survive decoding.

use std::fmt;

use libc::c_int;


/// Marker OR'd into the stop signal of a syscall stop, with `PTRACE_O_TRACESYSGOOD`.
pub const SYSCALL_TRAP_BIT: c_int = 0x80;

/// Stop signal of a syscall stop.
pub const SYSCALL_TRAP: c_int = libc::SIGTRAP | SYSCALL_TRAP_BIT;

/// A ptrace event, as reported in bits 16 and up of a stop status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Event {
    /// Not an event stop.
    None,
    Fork,
    Vfork,
    Clone,
    Exec,
    VforkDone,
    /// Pre-exit notification, with `PTRACE_O_TRACEEXIT`.
    Exit,
    Seccomp,
    /// Some event unknown to this crate.
    Unknown(c_int),
}

impl Event {
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            0 => Event::None,
            libc::PTRACE_EVENT_FORK => Event::Fork,
            libc::PTRACE_EVENT_VFORK => Event::Vfork,
            libc::PTRACE_EVENT_CLONE => Event::Clone,
            libc::PTRACE_EVENT_EXEC => Event::Exec,
            libc::PTRACE_EVENT_VFORK_DONE => Event::VforkDone,
            libc::PTRACE_EVENT_EXIT => Event::Exit,
            libc::PTRACE_EVENT_SECCOMP => Event::Seccomp,
            _ => Event::Unknown(raw),
        }
    }

    /// True for the events which report a newly created child.
    pub fn is_fork(self) -> bool {
        matches!(self, Event::Fork | Event::Vfork | Event::Clone)
    }
}

/// A raw wait status, as returned by `waitpid()`.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Status(c_int);

impl Status {
    pub const fn from_raw(raw: c_int) -> Self {
        Status(raw)
    }

    pub const fn as_raw(self) -> c_int {
        self.0
    }

    pub fn exited(self) -> bool {
        libc::WIFEXITED(self.0)
    }

    /// Exit code, if the process exited normally.
    pub fn exit_status(self) -> Option<c_int> {
        self.exited().then(|| libc::WEXITSTATUS(self.0))
    }

    pub fn signaled(self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    /// Number of the signal that killed the process, if it was killed.
    pub fn term_signal(self) -> Option<c_int> {
        self.signaled().then(|| libc::WTERMSIG(self.0))
    }

    pub fn core_dumped(self) -> bool {
        self.signaled() && libc::WCOREDUMP(self.0)
    }

    pub fn stopped(self) -> bool {
        libc::WIFSTOPPED(self.0)
    }

    /// Stop signal, including the syscall-stop marker bit, if the process is stopped.
    pub fn stop_signal(self) -> Option<c_int> {
        self.stopped().then(|| libc::WSTOPSIG(self.0))
    }

    /// True if the process is gone, by exit or by signal.
    pub fn terminated(self) -> bool {
        self.exited() || self.signaled()
    }

    pub fn event(self) -> Event {
        if !self.stopped() {
            return Event::None;
        }

        Event::from_raw((self.0 >> 16) & 0xffff)
    }

    pub fn is_syscall_trap(self) -> bool {
        self.stop_signal() == Some(SYSCALL_TRAP)
    }
}

impl From<c_int> for Status {
    fn from(raw: c_int) -> Self {
        Status(raw)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.exit_status() {
            write!(f, "Status(exited: {code})")
        } else if let Some(sig) = self.term_signal() {
            let core = if self.core_dumped() { ", core dumped" } else { "" };
            write!(f, "Status(killed: {sig}{core})")
        } else if let Some(sig) = self.stop_signal() {
            match self.event() {
                Event::None => write!(f, "Status(stopped: {sig:#x})"),
                event => write!(f, "Status(stopped: {sig:#x}, {event:?})"),
            }
        } else {
            write!(f, "Status({:#x})", self.0)
        }
    }
}
