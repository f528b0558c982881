use std::fmt;
use std::io;

use nix::errno::Errno;

use crate::process::{Pid, Process};


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Tracee = {pid} died during `{request}` request")]
    TraceeDied {
        pid: Pid,
        request: &'static str,
        source: Errno,
    },

    #[error("Request `{request}` failed for tracee = {pid}")]
    Ptrace {
        pid: Pid,
        request: &'static str,
        source: Errno,
    },

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: Errno,
    },

    #[error("Could not spawn tracee")]
    Fork { source: Errno },

    #[error("Could not wait on tracees")]
    Wait { source: Errno },

    #[error("Could not access memory of tracee = {pid} at address = {addr:#x}")]
    Memory {
        pid: Pid,
        addr: u64,
        source: Errno,
    },

    #[error("Syscall argument index = {index} is out of range")]
    InvalidArgument { index: usize },

    #[error("Unsupported or indeterminate ABI")]
    UnsupportedAbi,

    #[error("Unknown syscall trap instruction = {insn:#010x}")]
    UnknownSyscallTrap { insn: u32 },

    #[error("Could not allocate a record for tracee = {pid}")]
    Alloc { pid: Pid },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] Errno),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Underlying OS error code, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        use Error::*;

        match self {
            TraceeDied { source, .. } |
            Ptrace { source, .. } |
            Attach { source, .. } |
            Fork { source } |
            Wait { source } |
            Memory { source, .. } |
            OS(source) => Some(*source),
            InvalidArgument { .. } => Some(Errno::EINVAL),
            UnsupportedAbi => Some(Errno::ENOTSUP),
            UnknownSyscallTrap { .. } => Some(Errno::EFAULT),
            Alloc { .. } => Some(Errno::ENOMEM),
            IO(err) => err.raw_os_error().map(Errno::from_raw),
            Internal(_) => None,
        }
    }

    /// True if the error was caused by the tracee disappearing (`ESRCH`).
    pub fn tracee_died(&self) -> bool {
        self.errno() == Some(Errno::ESRCH)
    }
}

pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, pid: Pid, request: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self, pid: Pid, request: &'static str) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, request, source }
            } else {
                Error::Ptrace { pid, request, source }
            }
        })
    }
}

/// Error conditions recorded by a [`Context`](crate::Context).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    CallbackAbort,
    Alloc,
    Attach,
    Fork,
    Wait,
    Trace,
    Process,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        use ErrorKind::*;

        match self {
            CallbackAbort => "Operation aborted by callback",
            Alloc => "Failed to allocate memory",
            Attach => "Failed to attach",
            Fork => "Failed to spawn new process",
            Wait => "waitpid() failed",
            Trace => "ptrace() failed",
            Process => "Process misbehave",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised in a freshly forked child, before it execs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChildError {
    Setup,
    Exec,
}

impl ChildError {
    pub fn as_str(self) -> &'static str {
        match self {
            ChildError::Setup => "Failed to set up trace",
            ChildError::Exec => "execve() failed",
        }
    }
}

impl fmt::Display for ChildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of a failure, as handed to [`Callbacks::error()`](crate::Callbacks::error).
#[derive(Clone, Copy, Debug)]
pub enum Failure<'a> {
    Alloc {
        context: &'static str,
    },
    Attach {
        pid: Pid,
        errno: Errno,
    },
    Fork {
        context: &'static str,
        errno: Errno,
    },
    Wait {
        errno: Errno,
    },
    Trace {
        process: &'a Process,
        context: &'static str,
        errno: Errno,
    },
    Process {
        process: &'a Process,
        context: &'static str,
    },
}

impl Failure<'_> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Failure::Alloc { .. } => ErrorKind::Alloc,
            Failure::Attach { .. } => ErrorKind::Attach,
            Failure::Fork { .. } => ErrorKind::Fork,
            Failure::Wait { .. } => ErrorKind::Wait,
            Failure::Trace { .. } => ErrorKind::Trace,
            Failure::Process { .. } => ErrorKind::Process,
        }
    }

    /// The affected tracee, when the failure concerns a single one.
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Failure::Attach { pid, .. } => Some(*pid),
            Failure::Trace { process, .. } |
            Failure::Process { process, .. } => Some(process.tid()),
            _ => None,
        }
    }
}

impl fmt::Display for Failure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind();

        match self {
            Failure::Alloc { context } => {
                write!(f, "{kind}: {context} (errno:{} {})", Errno::ENOMEM as i32, Errno::ENOMEM.desc())
            },
            Failure::Attach { pid, errno } => {
                write!(f, "{kind} (tid:{pid} errno:{} {})", *errno as i32, errno.desc())
            },
            Failure::Fork { context, errno } => {
                write!(f, "{kind}: {context} (errno:{} {})", *errno as i32, errno.desc())
            },
            Failure::Wait { errno } => {
                write!(f, "{kind} (errno:{} {})", *errno as i32, errno.desc())
            },
            Failure::Trace { process, context, errno } => {
                write!(
                    f,
                    "{kind} (tid:{}[{}] {context} errno:{} {})",
                    process.tid(),
                    process.abi(),
                    *errno as i32,
                    errno.desc(),
                )
            },
            Failure::Process { process, context } => {
                write!(f, "{kind} (tid:{}[{}] {context})", process.tid(), process.abi())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_died_if_esrch() {
        let pid = Pid::from_raw(7);

        let err = Err::<(), _>(Errno::ESRCH).died_if_esrch(pid, "step").unwrap_err();
        assert!(matches!(err, Error::TraceeDied { request: "step", .. }));
        assert!(err.tracee_died());

        let err = Err::<(), _>(Errno::EPERM).died_if_esrch(pid, "step").unwrap_err();
        assert!(matches!(err, Error::Ptrace { .. }));
        assert!(!err.tracee_died());
        assert_eq!(err.errno(), Some(Errno::EPERM));
    }

    #[test]
    fn test_errno_of_decode_errors() {
        assert_eq!(Error::InvalidArgument { index: 6 }.errno(), Some(Errno::EINVAL));
        assert_eq!(Error::UnsupportedAbi.errno(), Some(Errno::ENOTSUP));
        assert_eq!(Error::UnknownSyscallTrap { insn: 0 }.errno(), Some(Errno::EFAULT));
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure::Attach { pid: Pid::from_raw(42), errno: Errno::EPERM };
        assert_eq!(failure.kind(), ErrorKind::Attach);
        assert_eq!(failure.pid(), Some(Pid::from_raw(42)));

        let line = failure.to_string();
        assert!(line.starts_with("Failed to attach (tid:42 errno:1 "));

        let failure = Failure::Wait { errno: Errno::EINVAL };
        assert!(failure.to_string().starts_with("waitpid() failed (errno:22 "));
    }
}
