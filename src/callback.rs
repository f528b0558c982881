//! The extension surface of the event loop.

use bitflags::bitflags;
use libc::c_int;

use crate::abi::Abi;
use crate::error::{ChildError, ErrorKind, Failure};
use crate::event::Status;
use crate::process::{Pid, Process, Tracee};
use crate::regs::Registers;


bitflags! {
    /// Instructions returned by callbacks to the event loop.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Flow: u32 {
        /// Stop the event loop, recording [`ErrorKind::CallbackAbort`].
        ///
        /// Traced processes are left as they are. Detaching or killing them is up to
        /// the caller.
        const ABORT = 1 << 0;

        /// Forget the process, without resuming it.
        const DROP = 1 << 1;

        /// Suppress the signal of a signal-delivery stop.
        const SIGIGN = 1 << 2;
    }
}

/// Summary of a finished event loop, handed to [`Callbacks::cleanup()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Outcome {
    /// Last error recorded, if any.
    pub error: Option<ErrorKind>,

    /// Whether that error stopped the loop.
    pub fatal: bool,

    /// Number of processes still registered.
    pub process_count: usize,
}

impl Outcome {
    /// Exit code derived from whether an error was recorded.
    pub fn exit_code(&self) -> i32 {
        if self.error.is_some() {
            libc::EXIT_FAILURE
        } else {
            libc::EXIT_SUCCESS
        }
    }
}

/// Event handlers of the event loop.
///
/// Every method has a default. Event handlers do nothing and let the loop carry on;
/// the error handlers report to stderr.
#[allow(unused_variables)]
pub trait Callbacks {
    /// Report a failure of the tracer.
    fn error(&mut self, failure: &Failure<'_>) {
        eprintln!("traceloop error: {failure}");
    }

    /// Report a failure in a spawned child, before it execs, and return its exit code.
    ///
    /// Runs in the forked child, so it must only use async-signal-safe operations. In
    /// particular, it must not allocate.
    fn child_error(&self, error: ChildError) -> i32 {
        let prefix = b"traceloop child error: ";
        let msg = error.as_str().as_bytes();

        // SAFETY: `write(2)` is async-signal-safe, and the buffers are valid.
        unsafe {
            libc::write(libc::STDERR_FILENO, prefix.as_ptr().cast(), prefix.len());
            libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
            libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        }

        libc::EXIT_FAILURE
    }

    /// The process stopped for the first time. `parent` is its creator, if it was
    /// created by a traced process.
    fn startup(&mut self, tracee: &mut Tracee<'_>, parent: Option<&Process>) {}

    /// The process vanished while being operated on, and is about to be forgotten.
    fn teardown(&mut self, process: &Process) {}

    /// The event loop finished. Returns the exit code of [`Context::run()`](crate::Context::run).
    fn cleanup(&mut self, outcome: &Outcome) -> i32 {
        outcome.exit_code()
    }

    /// Syscall entry or exit stop.
    fn syscall(&mut self, tracee: &mut Tracee<'_>, regs: &Registers, entering: bool) -> Flow {
        Flow::empty()
    }

    /// The process completed an `execve()`. `old_abi` is its ABI before the exec.
    fn exec(&mut self, tracee: &mut Tracee<'_>, regs: &Registers, old_abi: Abi) -> Flow {
        Flow::empty()
    }

    /// The process is about to exit, with `PTRACE_O_TRACEEXIT`.
    fn pre_exit(&mut self, tracee: &mut Tracee<'_>, status: Status) -> Flow {
        Flow::empty()
    }

    /// A seccomp filter returned `SECCOMP_RET_TRACE` with `data`.
    fn seccomp(&mut self, tracee: &mut Tracee<'_>, data: u64) -> Flow {
        Flow::empty()
    }

    /// Signal-delivery stop. The signal is delivered unless [`Flow::SIGIGN`] is set.
    fn signal(&mut self, tracee: &mut Tracee<'_>, status: Status) -> Flow {
        Flow::empty()
    }

    /// The process exited or was killed. Its record is already gone.
    fn exit(&mut self, tid: Pid, status: Status) -> Flow {
        Flow::empty()
    }

    /// The tracer received an interrupting signal, per the [`Interrupt`](crate::Interrupt)
    /// policy.
    fn interrupt(&mut self, sig: c_int) -> Flow {
        Flow::ABORT
    }
}

/// Callbacks with every default.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCallbacks;

impl Callbacks for DefaultCallbacks {}
