use std::ffi::CString;

use nix::errno::Errno;
use nix::unistd::{fork, ForkResult, Pid};

use crate::callback::Callbacks;
use crate::error::{ChildError, Error, Result};
use crate::intr::Interrupts;
use crate::trace;


/// Command to spawn as a child process to be traced.
#[derive(Clone, Debug)]
pub struct Command {
    /// Path or name of the executable. Defaults to `argv[0]`.
    program: CString,

    /// Argument vector to pass to `exec*()`.
    argv: Vec<CString>,

    /// Environment to pass to `execve()`. The tracer's environment is inherited if unset.
    env: Option<Vec<CString>>,

    /// Search `PATH` for `program`, like `execvp()`.
    search_path: bool,
}

fn cstrings(strings: Vec<impl Into<Vec<u8>>>) -> Result<Vec<CString>> {
    strings
        .into_iter()
        .map(|s| CString::new(s).map_err(|_| Error::OS(Errno::EINVAL)))
        .collect()
}

// NULL-terminated pointer array. Heap-allocates, so it must be built before forking.
fn pointers(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl Command {
    /// Command running `argv[0]` with arguments `argv`, which must not be empty.
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self> {
        let argv = cstrings(argv)?;

        let program = argv.first().cloned().ok_or(Error::OS(Errno::EINVAL))?;

        Ok(Self { program, argv, env: None, search_path: false })
    }

    /// Execute `program` instead of `argv[0]`.
    pub fn program(mut self, program: impl Into<Vec<u8>>) -> Result<Self> {
        self.program = CString::new(program).map_err(|_| Error::OS(Errno::EINVAL))?;
        Ok(self)
    }

    /// Replace the environment of the command, as `KEY=value` strings.
    pub fn env(mut self, env: Vec<impl Into<Vec<u8>>>) -> Result<Self> {
        self.env = Some(cstrings(env)?);
        Ok(self)
    }

    /// Look up the program in `PATH`, unless it contains a slash.
    ///
    /// Ignored if an environment is set.
    pub fn search_path(mut self, search_path: bool) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// Fork a child which requests `PTRACE_TRACEME`, puts back the signal dispositions
    /// and mask replaced by `interrupts`, stops itself with `SIGSTOP`, then execs the
    /// command.
    ///
    /// If the child fails before or during the exec, it exits with the code returned by
    /// [`Callbacks::child_error()`].
    pub(crate) fn fork_exec<C: Callbacks + ?Sized>(
        &self,
        callbacks: &C,
        interrupts: &Interrupts,
    ) -> Result<Pid> {
        let argv = pointers(&self.argv);
        let envp = self.env.as_deref().map(pointers);

        // SAFETY: the child only makes async-signal-safe calls before exec or `_exit()`.
        match unsafe { fork() }.map_err(|source| Error::Fork { source })? {
            ForkResult::Child => {
                if trace::trace_me().is_err() || interrupts.restore().is_err() {
                    // SAFETY: `_exit()` is async-signal-safe.
                    unsafe { libc::_exit(callbacks.child_error(ChildError::Setup)) };
                }

                // SAFETY: async-signal-safe calls on pointer arrays built before forking.
                unsafe {
                    libc::kill(libc::getpid(), libc::SIGSTOP);

                    match &envp {
                        Some(envp) => libc::execve(self.program.as_ptr(), argv.as_ptr(), envp.as_ptr()),
                        None if self.search_path => libc::execvp(self.program.as_ptr(), argv.as_ptr()),
                        None => libc::execv(self.program.as_ptr(), argv.as_ptr()),
                    };

                    libc::_exit(callbacks.child_error(ChildError::Exec))
                }
            },
            ForkResult::Parent { child } => Ok(child),
        }
    }
}
