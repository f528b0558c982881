//! Configuration and owner of a tracing session.

use std::any::Any;
use std::fs;

use nix::errno::Errno;
use nix::sys::ptrace::Options;
use tracing::{debug, warn};

use crate::callback::Callbacks;
use crate::cmd::Command;
use crate::error::{Error, ErrorKind, Failure, Result};
use crate::intr::{Interrupt, Interrupts};
use crate::memory::Memory;
use crate::process::{Pid, ProcessFlags, Step, Tracee};
use crate::registry::Registry;
use crate::trace::{Kernel, Ptrace};


/// Options set for every tracee, whatever the configuration.
pub const REQUIRED_OPTIONS: Options = Options::PTRACE_O_TRACESYSGOOD;

pub const DEFAULT_OPTIONS: Options = REQUIRED_OPTIONS.union(Options::PTRACE_O_TRACEEXEC);

/// Encode a kernel release as compared by [`Config::os_release()`].
pub const fn kernel_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) + (minor << 8) + patch
}

/// Parse the leading `major.minor.patch` of a kernel release string.
fn parse_release(release: &str) -> Option<u32> {
    let mut parts = release
        .split(|c: char| !c.is_ascii_digit())
        .take(3)
        .map(|part| part.parse::<u32>().ok());

    let major = parts.next().flatten()?;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);

    Some(kernel_version(major, minor.min(255), patch.min(255)))
}

fn detect_os_release() -> u32 {
    match nix::sys::utsname::uname() {
        Ok(uts) => {
            let release = uts.release().to_string_lossy();
            parse_release(&release).unwrap_or(u32::MAX)
        },
        Err(err) => {
            warn!("could not determine kernel release: {err}");
            u32::MAX
        },
    }
}

/// Settings of a [`Context`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    options: Options,
    default_step: Step,
    interrupt: Interrupt,
    os_release: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Configuration with [`DEFAULT_OPTIONS`], syscall stepping, the
    /// [`Interrupt::WhileWait`] policy and the release of the running kernel.
    pub fn new() -> Self {
        Self {
            options: DEFAULT_OPTIONS,
            default_step: Step::Syscall,
            interrupt: Interrupt::default(),
            os_release: detect_os_release(),
        }
    }

    /// Return the ptrace options set on each tracee when it first stops.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options set on each tracee when it first stops.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, even if unset in the passed value.
    pub fn set_options(&mut self, options: Options) {
        self.options = options | REQUIRED_OPTIONS;
    }

    /// True if children of tracees are traced automatically.
    pub fn follows_fork(&self) -> bool {
        self.options.intersects(
            Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEVFORK | Options::PTRACE_O_TRACECLONE,
        )
    }

    /// Step mode of processes whose own mode is [`Step::Default`].
    pub fn default_step(&self) -> Step {
        self.default_step
    }

    pub fn set_default_step(&mut self, step: Step) {
        self.default_step = step;
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt
    }

    pub fn set_interrupt(&mut self, interrupt: Interrupt) {
        self.interrupt = interrupt;
    }

    /// Kernel release, as encoded by [`kernel_version()`].
    pub fn os_release(&self) -> u32 {
        self.os_release
    }

    pub fn set_os_release(&mut self, os_release: u32) {
        self.os_release = os_release;
    }

    /// Resolve the step mode of a process.
    pub(crate) fn resolve_step(&self, step: Step) -> Step {
        match (step, self.default_step) {
            (Step::Default, Step::Default) => Step::Syscall,
            (Step::Default, default) => default,
            (step, _) => step,
        }
    }
}

/// A tracing session: the traced processes, the callbacks and the last error.
///
/// Dropping the context drops every remaining process record, with its user data.
/// Processes still traced are not detached.
pub struct Context<C: Callbacks, P: Ptrace = Kernel> {
    pub(crate) ptrace: P,
    pub(crate) memory: Memory,
    pub(crate) registry: Registry,
    pub(crate) config: Config,
    pub(crate) error: Option<ErrorKind>,
    pub(crate) fatal: bool,
    pub(crate) callbacks: C,
    pub(crate) interrupts: Interrupts,
    user_data: Option<Box<dyn Any>>,
}

impl<C: Callbacks> Context<C> {
    /// Create a context tracing with the running kernel.
    ///
    /// Installs the configured [`Interrupt`] policy for the whole tracer process.
    pub fn new(config: Config, callbacks: C) -> Result<Self> {
        Self::with_ptrace(config, callbacks, Kernel)
    }
}

impl<C: Callbacks, P: Ptrace> Context<C, P> {
    pub fn with_ptrace(config: Config, callbacks: C, ptrace: P) -> Result<Self> {
        let interrupts = Interrupts::install(config.interrupt())?;
        debug!(policy = ?interrupts.policy(), options = ?config.options(), "new context");

        Ok(Self {
            ptrace,
            memory: Memory::new(),
            registry: Registry::new(),
            config,
            error: None,
            fatal: false,
            callbacks,
            interrupts,
            user_data: None,
        })
    }

    /// Spawn `cmd` as a new tracee.
    ///
    /// The child stops itself before executing the command, so no event is missed.
    pub fn spawn(&mut self, cmd: &Command) -> Result<Pid> {
        let pid = match cmd.fork_exec(&self.callbacks, &self.interrupts) {
            Ok(pid) => pid,
            Err(err) => {
                let errno = err.errno().unwrap_or(Errno::UnknownErrno);
                self.report(&Failure::Fork { context: "fork", errno }, false);
                return Err(err);
            },
        };

        let step = Step::Default;
        if let Err(err) = self.registry.insert(pid, None, step, ProcessFlags::IGNORE_ONE_SIGSTOP) {
            // SAFETY: plain syscall on our own child.
            unsafe { libc::kill(pid.as_raw(), libc::SIGKILL) };
            self.report(&Failure::Alloc { context: "spawn" }, false);
            return Err(err);
        }

        Ok(pid)
    }

    /// Attach to thread `tid`, a member of thread group `tgid` if it is given.
    ///
    /// Attaching to a thread which is already attached does nothing.
    pub fn attach(&mut self, tid: Pid, tgid: Option<Pid>) -> Result<()> {
        if self.registry.get(tid).map_or(false, |p| p.is_attached()) {
            return Ok(());
        }

        if let Err(source) = self.ptrace.attach(tid) {
            self.report(&Failure::Attach { pid: tid, errno: source }, false);
            return Err(Error::Attach { pid: tid, source });
        }

        let mut flags = ProcessFlags::ATTACHED | ProcessFlags::IGNORE_ONE_SIGSTOP;
        if tgid.is_some() {
            flags |= ProcessFlags::CLONE_THREAD;
        }

        if let Err(err) = self.registry.insert(tid, tgid, Step::Default, flags) {
            if let Err(errno) = self.ptrace.kill(tid, tgid, libc::SIGCONT) {
                debug!(pid = %tid, "could not continue unregistered process: {errno}");
            }

            self.report(&Failure::Alloc { context: "attach" }, false);
            return Err(err);
        }

        Ok(())
    }

    /// Attach to every thread of process `pid`, returning the number of threads attached.
    ///
    /// Threads other than `pid` itself are attached as members of its thread group.
    pub fn attach_all(&mut self, pid: Pid) -> Result<usize> {
        let mut attached = 0;

        for entry in fs::read_dir(format!("/proc/{pid}/task"))? {
            let name = entry?.file_name();

            let Some(tid) = name.to_str().and_then(|s| s.parse().ok()).map(Pid::from_raw) else {
                continue;
            };

            let tgid = if tid == pid { None } else { Some(pid) };

            if self.attach(tid, tgid).is_ok() {
                attached += 1;
            }
        }

        if attached == 0 {
            return Err(Error::Attach { pid, source: Errno::ESRCH });
        }

        Ok(attached)
    }

    /// Last error recorded, if any.
    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    /// True if the last error stopped the event loop.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.fatal = false;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn default_step(&self) -> Step {
        self.config.default_step()
    }

    pub fn set_default_step(&mut self, step: Step) {
        self.config.set_default_step(step);
    }

    pub fn process_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    pub fn ptrace(&self) -> &P {
        &self.ptrace
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref()
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut()
    }

    pub fn set_user_data<T: Any>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.user_data.take()
    }

    /// Handle on a registered process, for use between event loop runs.
    pub fn tracee(&mut self, tid: Pid) -> Option<Tracee<'_>> {
        let process = self.registry.get_mut(tid)?;
        Some(Tracee::new(process, &self.ptrace, &self.memory))
    }

    /// Record a failure, and pass it to the error callback.
    pub(crate) fn report(&mut self, failure: &Failure<'_>, fatal: bool) {
        warn!(kind = ?failure.kind(), fatal, "{failure}");

        self.error = Some(failure.kind());
        self.fatal = fatal;
        self.callbacks.error(failure);
    }
}
