//! Handling of signals sent to the tracer itself.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use tracing::warn;

use crate::error::Result;


/// Last interrupting signal received, or 0.
static INTERRUPTED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_interrupt(sig: c_int) {
    INTERRUPTED.store(sig, Ordering::SeqCst);
}

const INTERRUPTING: [Signal; 5] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGPIPE,
    Signal::SIGTERM,
];

/// How the tracer reacts to `SIGHUP`, `SIGINT`, `SIGQUIT`, `SIGPIPE` and `SIGTERM`.
///
/// Whatever the policy, `SIGTTOU` and `SIGTTIN` are ignored.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Interrupt {
    /// Leave the signal dispositions alone.
    Anywhere,

    /// Block the signals except while waiting for tracees, and report them to
    /// [`Callbacks::interrupt()`](crate::Callbacks::interrupt) once the wait returns.
    #[default]
    WhileWait,

    /// Ignore the signals.
    Never,

    /// Ignore the signals, and `SIGTSTP` too.
    BlockTstpToo,
}

/// An installed [`Interrupt`] policy.
///
/// Dropping it restores the signal dispositions and mask it replaced.
pub(crate) struct Interrupts {
    policy: Interrupt,
    blocked: SigSet,
    saved_mask: SigSet,
    saved_actions: Vec<(Signal, SigAction)>,
}

impl Interrupts {
    /// Set the signal dispositions and mask of the calling process for `policy`.
    pub(crate) fn install(policy: Interrupt) -> Result<Self> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let record = SigAction::new(SigHandler::Handler(record_interrupt), SaFlags::empty(), SigSet::empty());

        let mut changes = vec![(Signal::SIGTTOU, ignore), (Signal::SIGTTIN, ignore)];
        let mut blocked = SigSet::empty();

        match policy {
            Interrupt::Anywhere => {},
            Interrupt::WhileWait => {
                for sig in INTERRUPTING {
                    blocked.add(sig);
                    changes.push((sig, record));
                }
            },
            Interrupt::Never | Interrupt::BlockTstpToo => {
                if policy == Interrupt::BlockTstpToo {
                    changes.push((Signal::SIGTSTP, ignore));
                }

                changes.extend(INTERRUPTING.iter().map(|&sig| (sig, ignore)));
            },
        }

        let mut saved_mask = SigSet::empty();
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut saved_mask))?;

        let mut interrupts = Self {
            policy,
            blocked,
            saved_mask,
            saved_actions: Vec::with_capacity(changes.len()),
        };

        for (sig, action) in changes {
            // SAFETY: installing `SIG_IGN`, or a handler that only stores to an atomic.
            let old = unsafe { signal::sigaction(sig, &action)? };
            interrupts.saved_actions.push((sig, old));
        }

        interrupts.block()?;

        Ok(interrupts)
    }

    /// Put back the signal dispositions and mask found by [`Interrupts::install()`].
    ///
    /// Only makes async-signal-safe calls, so a forked child may use it before exec.
    pub(crate) fn restore(&self) -> std::result::Result<(), Errno> {
        let mut res = Ok(());

        for (sig, action) in &self.saved_actions {
            // SAFETY: the action was in place before `install()`.
            if let Err(errno) = unsafe { signal::sigaction(*sig, action) } {
                res = Err(errno);
            }
        }

        if let Err(errno) = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.saved_mask), None) {
            res = Err(errno);
        }

        res
    }

    pub(crate) fn policy(&self) -> Interrupt {
        self.policy
    }

    /// Let interrupting signals through, before waiting.
    pub(crate) fn unblock(&self) -> Result<()> {
        if self.policy == Interrupt::WhileWait {
            signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&self.blocked), None)?;
        }

        Ok(())
    }

    /// Hold back interrupting signals, while decoding.
    pub(crate) fn block(&self) -> Result<()> {
        if self.policy == Interrupt::WhileWait {
            signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&self.blocked), None)?;
        }

        Ok(())
    }

    /// True if an interrupt was received and not yet taken.
    pub(crate) fn pending(&self) -> bool {
        self.policy == Interrupt::WhileWait && INTERRUPTED.load(Ordering::SeqCst) != 0
    }

    /// Take the last interrupting signal received, if any.
    pub(crate) fn take(&self) -> Option<c_int> {
        if self.policy != Interrupt::WhileWait {
            return None;
        }

        match INTERRUPTED.swap(0, Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }
}

impl Drop for Interrupts {
    fn drop(&mut self) {
        if let Err(errno) = self.restore() {
            warn!(policy = ?self.policy, "could not restore signal dispositions: {errno}");
        }
    }
}

impl fmt::Debug for Interrupts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupts")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
