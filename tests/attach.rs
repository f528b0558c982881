use std::process::Command;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use traceloop::{Callbacks, Config, Context, ErrorKind, Failure, Flow, Interrupt, Pid, Process, Status, Tracee};

#[derive(Default)]
struct KillOnStartup {
    started: Vec<Pid>,
    gone: Vec<Pid>,
    killed: Vec<(Pid, Status)>,
    errors: Vec<ErrorKind>,
}

impl Callbacks for KillOnStartup {
    fn error(&mut self, failure: &Failure<'_>) {
        eprintln!("{failure}");
        self.errors.push(failure.kind());
    }

    fn startup(&mut self, tracee: &mut Tracee<'_>, _parent: Option<&Process>) {
        self.started.push(tracee.tid());

        if let Err(err) = tracee.kill(libc::SIGKILL) {
            eprintln!("could not kill {}: {err}", tracee.tid());
        }
    }

    fn teardown(&mut self, process: &Process) {
        self.gone.push(process.tid());
    }

    fn exit(&mut self, tid: Pid, status: Status) -> Flow {
        self.killed.push((tid, status));
        Flow::empty()
    }
}

fn config() -> Config {
    let mut config = Config::new();
    config.set_interrupt(Interrupt::Anywhere);
    config
}

#[test]
#[timeout(2000)]
fn test_attach_and_kill() -> Result<()> {
    let child = Command::new("sleep").arg("60").spawn()?;
    let pid = Pid::from_raw(child.id() as i32);

    let mut ctx = Context::new(config(), KillOnStartup::default())?;
    ctx.attach(pid, None)?;

    assert!(ctx.registry().get(pid).unwrap().is_attached());

    assert_eq!(ctx.run(), 0);
    assert_eq!(ctx.process_count(), 0);

    let seen = ctx.callbacks();
    assert_eq!(seen.started, vec![pid]);
    assert!(seen.errors.is_empty());

    // The kill may win the race with the resumption of the initial stop.
    if seen.gone.is_empty() {
        assert_eq!(seen.killed.len(), 1);
        assert_eq!(seen.killed[0].0, pid);
        assert_eq!(seen.killed[0].1.term_signal(), Some(libc::SIGKILL));
    } else {
        assert_eq!(seen.gone, vec![pid]);
    }

    Ok(())
}

#[test]
fn test_attach_missing_process() -> Result<()> {
    let mut ctx = Context::new(config(), KillOnStartup::default())?;

    let err = ctx.attach(Pid::from_raw(i32::MAX - 1), None).unwrap_err();

    assert!(err.tracee_died());
    assert_eq!(ctx.error(), Some(ErrorKind::Attach));
    assert_eq!(ctx.callbacks().errors, vec![ErrorKind::Attach]);
    assert_eq!(ctx.process_count(), 0);

    Ok(())
}
