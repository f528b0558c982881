use std::fs;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use traceloop::{Abi, Callbacks, Command, Config, Context, Flow, Interrupt, Pid, Registers, Tracee};

/// `SIGHUP`, `SIGINT`, `SIGQUIT`, `SIGPIPE` and `SIGTERM`.
const INTERRUPTING: u64 = 0x5007;

/// `SIGTTIN` and `SIGTTOU`.
const TTY_INPUT_OUTPUT: u64 = 0x30_0000;

#[derive(Default)]
struct SignalState {
    masks: Vec<(Pid, u64, u64)>,
}

fn status_field(status: &str, name: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with(name))?;
    let hex = line.split_whitespace().nth(1)?;

    u64::from_str_radix(hex, 16).ok()
}

impl Callbacks for SignalState {
    fn exec(&mut self, tracee: &mut Tracee<'_>, _regs: &Registers, _old_abi: Abi) -> Flow {
        let tid = tracee.tid();

        match fs::read_to_string(format!("/proc/{tid}/status")) {
            Ok(status) => {
                let blocked = status_field(&status, "SigBlk:").unwrap_or(u64::MAX);
                let ignored = status_field(&status, "SigIgn:").unwrap_or(u64::MAX);
                self.masks.push((tid, blocked, ignored));
            },
            Err(err) => eprintln!("{tid}: could not read status: {err}"),
        }

        Flow::empty()
    }
}

#[test]
#[timeout(2000)]
fn test_spawned_program_gets_tracer_signal_state() -> Result<()> {
    let config = Config::new();
    assert_eq!(config.interrupt(), Interrupt::WhileWait);

    let mut ctx = Context::new(config, SignalState::default())?;

    let cmd = Command::new(vec!["true"])?.search_path(true);
    let pid = ctx.spawn(&cmd)?;

    assert_eq!(ctx.run(), 0);

    let masks = &ctx.callbacks().masks;
    assert_eq!(masks.len(), 1);

    let (tid, blocked, ignored) = masks[0];
    assert_eq!(tid, pid);
    assert_eq!(blocked & INTERRUPTING, 0, "blocked: {blocked:#x}");
    assert_eq!(ignored & TTY_INPUT_OUTPUT, 0, "ignored: {ignored:#x}");

    Ok(())
}
