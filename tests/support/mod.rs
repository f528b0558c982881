#![allow(unused)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::mem::size_of;

use libc::{c_int, c_long};
use nix::errno::Errno;
use traceloop::{
    x86, Abi, Callbacks, Config, Context, ErrorKind, Failure, Flow, Interrupt, Options,
    Outcome, Pid, Process, Ptrace, Registers, Status, Tracee,
};

macro_rules! pid {
    ($raw: expr) => {
        traceloop::Pid::from_raw($raw)
    };
}

pub const WORD: usize = size_of::<c_long>();

pub fn stopped(sig: c_int) -> Status {
    Status::from_raw((sig << 8) | 0x7f)
}

pub fn syscall_trap() -> Status {
    stopped(libc::SIGTRAP | 0x80)
}

pub fn event(event: c_int) -> Status {
    Status::from_raw((event << 16) | (libc::SIGTRAP << 8) | 0x7f)
}

pub fn exited(code: c_int) -> Status {
    Status::from_raw(code << 8)
}

pub fn killed(sig: c_int) -> Status {
    Status::from_raw(sig)
}

/// Continued, per `WIFCONTINUED()`: neither stopped nor terminated.
pub fn continued() -> Status {
    Status::from_raw(0xffff)
}

pub fn x86_64_regs(cs: u64) -> Registers {
    let mut regs = x86::user_regs_struct::default();
    regs.cs = cs;
    Registers::X86_64(regs)
}

/// A request made to the fake kernel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    Attach(i32),
    Detach(i32, c_int),
    Resume(i32, c_int),
    SingleStep(i32, c_int),
    Syscall(i32, c_int),
    SetOptions(i32),
    SetRegisters(i32),
    Kill(i32, Option<i32>, c_int),
}

/// Scripted stand-in for the kernel.
///
/// Wait results are played back in order, then `ECHILD` is returned. Requests named in
/// `failures` fail for the given pid. Memory is a single mapped region.
#[derive(Default)]
pub struct FakeKernel {
    waits: RefCell<VecDeque<Result<(Pid, Status), Errno>>>,
    event_messages: RefCell<HashMap<i32, VecDeque<u64>>>,
    registers: RefCell<HashMap<i32, Registers>>,
    failures: RefCell<HashMap<(&'static str, i32), Errno>>,
    calls: RefCell<Vec<Call>>,

    region: RefCell<(u64, Vec<u8>)>,
    vm_enosys: Cell<bool>,
    vm_reads: Cell<usize>,
    peeks: Cell<usize>,
    event_message_requests: Cell<usize>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_wait(&self, raw_pid: i32, status: Status) -> &Self {
        self.waits.borrow_mut().push_back(Ok((pid!(raw_pid), status)));
        self
    }

    pub fn push_wait_err(&self, errno: Errno) -> &Self {
        self.waits.borrow_mut().push_back(Err(errno));
        self
    }

    pub fn push_event_message(&self, raw_pid: i32, msg: u64) -> &Self {
        self.event_messages.borrow_mut().entry(raw_pid).or_default().push_back(msg);
        self
    }

    pub fn set_registers_of(&self, raw_pid: i32, regs: Registers) {
        self.registers.borrow_mut().insert(raw_pid, regs);
    }

    pub fn fail(&self, request: &'static str, raw_pid: i32, errno: Errno) {
        self.failures.borrow_mut().insert((request, raw_pid), errno);
    }

    pub fn map(&self, base: u64, bytes: &[u8]) {
        *self.region.borrow_mut() = (base, bytes.to_vec());
    }

    pub fn mapped(&self) -> Vec<u8> {
        self.region.borrow().1.clone()
    }

    pub fn set_vm_enosys(&self, enosys: bool) {
        self.vm_enosys.set(enosys);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn vm_reads(&self) -> usize {
        self.vm_reads.get()
    }

    pub fn peeks(&self) -> usize {
        self.peeks.get()
    }

    pub fn event_message_requests(&self) -> usize {
        self.event_message_requests.get()
    }

    fn check(&self, request: &'static str, pid: Pid) -> Result<(), Errno> {
        match self.failures.borrow().get(&(request, pid.as_raw())) {
            Some(errno) => Err(*errno),
            None => Ok(()),
        }
    }

    fn record(&self, request: &'static str, pid: Pid, call: Call) -> Result<(), Errno> {
        self.check(request, pid)?;
        self.calls.borrow_mut().push(call);
        Ok(())
    }

    /// Offset and length of the mapped bytes at `addr`, up to `len`.
    fn mapped_range(&self, addr: u64, len: usize) -> Option<(usize, usize)> {
        let region = self.region.borrow();
        let (base, bytes) = (region.0, &region.1);
        let end = base + bytes.len() as u64;

        if addr < base || addr >= end {
            return None;
        }

        let offset = (addr - base) as usize;
        Some((offset, len.min(bytes.len() - offset)))
    }
}

impl Ptrace for FakeKernel {
    fn wait(&self) -> Result<(Pid, Status), Errno> {
        self.waits.borrow_mut().pop_front().unwrap_or(Err(Errno::ECHILD))
    }

    fn attach(&self, pid: Pid) -> Result<(), Errno> {
        self.record("attach", pid, Call::Attach(pid.as_raw()))
    }

    fn detach(&self, pid: Pid, sig: c_int) -> Result<(), Errno> {
        self.record("detach", pid, Call::Detach(pid.as_raw(), sig))
    }

    fn resume(&self, pid: Pid, sig: c_int) -> Result<(), Errno> {
        self.record("resume", pid, Call::Resume(pid.as_raw(), sig))
    }

    fn singlestep(&self, pid: Pid, sig: c_int) -> Result<(), Errno> {
        self.record("singlestep", pid, Call::SingleStep(pid.as_raw(), sig))
    }

    fn syscall_step(&self, pid: Pid, sig: c_int) -> Result<(), Errno> {
        self.record("syscall", pid, Call::Syscall(pid.as_raw(), sig))
    }

    fn set_options(&self, pid: Pid, _options: Options) -> Result<(), Errno> {
        self.record("setoptions", pid, Call::SetOptions(pid.as_raw()))
    }

    fn get_registers(&self, pid: Pid) -> Result<Registers, Errno> {
        self.check("getregs", pid)?;

        let regs = self.registers.borrow().get(&pid.as_raw()).copied();
        Ok(regs.unwrap_or_else(|| x86_64_regs(0x33)))
    }

    fn set_registers(&self, pid: Pid, regs: &Registers) -> Result<(), Errno> {
        self.record("setregs", pid, Call::SetRegisters(pid.as_raw()))?;
        self.registers.borrow_mut().insert(pid.as_raw(), *regs);
        Ok(())
    }

    fn get_event_message(&self, pid: Pid) -> Result<u64, Errno> {
        self.check("geteventmsg", pid)?;
        self.event_message_requests.set(self.event_message_requests.get() + 1);

        self.event_messages
            .borrow_mut()
            .get_mut(&pid.as_raw())
            .and_then(VecDeque::pop_front)
            .ok_or(Errno::EINVAL)
    }

    fn kill(&self, tid: Pid, tgid: Option<Pid>, sig: c_int) -> Result<(), Errno> {
        self.record("kill", tid, Call::Kill(tid.as_raw(), tgid.map(Pid::as_raw), sig))
    }

    fn peek_data(&self, pid: Pid, addr: u64) -> Result<c_long, Errno> {
        self.check("peek", pid)?;
        self.peeks.set(self.peeks.get() + 1);

        match self.mapped_range(addr, WORD) {
            Some((offset, WORD)) => {
                let region = self.region.borrow();
                let mut word = [0u8; WORD];
                word.copy_from_slice(&region.1[offset..offset + WORD]);
                Ok(c_long::from_ne_bytes(word))
            },
            _ => Err(Errno::EFAULT),
        }
    }

    fn poke_data(&self, pid: Pid, addr: u64, data: c_long) -> Result<(), Errno> {
        self.check("poke", pid)?;

        match self.mapped_range(addr, WORD) {
            Some((offset, WORD)) => {
                let mut region = self.region.borrow_mut();
                region.1[offset..offset + WORD].copy_from_slice(&data.to_ne_bytes());
                Ok(())
            },
            _ => Err(Errno::EFAULT),
        }
    }

    fn read_vm(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        self.vm_reads.set(self.vm_reads.get() + 1);

        if self.vm_enosys.get() {
            return Err(Errno::ENOSYS);
        }

        self.check("readv", pid)?;

        let (offset, len) = self.mapped_range(addr, buf.len()).ok_or(Errno::EFAULT)?;
        buf[..len].copy_from_slice(&self.region.borrow().1[offset..offset + len]);

        Ok(len)
    }

    fn write_vm(&self, pid: Pid, addr: u64, buf: &[u8]) -> Result<usize, Errno> {
        if self.vm_enosys.get() {
            return Err(Errno::ENOSYS);
        }

        self.check("writev", pid)?;

        let (offset, len) = self.mapped_range(addr, buf.len()).ok_or(Errno::EFAULT)?;
        self.region.borrow_mut().1[offset..offset + len].copy_from_slice(&buf[..len]);

        Ok(len)
    }
}

/// A callback invocation, as seen by [`Recorder`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Seen {
    Startup { tid: i32, parent: Option<i32>, follow_fork: bool },
    Teardown(i32),
    Syscall { tid: i32, entering: bool },
    Exec { tid: i32, old_abi: Abi, abi: Abi },
    PreExit { tid: i32, status: c_int },
    Seccomp { tid: i32, data: u64 },
    Signal { tid: i32, sig: c_int },
    Exit { tid: i32, status: c_int },
    Interrupt(c_int),
    Error(ErrorKind),
}

/// Callbacks recording what they see, and answering with preset flows.
#[derive(Default)]
pub struct Recorder {
    pub seen: Vec<Seen>,
    pub answers: HashMap<&'static str, Flow>,
    pub failures: Vec<String>,
    pub outcome: Option<Outcome>,
}

impl Recorder {
    pub fn answering(callback: &'static str, flow: Flow) -> Self {
        let mut recorder = Self::default();
        recorder.answers.insert(callback, flow);
        recorder
    }

    fn answer(&self, callback: &'static str) -> Flow {
        self.answers.get(callback).copied().unwrap_or_default()
    }
}

impl Callbacks for Recorder {
    fn error(&mut self, failure: &Failure<'_>) {
        self.seen.push(Seen::Error(failure.kind()));
        self.failures.push(failure.to_string());
    }

    fn startup(&mut self, tracee: &mut Tracee<'_>, parent: Option<&Process>) {
        self.seen.push(Seen::Startup {
            tid: tracee.tid().as_raw(),
            parent: parent.map(|p| p.tid().as_raw()),
            follow_fork: tracee.follows_fork(),
        });
    }

    fn teardown(&mut self, process: &Process) {
        self.seen.push(Seen::Teardown(process.tid().as_raw()));
    }

    fn cleanup(&mut self, outcome: &Outcome) -> i32 {
        self.outcome = Some(*outcome);
        outcome.exit_code()
    }

    fn syscall(&mut self, tracee: &mut Tracee<'_>, _regs: &Registers, entering: bool) -> Flow {
        self.seen.push(Seen::Syscall { tid: tracee.tid().as_raw(), entering });
        self.answer("syscall")
    }

    fn exec(&mut self, tracee: &mut Tracee<'_>, _regs: &Registers, old_abi: Abi) -> Flow {
        self.seen.push(Seen::Exec { tid: tracee.tid().as_raw(), old_abi, abi: tracee.abi() });
        self.answer("exec")
    }

    fn pre_exit(&mut self, tracee: &mut Tracee<'_>, status: Status) -> Flow {
        self.seen.push(Seen::PreExit { tid: tracee.tid().as_raw(), status: status.as_raw() });
        self.answer("pre_exit")
    }

    fn seccomp(&mut self, tracee: &mut Tracee<'_>, data: u64) -> Flow {
        self.seen.push(Seen::Seccomp { tid: tracee.tid().as_raw(), data });
        self.answer("seccomp")
    }

    fn signal(&mut self, tracee: &mut Tracee<'_>, status: Status) -> Flow {
        let sig = status.stop_signal().unwrap_or(0);
        self.seen.push(Seen::Signal { tid: tracee.tid().as_raw(), sig });
        self.answer("signal")
    }

    fn exit(&mut self, tid: Pid, status: Status) -> Flow {
        self.seen.push(Seen::Exit { tid: tid.as_raw(), status: status.as_raw() });
        self.answer("exit")
    }

    /// Aborts unless told otherwise, like the default.
    fn interrupt(&mut self, sig: c_int) -> Flow {
        self.seen.push(Seen::Interrupt(sig));
        self.answers.get("interrupt").copied().unwrap_or(Flow::ABORT)
    }
}

/// Log to the test output, filtered by `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration leaving the signal dispositions of the test process alone.
pub fn config() -> Config {
    let mut config = Config::new();
    config.set_interrupt(Interrupt::Anywhere);
    config.set_os_release(traceloop::kernel_version(6, 1, 0));
    config
}

pub fn context(kernel: FakeKernel, recorder: Recorder) -> Context<Recorder, FakeKernel> {
    context_with(config(), kernel, recorder)
}

pub fn context_with(config: Config, kernel: FakeKernel, recorder: Recorder) -> Context<Recorder, FakeKernel> {
    init_logging();
    Context::with_ptrace(config, recorder, kernel).expect("context")
}
