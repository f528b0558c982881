//! Thin wrappers around the `ptrace(2)` requests and related syscalls.
//!
//! Every primitive fails with a raw [`Errno`], so callers can single out `ESRCH`, which
//! means the tracee is gone (or is not stopped).

use std::io::{IoSlice, IoSliceMut};
use std::mem::size_of;
use std::ptr;

use libc::{c_int, c_long, c_void};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::uio::{self, RemoteIoVec};

use crate::event::Status;
use crate::process::Pid;
use crate::regs::Registers;


/// Linux constant defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: c_int = 0x1;

/// Capacity of the buffer for `NT_PRSTATUS` register sets, in 64-bit words.
///
/// Large enough for the biggest supported layout, `struct user_pt_regs` of arm64.
const REGSET_WORDS: usize = 34;

pub type Result<T> = std::result::Result<T, Errno>;

/// Tracing primitives, as issued by the event loop and per-process helpers.
///
/// [`Kernel`] is the real implementation. The trait exists so the event loop can be
/// driven by a scripted implementation.
pub trait Ptrace {
    /// Wait for a state change of any child, in any thread group.
    fn wait(&self) -> Result<(Pid, Status)>;

    fn attach(&self, pid: Pid) -> Result<()>;

    fn detach(&self, pid: Pid, sig: c_int) -> Result<()>;

    /// Resume a stopped tracee until its next stop, delivering `sig` if it is not 0.
    fn resume(&self, pid: Pid, sig: c_int) -> Result<()>;

    fn singlestep(&self, pid: Pid, sig: c_int) -> Result<()>;

    /// Resume a stopped tracee until the next syscall entry or exit.
    fn syscall_step(&self, pid: Pid, sig: c_int) -> Result<()>;

    fn set_options(&self, pid: Pid, options: Options) -> Result<()>;

    fn get_registers(&self, pid: Pid) -> Result<Registers>;

    fn set_registers(&self, pid: Pid, regs: &Registers) -> Result<()>;

    /// Retrieve the message of the last ptrace event stop.
    ///
    /// This is the new tid for fork, vfork and clone events, the former tid for exec
    /// events, the exit status for pre-exit events and the filter data for seccomp.
    fn get_event_message(&self, pid: Pid) -> Result<u64>;

    /// Send `sig` to thread `tid`, of thread group `tgid` if it is known.
    fn kill(&self, tid: Pid, tgid: Option<Pid>, sig: c_int) -> Result<()>;

    /// Read the word at `addr`. Faults are reported as `EFAULT`.
    fn peek_data(&self, pid: Pid, addr: u64) -> Result<c_long>;

    /// Write the word at `addr`. Faults are reported as `EFAULT`.
    fn poke_data(&self, pid: Pid, addr: u64, data: c_long) -> Result<()>;

    /// Bulk read with `process_vm_readv(2)`, returning the number of bytes read.
    ///
    /// Fails with `ENOSYS` if the kernel lacks cross memory attach.
    fn read_vm(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize>;

    /// Bulk write with `process_vm_writev(2)`, returning the number of bytes written.
    fn write_vm(&self, pid: Pid, addr: u64, buf: &[u8]) -> Result<usize>;
}

/// Request `PTRACE_TRACEME` for the calling process.
pub fn trace_me() -> Result<()> {
    ptrace::traceme()
}

/// The running kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct Kernel;

impl Kernel {
    fn restart(&self, request: ptrace::RequestType, pid: Pid, sig: c_int) -> Result<()> {
        // SAFETY: restart requests don't dereference `addr`, and read `data` as a signal
        // number.
        let res = unsafe {
            libc::ptrace(request, pid.as_raw(), ptr::null_mut::<c_void>(), sig as c_long)
        };

        Errno::result(res).map(drop)
    }

    fn regset(&self, request: ptrace::RequestType, pid: Pid, iov: &mut libc::iovec) -> Result<()> {
        // SAFETY: `iov` describes a live buffer, which the kernel will not access past
        // `iov_len` bytes.
        let res = unsafe {
            libc::ptrace(request, pid.as_raw(), NT_PRSTATUS as usize as *mut c_void, iov as *mut _ as *mut c_void)
        };

        Errno::result(res).map(drop)
    }
}

/// `PTRACE_PEEKDATA` and `PTRACE_POKEDATA` report unmapped addresses as `EIO`.
fn fault_as_efault(errno: Errno) -> Errno {
    if errno == Errno::EIO {
        Errno::EFAULT
    } else {
        errno
    }
}

impl Ptrace for Kernel {
    fn wait(&self) -> Result<(Pid, Status)> {
        let mut status: c_int = 0;

        // SAFETY: `status` is a valid out-parameter.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::__WALL) };
        let pid = Errno::result(pid)?;

        Ok((Pid::from_raw(pid), Status::from_raw(status)))
    }

    fn attach(&self, pid: Pid) -> Result<()> {
        ptrace::attach(pid)
    }

    fn detach(&self, pid: Pid, sig: c_int) -> Result<()> {
        self.restart(libc::PTRACE_DETACH, pid, sig)
    }

    fn resume(&self, pid: Pid, sig: c_int) -> Result<()> {
        self.restart(libc::PTRACE_CONT, pid, sig)
    }

    fn singlestep(&self, pid: Pid, sig: c_int) -> Result<()> {
        self.restart(libc::PTRACE_SINGLESTEP, pid, sig)
    }

    fn syscall_step(&self, pid: Pid, sig: c_int) -> Result<()> {
        self.restart(libc::PTRACE_SYSCALL, pid, sig)
    }

    fn set_options(&self, pid: Pid, options: Options) -> Result<()> {
        ptrace::setoptions(pid, options)
    }

    fn get_registers(&self, pid: Pid) -> Result<Registers> {
        let mut data = [0u64; REGSET_WORDS];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut c_void,
            iov_len: size_of::<[u64; REGSET_WORDS]>(),
        };

        self.regset(libc::PTRACE_GETREGSET, pid, &mut iov)?;

        // SAFETY: `data` is plain old data, and the kernel shrinks `iov_len` to the size
        // of the register set it wrote.
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, iov.iov_len.min(size_of::<[u64; REGSET_WORDS]>()))
        };

        Registers::from_regset(bytes).ok_or(Errno::ENOTSUP)
    }

    fn set_registers(&self, pid: Pid, regs: &Registers) -> Result<()> {
        let bytes = regs.as_bytes();
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut c_void,
            iov_len: bytes.len(),
        };

        self.regset(libc::PTRACE_SETREGSET, pid, &mut iov)
    }

    fn get_event_message(&self, pid: Pid) -> Result<u64> {
        ptrace::getevent(pid).map(|msg| msg as u64)
    }

    fn kill(&self, tid: Pid, tgid: Option<Pid>, sig: c_int) -> Result<()> {
        // SAFETY: plain syscalls, without pointer arguments.
        let res = unsafe {
            match tgid {
                Some(tgid) => libc::syscall(libc::SYS_tgkill, tgid.as_raw(), tid.as_raw(), sig),
                None => libc::syscall(libc::SYS_tkill, tid.as_raw(), sig),
            }
        };

        Errno::result(res).map(drop)
    }

    fn peek_data(&self, pid: Pid, addr: u64) -> Result<c_long> {
        ptrace::read(pid, addr as usize as ptrace::AddressType).map_err(fault_as_efault)
    }

    fn poke_data(&self, pid: Pid, addr: u64, data: c_long) -> Result<()> {
        // SAFETY: `PTRACE_POKEDATA` writes to the tracee, never to our address space.
        let res = unsafe {
            libc::ptrace(libc::PTRACE_POKEDATA, pid.as_raw(), addr as usize as *mut c_void, data)
        };

        Errno::result(res).map(drop).map_err(fault_as_efault)
    }

    fn read_vm(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let remote = [RemoteIoVec { base: addr as usize, len: buf.len() }];
        let mut local = [IoSliceMut::new(buf)];

        uio::process_vm_readv(pid, &mut local, &remote)
    }

    fn write_vm(&self, pid: Pid, addr: u64, buf: &[u8]) -> Result<usize> {
        let remote = [RemoteIoVec { base: addr as usize, len: buf.len() }];
        let local = [IoSlice::new(buf)];

        uio::process_vm_writev(pid, &local, &remote)
    }
}
