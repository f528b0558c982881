//! Architecture-tagged register snapshots, and syscall decoding on top of them.

use std::mem::size_of;

use nix::errno::Errno;

use crate::aarch64;
use crate::abi::{self, Abi};
use crate::arm;
use crate::error::{Error, Result};
use crate::x86;


/// Number of syscall arguments passed in registers.
pub const MAX_ARGS: usize = 6;

/// Number of errno values known to the kernel, rounded up.
///
/// Return values in `[-NERRNOS, -1]` are negated error codes.
const NERRNOS: u64 = 530;

/// Register state of a tracee, in the layout reported by the kernel for it.
///
/// The layout is chosen at runtime from the size of the `NT_PRSTATUS` register set,
/// so a 64-bit tracer sees 32-bit compat tracees in their native 32-bit layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Registers {
    X86_64(x86::user_regs_struct),
    I386(x86::i386_user_regs_struct),
    Aarch64(aarch64::user_pt_regs),
    Arm(arm::pt_regs),
}

impl Registers {
    /// Interpret a raw `NT_PRSTATUS` register set, using its size to pick the layout.
    pub fn from_regset(bytes: &[u8]) -> Option<Self> {
        // SAFETY: every layout is `repr(C)` and made only of integers, so any bit
        // pattern of the right size is a valid value.
        unsafe {
            match bytes.len() {
                n if n == size_of::<x86::user_regs_struct>() =>
                    Some(Registers::X86_64(read_layout(bytes))),
                n if n == size_of::<x86::i386_user_regs_struct>() =>
                    Some(Registers::I386(read_layout(bytes))),
                n if n == size_of::<aarch64::user_pt_regs>() =>
                    Some(Registers::Aarch64(read_layout(bytes))),
                n if n == size_of::<arm::pt_regs>() =>
                    Some(Registers::Arm(read_layout(bytes))),
                _ => None,
            }
        }
    }

    /// Raw bytes of the register set, as passed to `PTRACE_SETREGSET`.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Registers::X86_64(regs) => layout_bytes(regs),
            Registers::I386(regs) => layout_bytes(regs),
            Registers::Aarch64(regs) => layout_bytes(regs),
            Registers::Arm(regs) => layout_bytes(regs),
        }
    }

    /// Determine the ABI the tracee is executing under.
    pub fn abi(&self) -> Result<Abi> {
        abi::resolve(self)
    }

    pub fn instruction_pointer(&self) -> u64 {
        match self {
            Registers::X86_64(regs) => regs.rip,
            Registers::I386(regs) => regs.eip as u64,
            Registers::Aarch64(regs) => regs.pc,
            Registers::Arm(regs) => regs.pc() as u64,
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        match self {
            Registers::X86_64(regs) => regs.rsp,
            Registers::I386(regs) => regs.esp as u64,
            Registers::Aarch64(regs) => regs.sp,
            Registers::Arm(regs) => regs.sp() as u64,
        }
    }

    /// Decode the number of the syscall being made.
    ///
    /// In ARM mode on 32-bit ARM, the number may be encoded in the trapping `swi`
    /// instruction. `fetch` is then called with its address to read it from the tracee.
    pub fn syscall_number<F>(&self, abi: Abi, fetch: F) -> Result<i64>
    where
        F: FnOnce(u64) -> Result<u32>,
    {
        match self {
            Registers::X86_64(regs) => regs.syscall_number(abi),
            Registers::I386(regs) => regs.syscall_number(abi),
            Registers::Aarch64(regs) => regs.syscall_number(abi),
            Registers::Arm(regs) => regs.syscall_number(abi, fetch),
        }
    }

    pub fn set_syscall_number(&mut self, abi: Abi, nr: i64) -> Result<()> {
        match self {
            Registers::X86_64(regs) => regs.set_syscall_number(abi, nr),
            Registers::I386(regs) => regs.set_syscall_number(abi, nr),
            Registers::Aarch64(regs) => regs.set_syscall_number(abi, nr),
            Registers::Arm(regs) => regs.set_syscall_number(abi, nr),
        }
    }

    /// Read syscall argument `index`, which must be less than [`MAX_ARGS`].
    ///
    /// Arguments of 32-bit ABIs are sign-extended from their low 32 bits.
    pub fn argument(&self, abi: Abi, index: usize) -> Result<i64> {
        check_index(index)?;

        match self {
            Registers::X86_64(regs) => regs.argument(abi, index),
            Registers::I386(regs) => regs.argument(abi, index),
            Registers::Aarch64(regs) => regs.argument(abi, index),
            Registers::Arm(regs) => regs.argument(abi, index),
        }
    }

    pub fn set_argument(&mut self, abi: Abi, index: usize, value: i64) -> Result<()> {
        check_index(index)?;

        match self {
            Registers::X86_64(regs) => regs.set_argument(abi, index, value),
            Registers::I386(regs) => regs.set_argument(abi, index, value),
            Registers::Aarch64(regs) => regs.set_argument(abi, index, value),
            Registers::Arm(regs) => regs.set_argument(abi, index, value),
        }
    }

    /// Decode the syscall return value.
    ///
    /// A failed syscall is reported as `(-1, Some(errno))`.
    pub fn return_value(&self, abi: Abi) -> Result<(i64, Option<Errno>)> {
        let raw = match self {
            Registers::X86_64(regs) => regs.return_register(abi)?,
            Registers::I386(regs) => regs.return_register(abi)?,
            Registers::Aarch64(regs) => regs.return_register(abi)?,
            Registers::Arm(regs) => regs.return_register(abi)?,
        };

        Ok(decode_return(raw, abi))
    }

    /// Set the syscall return value, or a failure with `error` if it is given.
    pub fn set_return_value(&mut self, abi: Abi, value: i64, error: Option<Errno>) -> Result<()> {
        let value = match error {
            Some(errno) => -(errno as i64),
            None => value,
        };

        match self {
            Registers::X86_64(regs) => regs.set_return_register(abi, value),
            Registers::I386(regs) => regs.set_return_register(abi, value),
            Registers::Aarch64(regs) => regs.set_return_register(abi, value),
            Registers::Arm(regs) => regs.set_return_register(abi, value),
        }
    }
}

fn check_index(index: usize) -> Result<()> {
    if index < MAX_ARGS {
        Ok(())
    } else {
        Err(Error::InvalidArgument { index })
    }
}

/// True if `val` is a negated errno under an ABI with the given word size.
///
/// The comparison is done at the ABI's width, since the registers of a 32-bit compat
/// tracee are zero-extended into 64-bit hardware registers.
fn is_negated_errno(val: u64, wordsize: usize) -> bool {
    let max = NERRNOS.wrapping_neg();

    if wordsize < size_of::<u64>() {
        val as u32 > max as u32
    } else {
        val > max
    }
}

/// Read a register holding a word of the given ABI as a signed value.
///
/// Words of 32-bit ABIs are sign-extended from their low 32 bits, whatever the upper
/// half of the hardware register holds.
pub(crate) fn widen(abi: Abi, raw: u64) -> i64 {
    if abi.wordsize() < size_of::<u64>() {
        raw as u32 as i32 as i64
    } else {
        raw as i64
    }
}

pub(crate) fn decode_return(raw: u64, abi: Abi) -> (i64, Option<Errno>) {
    let wordsize = abi.wordsize();

    if is_negated_errno(raw, wordsize) {
        let errno = raw.wrapping_neg() as u32 as i32;
        (-1, Some(Errno::from_raw(errno)))
    } else if wordsize < size_of::<u64>() {
        (raw as u32 as i64, None)
    } else {
        (raw as i64, None)
    }
}

unsafe fn read_layout<T: Copy>(bytes: &[u8]) -> T {
    debug_assert_eq!(bytes.len(), size_of::<T>());
    std::ptr::read_unaligned(bytes.as_ptr() as *const T)
}

fn layout_bytes<T: Copy>(regs: &T) -> &[u8] {
    // SAFETY: register layouts are `repr(C)` structs of integers, without padding.
    unsafe { std::slice::from_raw_parts(regs as *const T as *const u8, size_of::<T>()) }
}
