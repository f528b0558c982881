//! Syscall calling conventions, and how to tell them apart.

use std::fmt;

use crate::error::Result;
use crate::regs::Registers;


/// A syscall calling convention of a tracee.
///
/// Each architecture supports one or more ABIs. A tracee's ABI can change across an
/// `execve()`, so it is re-resolved after every exec.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Abi {
    /// 64-bit x86 long mode.
    X86_64,

    /// 32-bit x86, natively or in compatibility mode on an x86-64 kernel.
    I386,

    /// x86-64 registers with 32-bit pointers.
    X32,

    /// 64-bit ARM.
    Aarch64,

    /// 32-bit ARM (EABI or OABI, ARM or Thumb mode), natively or as a compat task.
    Arm,
}

impl Abi {
    /// The ABI of the tracer itself.
    #[cfg(all(target_arch = "x86_64", target_pointer_width = "64"))]
    pub const fn native() -> Self {
        Abi::X86_64
    }

    /// The ABI of the tracer itself.
    #[cfg(all(target_arch = "x86_64", target_pointer_width = "32"))]
    pub const fn native() -> Self {
        Abi::X32
    }

    /// The ABI of the tracer itself.
    #[cfg(target_arch = "x86")]
    pub const fn native() -> Self {
        Abi::I386
    }

    /// The ABI of the tracer itself.
    #[cfg(target_arch = "aarch64")]
    pub const fn native() -> Self {
        Abi::Aarch64
    }

    /// The ABI of the tracer itself.
    #[cfg(target_arch = "arm")]
    pub const fn native() -> Self {
        Abi::Arm
    }

    /// Size in bytes of a pointer, or `long`, under this ABI.
    pub const fn wordsize(self) -> usize {
        match self {
            Abi::X86_64 | Abi::Aarch64 => 8,
            Abi::I386 | Abi::X32 | Abi::Arm => 4,
        }
    }

    /// Truncate a tracee address to the ABI's pointer width.
    pub const fn truncate(self, addr: u64) -> u64 {
        let bits = 8 * self.wordsize() as u32;

        if bits < u64::BITS {
            addr & ((1u64 << bits) - 1)
        } else {
            addr
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Abi::X86_64 => "x86_64",
            Abi::I386 => "i386",
            Abi::X32 => "x32",
            Abi::Aarch64 => "aarch64",
            Abi::Arm => "arm",
        }
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Determine which ABI a stopped tracee is executing under.
///
/// Fails with [`Error::UnsupportedAbi`](crate::Error::UnsupportedAbi) if the register
/// state does not match any known convention.
pub fn resolve(regs: &Registers) -> Result<Abi> {
    match regs {
        Registers::X86_64(regs) => regs.abi(),
        Registers::I386(_) => Ok(Abi::I386),
        Registers::Arm(_) => Ok(Abi::Arm),
        Registers::Aarch64(regs) => regs.abi(),
    }
}
