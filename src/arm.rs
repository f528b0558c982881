//! Register layout of 32-bit ARM tracees, native or compat.

use crate::abi::Abi;
use crate::error::{Error, Result};


/// Thumb state bit of `cpsr`.
const PSR_T_BIT: u32 = 0x20;

/// `swi 0`, the EABI syscall trap. The number is then passed in `r7`.
const SWI_EABI: u32 = 0xef00_0000;

/// Mask and value of an OABI `swi` trap, which encodes the number in the instruction.
const SWI_OABI_MASK: u32 = 0x0ff0_0000;
const SWI_OABI: u32 = 0x0f90_0000;

/// Set in the number of an ARM private syscall.
const ARM_PRIVATE_BIT: i64 = 0x0f_0000;

const ORIG_R0: usize = 17;

/// Defined as `struct pt_regs` in `arch/arm/include/uapi/asm/ptrace.h`.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct pt_regs {
    pub uregs: [u32; 18],
}

impl pt_regs {
    pub fn sp(&self) -> u32 {
        self.uregs[13]
    }

    pub fn pc(&self) -> u32 {
        self.uregs[15]
    }

    pub fn cpsr(&self) -> u32 {
        self.uregs[16]
    }

    pub fn orig_r0(&self) -> u32 {
        self.uregs[ORIG_R0]
    }

    pub fn is_thumb(&self) -> bool {
        self.cpsr() & PSR_T_BIT != 0
    }

    fn check(abi: Abi) -> Result<()> {
        if abi == Abi::Arm {
            Ok(())
        } else {
            Err(Error::UnsupportedAbi)
        }
    }

    fn check_index(index: usize) -> Result<()> {
        if index < 6 {
            Ok(())
        } else {
            Err(Error::InvalidArgument { index })
        }
    }

    pub(crate) fn syscall_number<F>(&self, abi: Abi, fetch: F) -> Result<i64>
    where
        F: FnOnce(u64) -> Result<u32>,
    {
        Self::check(abi)?;

        let mut nr = if self.is_thumb() {
            self.uregs[7] as i64
        } else {
            let insn = fetch(self.pc().wrapping_sub(4) as u64)?;

            if insn == SWI_EABI {
                self.uregs[7] as i64
            } else if insn & SWI_OABI_MASK == SWI_OABI {
                (insn & 0x000f_ffff) as i64
            } else {
                return Err(Error::UnknownSyscallTrap { insn });
            }
        };

        if nr & ARM_PRIVATE_BIT != 0 {
            nr &= 0xffff;
        }

        Ok(nr)
    }

    pub(crate) fn set_syscall_number(&mut self, abi: Abi, nr: i64) -> Result<()> {
        Self::check(abi)?;
        self.uregs[7] = nr as u32;

        Ok(())
    }

    pub(crate) fn argument(&self, abi: Abi, index: usize) -> Result<i64> {
        Self::check(abi)?;
        Self::check_index(index)?;

        Ok(self.uregs[index] as i32 as i64)
    }

    /// Writing the first argument also updates `orig_r0`, which the kernel restores
    /// `r0` from when restarting the syscall.
    pub(crate) fn set_argument(&mut self, abi: Abi, index: usize, value: i64) -> Result<()> {
        Self::check(abi)?;
        Self::check_index(index)?;

        self.uregs[index] = value as u32;

        if index == 0 {
            self.uregs[ORIG_R0] = value as u32;
        }

        Ok(())
    }

    pub(crate) fn return_register(&self, abi: Abi) -> Result<u64> {
        Self::check(abi)?;

        Ok(self.uregs[0] as u64)
    }

    pub(crate) fn set_return_register(&mut self, abi: Abi, value: i64) -> Result<()> {
        Self::check(abi)?;
        self.uregs[0] = value as u32;

        Ok(())
    }
}
