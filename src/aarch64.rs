//! Register layout of 64-bit ARM tracees.
//!
//! A 32-bit compat tracee of an arm64 kernel reports its registers in the
//! [`arm::pt_regs`](crate::arm::pt_regs) layout instead.

use crate::abi::Abi;
use crate::error::{Error, Result};


/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl user_pt_regs {
    pub fn abi(&self) -> Result<Abi> {
        Ok(Abi::Aarch64)
    }

    fn check(abi: Abi, index: usize) -> Result<()> {
        if abi != Abi::Aarch64 {
            return Err(Error::UnsupportedAbi);
        }

        if index >= 6 {
            return Err(Error::InvalidArgument { index });
        }

        Ok(())
    }

    pub(crate) fn syscall_number(&self, abi: Abi) -> Result<i64> {
        Self::check(abi, 0)?;

        Ok(self.regs[8] as i64)
    }

    pub(crate) fn set_syscall_number(&mut self, abi: Abi, nr: i64) -> Result<()> {
        Self::check(abi, 0)?;
        self.regs[8] = nr as u64;

        Ok(())
    }

    pub(crate) fn argument(&self, abi: Abi, index: usize) -> Result<i64> {
        Self::check(abi, index)?;

        Ok(self.regs[index] as i64)
    }

    pub(crate) fn set_argument(&mut self, abi: Abi, index: usize, value: i64) -> Result<()> {
        Self::check(abi, index)?;
        self.regs[index] = value as u64;

        Ok(())
    }

    pub(crate) fn return_register(&self, abi: Abi) -> Result<u64> {
        Self::check(abi, 0)?;

        Ok(self.regs[0])
    }

    pub(crate) fn set_return_register(&mut self, abi: Abi, value: i64) -> Result<()> {
        Self::check(abi, 0)?;
        self.regs[0] = value as u64;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use memoffset::offset_of;

    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<user_pt_regs>(), 272);
        assert_eq!(offset_of!(user_pt_regs, sp), 31 * 8);
        assert_eq!(offset_of!(user_pt_regs, pstate), 33 * 8);
    }

    #[test]
    fn test_syscall_registers() {
        let mut regs = user_pt_regs::default();
        regs.regs[8] = 221;
        regs.regs[0] = 7;

        assert_eq!(regs.syscall_number(Abi::Aarch64).unwrap(), 221);
        assert_eq!(regs.argument(Abi::Aarch64, 0).unwrap(), 7);
        assert_eq!(regs.return_register(Abi::Aarch64).unwrap(), 7);
    }
}
