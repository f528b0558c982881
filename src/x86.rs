//! Register layouts of x86 tracees.
//!
//! Field order follows `struct user_regs_struct` in the kernel's `asm/user_64.h` and
//! `asm/user_32.h`.

use crate::abi::Abi;
use crate::error::{Error, Result};
use crate::regs::widen;


/// Code segment selector of a 32-bit compat task.
const CS_I386: u64 = 0x23;

/// Code segment selector of a 64-bit task.
const CS_X86_64: u64 = 0x33;

/// Set in the syscall number of an x32 syscall.
pub const X32_SYSCALL_BIT: u64 = 0x4000_0000;

/// General purpose registers of an x86-64 thread.
///
/// Also reported for 32-bit compat tracees of an x86-64 kernel, with the 32-bit
/// values zero-extended.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct user_regs_struct {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl user_regs_struct {
    pub fn abi(&self) -> Result<Abi> {
        match self.cs {
            CS_I386 => Ok(Abi::I386),
            CS_X86_64 => {
                // A negative `orig_rax` is not a syscall stop, and says nothing about x32.
                if (self.orig_rax as i64) >= 0 && self.orig_rax & X32_SYSCALL_BIT != 0 {
                    Ok(Abi::X32)
                } else {
                    Ok(Abi::X86_64)
                }
            },
            _ => Err(Error::UnsupportedAbi),
        }
    }

    fn arguments(&self, abi: Abi) -> Result<[&u64; 6]> {
        match abi {
            Abi::X86_64 | Abi::X32 => {
                Ok([&self.rdi, &self.rsi, &self.rdx, &self.r10, &self.r8, &self.r9])
            },
            Abi::I386 => {
                Ok([&self.rbx, &self.rcx, &self.rdx, &self.rsi, &self.rdi, &self.rbp])
            },
            _ => Err(Error::UnsupportedAbi),
        }
    }

    fn argument_mut(&mut self, abi: Abi, index: usize) -> Result<&mut u64> {
        let reg = match (abi, index) {
            (Abi::X86_64 | Abi::X32, 0) => &mut self.rdi,
            (Abi::X86_64 | Abi::X32, 1) => &mut self.rsi,
            (Abi::X86_64 | Abi::X32, 2) => &mut self.rdx,
            (Abi::X86_64 | Abi::X32, 3) => &mut self.r10,
            (Abi::X86_64 | Abi::X32, 4) => &mut self.r8,
            (Abi::X86_64 | Abi::X32, 5) => &mut self.r9,
            (Abi::I386, 0) => &mut self.rbx,
            (Abi::I386, 1) => &mut self.rcx,
            (Abi::I386, 2) => &mut self.rdx,
            (Abi::I386, 3) => &mut self.rsi,
            (Abi::I386, 4) => &mut self.rdi,
            (Abi::I386, 5) => &mut self.rbp,
            (Abi::X86_64 | Abi::X32 | Abi::I386, _) => {
                return Err(Error::InvalidArgument { index });
            },
            _ => return Err(Error::UnsupportedAbi),
        };

        Ok(reg)
    }

    pub(crate) fn syscall_number(&self, abi: Abi) -> Result<i64> {
        match abi {
            Abi::X86_64 => Ok(self.orig_rax as i64),
            Abi::X32 => Ok((self.orig_rax & !X32_SYSCALL_BIT) as i64),
            Abi::I386 => Ok(widen(abi, self.orig_rax)),
            _ => Err(Error::UnsupportedAbi),
        }
    }

    pub(crate) fn set_syscall_number(&mut self, abi: Abi, nr: i64) -> Result<()> {
        self.orig_rax = match abi {
            Abi::X86_64 => nr as u64,
            Abi::X32 => abi.truncate(nr as u64) | X32_SYSCALL_BIT,
            Abi::I386 => abi.truncate(nr as u64),
            _ => return Err(Error::UnsupportedAbi),
        };

        Ok(())
    }

    pub(crate) fn argument(&self, abi: Abi, index: usize) -> Result<i64> {
        let args = self.arguments(abi)?;
        let raw = args.get(index).ok_or(Error::InvalidArgument { index })?;

        Ok(widen(abi, **raw))
    }

    pub(crate) fn set_argument(&mut self, abi: Abi, index: usize, value: i64) -> Result<()> {
        *self.argument_mut(abi, index)? = abi.truncate(value as u64);

        Ok(())
    }

    pub(crate) fn return_register(&self, abi: Abi) -> Result<u64> {
        self.arguments(abi)?;

        Ok(self.rax)
    }

    pub(crate) fn set_return_register(&mut self, abi: Abi, value: i64) -> Result<()> {
        self.arguments(abi)?;
        self.rax = abi.truncate(value as u64);

        Ok(())
    }
}

/// General purpose registers of a native 32-bit x86 thread.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct i386_user_regs_struct {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub xds: u32,
    pub xes: u32,
    pub xfs: u32,
    pub xgs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub xcs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub xss: u32,
}

impl i386_user_regs_struct {
    fn check(abi: Abi) -> Result<()> {
        if abi == Abi::I386 {
            Ok(())
        } else {
            Err(Error::UnsupportedAbi)
        }
    }

    fn argument_mut(&mut self, index: usize) -> Result<&mut u32> {
        match index {
            0 => Ok(&mut self.ebx),
            1 => Ok(&mut self.ecx),
            2 => Ok(&mut self.edx),
            3 => Ok(&mut self.esi),
            4 => Ok(&mut self.edi),
            5 => Ok(&mut self.ebp),
            _ => Err(Error::InvalidArgument { index }),
        }
    }

    pub(crate) fn syscall_number(&self, abi: Abi) -> Result<i64> {
        Self::check(abi)?;

        Ok(self.orig_eax as i32 as i64)
    }

    pub(crate) fn set_syscall_number(&mut self, abi: Abi, nr: i64) -> Result<()> {
        Self::check(abi)?;
        self.orig_eax = nr as u32;

        Ok(())
    }

    pub(crate) fn argument(&self, abi: Abi, index: usize) -> Result<i64> {
        Self::check(abi)?;

        let raw = match index {
            0 => self.ebx,
            1 => self.ecx,
            2 => self.edx,
            3 => self.esi,
            4 => self.edi,
            5 => self.ebp,
            _ => return Err(Error::InvalidArgument { index }),
        };

        Ok(raw as i32 as i64)
    }

    pub(crate) fn set_argument(&mut self, abi: Abi, index: usize, value: i64) -> Result<()> {
        Self::check(abi)?;
        *self.argument_mut(index)? = value as u32;

        Ok(())
    }

    pub(crate) fn return_register(&self, abi: Abi) -> Result<u64> {
        Self::check(abi)?;

        Ok(self.eax as u64)
    }

    pub(crate) fn set_return_register(&mut self, abi: Abi, value: i64) -> Result<()> {
        Self::check(abi)?;
        self.eax = value as u32;

        Ok(())
    }
}
