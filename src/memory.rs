//! Reading and writing tracee memory.
//!
//! Transfers go through `process_vm_readv(2)`/`process_vm_writev(2)` when the kernel
//! supports them, and fall back to word-at-a-time `PTRACE_PEEKDATA`/`PTRACE_POKEDATA`
//! otherwise. Once a bulk syscall fails with `ENOSYS`, it is never tried again.
//!
//! A transfer reports partial success. If the first unit already faults, it fails with
//! [`Error::Memory`]; if a later unit faults, it returns the count transferred so far.

use std::cell::Cell;
use std::mem::size_of;

use libc::c_long;
use nix::errno::Errno;
use tracing::info;

use crate::abi::Abi;
use crate::error::{Error, Result};
use crate::process::Pid;
use crate::trace::Ptrace;


/// Size of a `PTRACE_PEEKDATA` transfer.
pub const WORD_SIZE: usize = size_of::<c_long>();

/// Bulk reads scanning for a NUL byte never cross a page boundary, and never read more
/// than this many bytes at once.
const NUL_CHUNK: usize = 256;
const PAGE_SIZE: u64 = 4096;

fn partial(count: usize, err: Error) -> Result<usize> {
    if count == 0 {
        Err(err)
    } else {
        Ok(count)
    }
}

fn nul_position(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|&b| b == 0)
}

/// Accessor for the address spaces of tracees.
#[derive(Debug, Default)]
pub struct Memory {
    no_vm_readv: Cell<bool>,
    no_vm_writev: Cell<bool>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory accessor which never tries the bulk transfer syscalls.
    pub fn word_at_a_time() -> Self {
        Self {
            no_vm_readv: Cell::new(true),
            no_vm_writev: Cell::new(true),
        }
    }

    /// True until `process_vm_readv(2)` has been found to be unimplemented.
    pub fn bulk_read_supported(&self) -> bool {
        !self.no_vm_readv.get()
    }

    /// True until `process_vm_writev(2)` has been found to be unimplemented.
    pub fn bulk_write_supported(&self) -> bool {
        !self.no_vm_writev.get()
    }

    /// Read `buf.len()` bytes at `addr`, returning the count read.
    pub fn read(
        &self,
        ptrace: &dyn Ptrace,
        pid: Pid,
        abi: Abi,
        addr: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.read_impl(ptrace, pid, abi.truncate(addr), buf, false)
    }

    /// Read at most `buf.len()` bytes at `addr`, stopping at the first NUL byte.
    ///
    /// Returns the offset of the NUL byte, i.e. the string length, if one was found, and
    /// the count read otherwise.
    pub fn read_until_nul(
        &self,
        ptrace: &dyn Ptrace,
        pid: Pid,
        abi: Abi,
        addr: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.read_impl(ptrace, pid, abi.truncate(addr), buf, true)
    }

    /// Read the string pointed to by element `index` of the NULL-terminated pointer
    /// array at `array`, such as the `argv` argument of `execve()`.
    ///
    /// Returns `None` if the element is the terminating NULL pointer, and the string
    /// length as per [`Memory::read_until_nul()`] otherwise.
    pub fn read_string_array(
        &self,
        ptrace: &dyn Ptrace,
        pid: Pid,
        abi: Abi,
        array: u64,
        index: usize,
        buf: &mut [u8],
    ) -> Result<Option<usize>> {
        let wordsize = abi.wordsize();
        let slot = array.wrapping_add((index * wordsize) as u64);

        let mut word = [0u8; 8];
        let count = self.read(ptrace, pid, abi, slot, &mut word[..wordsize])?;

        if count < wordsize {
            return Err(Error::Memory {
                pid,
                addr: abi.truncate(slot.wrapping_add(count as u64)),
                source: Errno::EFAULT,
            });
        }

        let ptr = if wordsize == 4 {
            u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) as u64
        } else {
            u64::from_ne_bytes(word)
        };

        if ptr == 0 {
            return Ok(None);
        }

        self.read_until_nul(ptrace, pid, abi, ptr, buf).map(Some)
    }

    /// Write `buf` at `addr`, returning the count written.
    pub fn write(
        &self,
        ptrace: &dyn Ptrace,
        pid: Pid,
        abi: Abi,
        addr: u64,
        buf: &[u8],
    ) -> Result<usize> {
        let addr = abi.truncate(addr);
        let mut count = 0;

        if self.bulk_write_supported() {
            while count < buf.len() {
                let cur = addr.wrapping_add(count as u64);

                match ptrace.write_vm(pid, cur, &buf[count..]) {
                    Ok(0) => {
                        return partial(count, Error::Memory { pid, addr: cur, source: Errno::EFAULT });
                    },
                    Ok(n) => {
                        count += n;
                    },
                    Err(Errno::ENOSYS) => {
                        info!("process_vm_writev() is not implemented, using PTRACE_POKEDATA");
                        self.no_vm_writev.set(true);
                        break;
                    },
                    Err(source) => {
                        return partial(count, Error::Memory { pid, addr: cur, source });
                    },
                }
            }

            if self.bulk_write_supported() {
                return Ok(count);
            }
        }

        match poke_words(ptrace, pid, addr.wrapping_add(count as u64), &buf[count..]) {
            Ok(n) => Ok(count + n),
            Err(err) => partial(count, err),
        }
    }

    fn read_impl(
        &self,
        ptrace: &dyn Ptrace,
        pid: Pid,
        addr: u64,
        buf: &mut [u8],
        nul: bool,
    ) -> Result<usize> {
        let mut count = 0;

        if self.bulk_read_supported() {
            while count < buf.len() {
                let cur = addr.wrapping_add(count as u64);
                let mut chunk = buf.len() - count;

                if nul {
                    let to_page_end = (PAGE_SIZE - cur % PAGE_SIZE) as usize;
                    chunk = chunk.min(NUL_CHUNK).min(to_page_end);
                }

                match ptrace.read_vm(pid, cur, &mut buf[count..count + chunk]) {
                    Ok(0) => {
                        return partial(count, Error::Memory { pid, addr: cur, source: Errno::EFAULT });
                    },
                    Ok(n) => {
                        if nul {
                            if let Some(pos) = nul_position(&buf[count..count + n]) {
                                return Ok(count + pos);
                            }
                        }

                        count += n;
                    },
                    Err(Errno::ENOSYS) => {
                        info!("process_vm_readv() is not implemented, using PTRACE_PEEKDATA");
                        self.no_vm_readv.set(true);
                        break;
                    },
                    Err(source) => {
                        return partial(count, Error::Memory { pid, addr: cur, source });
                    },
                }
            }

            if self.bulk_read_supported() {
                return Ok(count);
            }
        }

        match peek_words(ptrace, pid, addr.wrapping_add(count as u64), &mut buf[count..], nul) {
            Ok(n) => Ok(count + n),
            Err(err) => partial(count, err),
        }
    }
}

fn peek(ptrace: &dyn Ptrace, pid: Pid, addr: u64) -> Result<[u8; WORD_SIZE]> {
    ptrace
        .peek_data(pid, addr)
        .map(c_long::to_ne_bytes)
        .map_err(|source| Error::Memory { pid, addr, source })
}

fn peek_words(
    ptrace: &dyn Ptrace,
    pid: Pid,
    addr: u64,
    buf: &mut [u8],
    nul: bool,
) -> Result<usize> {
    let residue = (addr % WORD_SIZE as u64) as usize;
    let mut cur = addr - residue as u64;
    let mut offset = residue;
    let mut count = 0;

    while count < buf.len() {
        let word = match peek(ptrace, pid, cur) {
            Ok(word) => word,
            Err(err) => return partial(count, err),
        };

        let n = (WORD_SIZE - offset).min(buf.len() - count);
        let bytes = &word[offset..offset + n];
        buf[count..count + n].copy_from_slice(bytes);

        if nul {
            if let Some(pos) = nul_position(bytes) {
                return Ok(count + pos);
            }
        }

        count += n;
        cur = cur.wrapping_add(WORD_SIZE as u64);
        offset = 0;
    }

    Ok(count)
}

fn poke_words(ptrace: &dyn Ptrace, pid: Pid, addr: u64, buf: &[u8]) -> Result<usize> {
    let residue = (addr % WORD_SIZE as u64) as usize;
    let mut cur = addr - residue as u64;
    let mut offset = residue;
    let mut count = 0;

    while count < buf.len() {
        let n = (WORD_SIZE - offset).min(buf.len() - count);

        // Partial words keep the bytes around the written range.
        let mut word = if n < WORD_SIZE {
            match peek(ptrace, pid, cur) {
                Ok(word) => word,
                Err(err) => return partial(count, err),
            }
        } else {
            [0; WORD_SIZE]
        };

        word[offset..offset + n].copy_from_slice(&buf[count..count + n]);

        if let Err(source) = ptrace.poke_data(pid, cur, c_long::from_ne_bytes(word)) {
            return partial(count, Error::Memory { pid, addr: cur, source });
        }

        count += n;
        cur = cur.wrapping_add(WORD_SIZE as u64);
        offset = 0;
    }

    Ok(count)
}
