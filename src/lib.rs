//! Event-loop driven process tracing, built on `ptrace(2)`.
//!
//! A [`Context`] spawns or attaches to tracees, then [`Context::run()`] waits for their
//! state changes and dispatches them to a [`Callbacks`] implementation. Register state
//! is decoded per [`Abi`], so 32-bit and x32 tracees of a 64-bit tracer are handled.

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64", target_arch = "arm")))]
compile_error!("traceloop supports x86_64, x86, aarch64 and arm only");

pub mod aarch64;
pub mod abi;
pub mod arm;
pub mod callback;
pub mod cmd;
pub mod context;
pub mod error;
pub mod event;
pub mod memory;
pub mod process;
pub mod registry;
pub mod regs;
pub mod trace;
pub mod x86;

mod dispatch;
mod intr;

pub use abi::Abi;
pub use callback::{Callbacks, DefaultCallbacks, Flow, Outcome};
pub use cmd::Command;
pub use context::{kernel_version, Config, Context, DEFAULT_OPTIONS, REQUIRED_OPTIONS};
pub use error::{ChildError, Error, ErrorKind, Failure, Result};
pub use event::{Event, Status};
pub use intr::Interrupt;
pub use memory::Memory;
pub use process::{Pid, Process, ProcessFlags, Step, Tracee};
pub use registry::{Registry, Visit};
pub use regs::Registers;
pub use trace::{Kernel, Ptrace};

pub use nix::sys::ptrace::Options;
