//! Lantern LibOS signal-delivery core
//!
//! Converts asynchronous host events delivered by the Platform Abstraction
//! Layer (hardware faults, quit/suspend/resume notifications, cross-thread
//! signals) into POSIX-shaped signal deliveries on the application's own
//! stack: per-thread masks and dispositions, alternate signal stacks,
//! default actions with core-dump flagging, and `sigreturn` chaining.
//!
//! The core never delivers while executing inside LibOS or PAL code; queued
//! signals are drained at safe points (syscall return, or an interrupted
//! pure application context).
//!
//! x86-64 only.

#![no_std]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("the signal core targets x86-64 only");

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod logger;

pub mod errno;
pub mod fpu;
pub mod pal;
pub mod probe;
pub mod signal;
pub mod sysret;
pub mod tcb;
pub mod thread;
pub mod tls;
pub mod upcall;
pub mod vma;

pub use probe::{test_user_memory, test_user_string};
pub use signal::deliver::{
    append_signal, deliver_signal, deliver_signal_on_sysret, get_sig_mask, handle_exit_signal,
    handle_next_signal, handle_signal, handle_sysret_signal, set_sig_mask,
};
pub use upcall::init_signal;

/// One page, the granularity of the memory probes and fault accounting.
pub const PAGE_SIZE: u64 = 4096;
