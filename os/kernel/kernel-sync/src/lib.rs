//! # Kernel synchronization primitives
//!
//! - [`SpinLock`]: the lock serializing address-space mutations and shootdowns.
//! - [`Critical`] / [`ScopedCritical`]: restricted-mode (interrupts off) queries
//!   and sections, with assertion helpers for code that must or must not run
//!   in restricted mode.
//! - [`irq`]: the x86-64 implementation of [`Critical`] based on `RFLAGS.IF`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod critical;
#[cfg(target_arch = "x86_64")]
pub mod irq;
mod spin_lock;

pub use critical::{Critical, ScopedCritical, assert_critical, assert_noncritical};
#[cfg(target_arch = "x86_64")]
pub use irq::{InterruptFlag, IrqGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
