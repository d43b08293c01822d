//! Interrupt-flag based restricted mode for x86-64.
//!
//! On a single core, "restricted mode" is exactly "`RFLAGS.IF` is clear":
//! nothing can preempt the executing code. [`InterruptFlag`] implements
//! [`Critical`] on top of `cli`/`sti`, and [`IrqGuard`] is the plain RAII form.
//!
//! # Safety & Privilege
//!
//! `cli`/`sti` are only legal at CPL0 (or with suitable IOPL). Calling any of
//! this from user space faults.

use crate::Critical;

/// `RFLAGS.IF`, bit 9.
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// Whether interrupts are currently enabled on this core.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & RFLAGS_IF != 0
}

/// [`Critical`] implementation for the executing x86-64 core.
///
/// Zero-sized: the state lives in `RFLAGS`, which is per core by construction.
#[derive(Debug, Default, Copy, Clone)]
pub struct InterruptFlag;

impl Critical for InterruptFlag {
    #[inline]
    fn is_critical(&self) -> bool {
        !interrupts_enabled()
    }

    #[inline]
    fn enter_critical(&self) -> bool {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        !enabled
    }

    #[inline]
    fn leave_critical(&self, nested: bool) {
        if !nested {
            sti_enable_interrupts();
        }
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `sti` is executed on drop **only** if interrupts were enabled when the
/// guard was created, restoring the previous state.
///
/// ```no_run
/// use kernel_sync::irq::{IrqGuard, rflags};
///
/// let before = rflags();
/// {
///     let _g = IrqGuard::new(); // interrupts disabled here if previously enabled
/// }
/// let after = rflags(); // IF restored to prior state
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let nested = InterruptFlag.enter_critical();
        Self {
            were_enabled: !nested,
        }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        InterruptFlag.leave_critical(!self.were_enabled);
    }
}
