//! # Restricted Mode
//!
//! Kernel code runs in one of two modes on each core:
//!
//! - **restricted** (critical): interrupts and preemption are off. Code here
//!   must finish in bounded time and must not block, take a sleeping lock, or
//!   allocate. Loading a new root page table and per-core bootstrap live here.
//! - **normal**: preemptible; may block and may allocate. Page-table and
//!   address-space mutations live here, because they may have to allocate a
//!   physical frame for an intermediate table.
//!
//! [`Critical`] is the seam through which code asks which mode the executing
//! core is in and switches into restricted mode. [`ScopedCritical`] brackets a
//! restricted section and restores the previous state when dropped, so
//! sections nest.

/// Query and control restricted mode on the executing core.
pub trait Critical {
    /// `true` if the executing core is in restricted mode.
    fn is_critical(&self) -> bool;

    /// Enter restricted mode.
    ///
    /// Returns `true` if the core already was in restricted mode, in which
    /// case the matching [`leave_critical`](Self::leave_critical) must not
    /// leave it.
    fn enter_critical(&self) -> bool;

    /// Leave restricted mode unless the matching enter was `nested`.
    fn leave_critical(&self, nested: bool);
}

/// RAII guard that keeps the executing core in restricted mode.
///
/// ```
/// use core::cell::Cell;
/// use kernel_sync::{Critical, ScopedCritical};
///
/// struct Flag(Cell<bool>);
/// impl Critical for Flag {
///     fn is_critical(&self) -> bool { self.0.get() }
///     fn enter_critical(&self) -> bool { self.0.replace(true) }
///     fn leave_critical(&self, nested: bool) { if !nested { self.0.set(false) } }
/// }
///
/// let core = Flag(Cell::new(false));
/// {
///     let _outer = ScopedCritical::new(&core);
///     {
///         let _inner = ScopedCritical::new(&core);
///     }
///     assert!(core.is_critical());
/// }
/// assert!(!core.is_critical());
/// ```
#[must_use = "restricted mode ends when the guard is dropped"]
pub struct ScopedCritical<'a, C: Critical + ?Sized> {
    ctx: &'a C,
    nested: bool,
}

impl<'a, C: Critical + ?Sized> ScopedCritical<'a, C> {
    #[inline]
    pub fn new(ctx: &'a C) -> Self {
        let nested = ctx.enter_critical();
        Self { ctx, nested }
    }
}

impl<C: Critical + ?Sized> Drop for ScopedCritical<'_, C> {
    #[inline]
    fn drop(&mut self) {
        self.ctx.leave_critical(self.nested);
    }
}

/// Halt if the executing core is **not** in restricted mode.
#[inline]
#[track_caller]
pub fn assert_critical<C: Critical + ?Sized>(ctx: &C, operation: &str) {
    if !ctx.is_critical() {
        log::error!("{operation} called outside restricted mode");
        panic!("{operation} must run in restricted mode");
    }
}

/// Halt if the executing core **is** in restricted mode.
#[inline]
#[track_caller]
pub fn assert_noncritical<C: Critical + ?Sized>(ctx: &C, operation: &str) {
    if ctx.is_critical() {
        log::error!("{operation} called in restricted mode");
        panic!("{operation} must not run in restricted mode");
    }
}
