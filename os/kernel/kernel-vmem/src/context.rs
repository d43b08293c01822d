//! # VM context
//!
//! State shared by every address space for the lifetime of the kernel: the
//! platform handle, the [`TlbCoordinator`], the kernel's shared PDPT and the
//! page-fault delegate. Created once at bring-up and borrowed by everything
//! built on top of it.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::platform::Platform;
use crate::tlb::TlbCoordinator;
use kernel_sync::SpinLock;

/// Handler for faults the kernel raises on behalf of a user access.
///
/// Receives the faulting address and whether the access was a write.
pub type PageDelegate = fn(VirtualAddress, bool);

pub struct VmContext<'k, P: Platform + ?Sized> {
    platform: &'k P,
    tlb: TlbCoordinator,
    kernel_pdpt: PhysicalAddress,
    page_delegate: SpinLock<Option<PageDelegate>>,
}

impl<'k, P: Platform + ?Sized> VmContext<'k, P> {
    /// `kernel_pdpt` is the table every address space links at top-level
    /// entry 0.
    pub fn new(platform: &'k P, kernel_pdpt: PhysicalAddress) -> Self {
        log::debug!(
            "vm context: {} cores, kernel PDPT at {kernel_pdpt}",
            platform.core_count()
        );
        Self {
            platform,
            tlb: TlbCoordinator::new(platform.core_count()),
            kernel_pdpt,
            page_delegate: SpinLock::new(None),
        }
    }

    #[inline]
    pub const fn platform(&self) -> &'k P {
        self.platform
    }

    #[inline]
    pub const fn tlb(&self) -> &TlbCoordinator {
        &self.tlb
    }

    #[inline]
    pub const fn kernel_pdpt(&self) -> PhysicalAddress {
        self.kernel_pdpt
    }

    /// Install (or with `None`, remove) the page-fault delegate.
    pub fn set_page_delegate(&self, delegate: Option<PageDelegate>) {
        *self.page_delegate.lock() = delegate;
    }

    pub fn page_delegate(&self) -> Option<PageDelegate> {
        *self.page_delegate.lock()
    }

    /// Hand a faulting access to the delegate.
    ///
    /// # Panics
    /// If no delegate is registered.
    #[track_caller]
    pub fn raise_page_fault(&self, va: VirtualAddress, is_write: bool) {
        let Some(delegate) = self.page_delegate() else {
            log::error!("page fault at {va} (write: {is_write}) with no delegate");
            panic!("page fault at {va} without a page-fault delegate");
        };
        log::trace!("routing page fault at {va} (write: {is_write})");
        delegate(va, is_write);
    }

    /// Invalidate `[start, start + len)` on every core that may cache it.
    #[inline]
    pub fn distribute_invlpg(&self, start: VirtualAddress, len: u64) {
        self.tlb.distribute_invlpg(self.platform, start, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimMachine;
    use std::sync::atomic::{AtomicU64, Ordering};

    static LAST_FAULT: AtomicU64 = AtomicU64::new(0);

    fn record(va: VirtualAddress, is_write: bool) {
        LAST_FAULT.store(va.as_u64() | u64::from(is_write), Ordering::SeqCst);
    }

    #[test]
    fn delegate_receives_faults() {
        let sim = SimMachine::new(1);
        let ctx = VmContext::new(&sim, sim.kernel_pdpt());
        assert!(ctx.page_delegate().is_none());
        ctx.set_page_delegate(Some(record));
        ctx.raise_page_fault(VirtualAddress::new(0x4000), true);
        assert_eq!(LAST_FAULT.load(Ordering::SeqCst), 0x4001);
    }

    #[test]
    #[should_panic(expected = "without a page-fault delegate")]
    fn fault_without_delegate_is_fatal() {
        let sim = SimMachine::new(1);
        let ctx = VmContext::new(&sim, sim.kernel_pdpt());
        ctx.raise_page_fault(VirtualAddress::new(0x1000), false);
    }

    #[test]
    fn coordinator_tracks_every_core() {
        let sim = SimMachine::new(3);
        let ctx = VmContext::new(&sim, sim.kernel_pdpt());
        assert_eq!(ctx.tlb().core_count(), 3);
        assert_eq!(ctx.kernel_pdpt(), sim.kernel_pdpt());
    }
}
