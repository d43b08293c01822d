//! # Translation-cache coherence
//!
//! Each core caches translations of the table it has loaded. When a mapping
//! changes, every core that may hold the old translation has to drop it
//! before the change is considered complete.
//!
//! [`TlbCoordinator`] remembers which address space each core has loaded and
//! turns a changed range into a set of target cores:
//!
//! - ranges in the shared kernel region (below `KERNEL_END`) may be cached
//!   by any core with any space loaded;
//! - any other range is only cached by cores running the initiator's space.
//!
//! Delivery itself is the platform's job ([`Cpu::deliver_invalidation`]).
//! [`ShootdownMailbox`] is the handshake an interrupt-based platform uses
//! to implement it.

use crate::addresses::VirtualAddress;
use crate::platform::{Cpu, CpuId, CpuMask};
use alloc::boxed::Box;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::{KERNEL_END, MAX_CORES};
use kernel_sync::{SpinLock, assert_critical, assert_noncritical};

/// Granule of invalidation.
const PAGE: u64 = 0x1000;

/// Identity of an address space for the coordinator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(NonZeroU64);

impl AddressSpaceId {
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// Per-core record of the loaded address space.
pub struct TlbCoordinator {
    /// One slot per core; 0 while no address space is loaded.
    active: Box<[AtomicU64]>,
    next_id: AtomicU64,
}

impl TlbCoordinator {
    /// # Panics
    /// If `core_count` exceeds [`MAX_CORES`].
    #[must_use]
    pub fn new(core_count: usize) -> Self {
        assert!(
            core_count <= MAX_CORES,
            "{core_count} cores exceed the supported {MAX_CORES}"
        );
        Self {
            active: (0..core_count).map(|_| AtomicU64::new(0)).collect(),
            next_id: AtomicU64::new(1),
        }
    }

    #[inline]
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.active.len()
    }

    /// A fresh id, never handed out before.
    pub fn allocate_id(&self) -> AddressSpaceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        AddressSpaceId(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Record that the executing core is about to load `space`.
    ///
    /// Must be called in restricted mode, immediately before the root
    /// register is written.
    pub fn will_set_address_space<C: Cpu + ?Sized>(&self, cpu: &C, space: AddressSpaceId) {
        assert_critical(cpu, "TlbCoordinator::will_set_address_space");
        log::trace!("core {} switches to address space {}", cpu.id(), space.get());
        self.active[cpu.id()].store(space.get(), Ordering::SeqCst);
    }

    /// The address space recorded for `core`.
    #[must_use]
    pub fn active_on(&self, core: CpuId) -> Option<AddressSpaceId> {
        NonZeroU64::new(self.active.get(core)?.load(Ordering::SeqCst)).map(AddressSpaceId)
    }

    /// Cores currently recorded as running `space`.
    #[must_use]
    pub fn cores_running(&self, space: AddressSpaceId) -> CpuMask {
        (0..self.core_count())
            .filter(|&c| self.active_on(c) == Some(space))
            .collect()
    }

    /// Cores other than `initiator` that may cache a translation in
    /// `[start, start + len)`, given that `initiator` runs `own`.
    #[must_use]
    pub fn targets(&self, initiator: CpuId, own: Option<AddressSpaceId>, start: VirtualAddress) -> CpuMask {
        let kernel = start.as_u64() < KERNEL_END;
        (0..self.core_count())
            .filter(|&c| c != initiator)
            .filter(|&c| match self.active_on(c) {
                None => false,
                Some(_) if kernel => true,
                theirs => own.is_some() && theirs == own,
            })
            .collect()
    }

    /// Invalidate `[start, start + len)` locally, then on every other core
    /// that may cache it. Returns after all targets have invalidated.
    ///
    /// The range is widened to whole 4 KiB pages. Normal mode only; the
    /// initiator may have to wait for other cores.
    pub fn distribute_invlpg<C: Cpu + ?Sized>(&self, cpu: &C, start: VirtualAddress, len: u64) {
        assert_noncritical(cpu, "TlbCoordinator::distribute_invlpg");
        if len == 0 {
            return;
        }

        // Page count without forming the exclusive end, which is 2^64 for
        // the last page.
        let first = start.align_down(PAGE);
        let pages = (start - first).saturating_add(len).div_ceil(PAGE);
        let len = pages.saturating_mul(PAGE);

        let me = cpu.id();
        cpu.invalidate_local(first, len);

        let targets = self.targets(me, self.active_on(me), first);
        if !targets.is_empty() {
            log::trace!("shootdown {first}+{len:#x} from core {me} to {targets:?}");
            cpu.deliver_invalidation(targets, first, len);
        }
    }
}

/// Initiator/target handshake for interrupt-driven shootdowns.
///
/// The initiator [`post`](Self::post)s a range and its targets, sends each
/// target an interrupt, and [`wait`](Self::wait)s. Each target's interrupt
/// handler calls [`service`](Self::service), which invalidates and
/// acknowledges. One request is in flight at a time.
///
/// ```
/// # use kernel_vmem::{CpuMask, ShootdownMailbox, VirtualAddress};
/// let mailbox = ShootdownMailbox::new();
/// let targets: CpuMask = [1].into_iter().collect();
/// let ticket = mailbox.post(targets, VirtualAddress::new(0x4000), 0x1000);
/// assert!(mailbox.service(1, |start, len| assert_eq!((start.as_u64(), len), (0x4000, 0x1000))));
/// ticket.wait();
/// ```
pub struct ShootdownMailbox {
    serialize: SpinLock<()>,
    start: AtomicU64,
    len: AtomicU64,
    /// Targets that have not acknowledged yet.
    pending: AtomicU64,
}

impl Default for ShootdownMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ShootdownMailbox {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            serialize: SpinLock::new(()),
            start: AtomicU64::new(0),
            len: AtomicU64::new(0),
            pending: AtomicU64::new(0),
        }
    }

    /// Publish a request for `targets`.
    ///
    /// Blocks while another request is in flight. The request stays posted
    /// until the returned ticket has been waited on.
    pub fn post(&self, targets: CpuMask, start: VirtualAddress, len: u64) -> ShootdownTicket<'_> {
        let guard = self.serialize.lock();
        self.start.store(start.as_u64(), Ordering::Relaxed);
        self.len.store(len, Ordering::Relaxed);
        self.pending.store(targets.bits(), Ordering::Release);
        ShootdownTicket {
            mailbox: self,
            _guard: guard,
        }
    }

    /// Run on target `me`: if a request is pending for it, invalidate and
    /// acknowledge. Returns whether there was one.
    pub fn service<F: FnOnce(VirtualAddress, u64)>(&self, me: CpuId, invalidate: F) -> bool {
        let bit = 1u64 << me;
        if self.pending.load(Ordering::Acquire) & bit == 0 {
            return false;
        }
        let start = VirtualAddress::new(self.start.load(Ordering::Relaxed));
        let len = self.len.load(Ordering::Relaxed);
        invalidate(start, len);
        self.pending.fetch_and(!bit, Ordering::AcqRel);
        true
    }

    /// Targets that have not acknowledged the request in flight.
    #[must_use]
    pub fn pending(&self) -> CpuMask {
        CpuMask::from_bits(self.pending.load(Ordering::Acquire))
    }
}

/// A posted request; waiting on it releases the mailbox.
#[must_use = "the request stays in flight until waited on"]
pub struct ShootdownTicket<'a> {
    mailbox: &'a ShootdownMailbox,
    _guard: kernel_sync::SpinLockGuard<'a, ()>,
}

impl ShootdownTicket<'_> {
    /// Spin until every target has acknowledged.
    pub fn wait(self) {
        while self.mailbox.pending.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Invalidation, SimMachine};
    use kernel_sync::ScopedCritical;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn load(tlb: &TlbCoordinator, sim: &SimMachine, cpu: CpuId, space: AddressSpaceId) {
        sim.switch_to(cpu);
        let _c = ScopedCritical::new(sim);
        tlb.will_set_address_space(sim, space);
    }

    #[test]
    fn ids_are_unique() {
        let tlb = TlbCoordinator::new(1);
        let a = tlb.allocate_id();
        let b = tlb.allocate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn slots_follow_will_set() {
        let sim = SimMachine::new(2);
        let tlb = TlbCoordinator::new(2);
        let a = tlb.allocate_id();
        assert_eq!(tlb.active_on(1), None);
        load(&tlb, &sim, 1, a);
        assert_eq!(tlb.active_on(1), Some(a));
        assert_eq!(tlb.active_on(0), None);
        assert_eq!(tlb.cores_running(a).iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(tlb.active_on(7), None);
    }

    #[test]
    #[should_panic(expected = "must run in restricted mode")]
    fn will_set_requires_restricted_mode() {
        let sim = SimMachine::new(1);
        let tlb = TlbCoordinator::new(1);
        tlb.will_set_address_space(&sim, tlb.allocate_id());
    }

    #[test]
    fn user_range_reaches_only_cores_sharing_the_space() {
        let sim = SimMachine::new(4);
        let tlb = TlbCoordinator::new(4);
        let a = tlb.allocate_id();
        let b = tlb.allocate_id();
        load(&tlb, &sim, 0, a);
        load(&tlb, &sim, 1, a);
        load(&tlb, &sim, 2, b);

        sim.switch_to(0);
        sim.clear_invalidations();
        tlb.distribute_invlpg(&sim, VirtualAddress::new(0x80_0000_1000), 0x2000);

        assert_eq!(
            sim.invalidations(),
            vec![
                Invalidation {
                    cpu: 0,
                    start: VirtualAddress::new(0x80_0000_1000),
                    len: 0x2000,
                    remote: false
                },
                Invalidation {
                    cpu: 1,
                    start: VirtualAddress::new(0x80_0000_1000),
                    len: 0x2000,
                    remote: true
                },
            ]
        );
    }

    #[test]
    fn kernel_range_reaches_every_loaded_core() {
        let sim = SimMachine::new(4);
        let tlb = TlbCoordinator::new(4);
        let a = tlb.allocate_id();
        let b = tlb.allocate_id();
        load(&tlb, &sim, 1, a);
        load(&tlb, &sim, 2, b);

        sim.switch_to(0);
        let targets = tlb.targets(0, None, VirtualAddress::new(0x20_0000));
        assert_eq!(targets.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn initiator_without_a_space_reaches_no_user_targets() {
        let tlb = TlbCoordinator::new(2);
        let sim = SimMachine::new(2);
        load(&tlb, &sim, 1, tlb.allocate_id());
        assert!(tlb.targets(0, None, VirtualAddress::new(0x100_0000_0000)).is_empty());
    }

    #[test]
    fn ranges_are_widened_to_pages() {
        let sim = SimMachine::new(1);
        let tlb = TlbCoordinator::new(1);
        tlb.distribute_invlpg(&sim, VirtualAddress::new(0x80_0000_0ff8), 0x10);
        let log = sim.invalidations();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].start, VirtualAddress::new(0x80_0000_0000));
        assert_eq!(log[0].len, 0x2000);
    }

    #[test]
    fn last_page_of_the_address_space() {
        let sim = SimMachine::new(1);
        let tlb = TlbCoordinator::new(1);
        tlb.distribute_invlpg(&sim, VirtualAddress::new(0xffff_ffff_ffff_f000), 0x1000);
        tlb.distribute_invlpg(&sim, VirtualAddress::new(0xffff_ffff_ffff_fff0), 0x10);
        let log = sim.invalidations();
        assert_eq!(log.len(), 2);
        for inv in log {
            assert_eq!(inv.start, VirtualAddress::new(0xffff_ffff_ffff_f000));
            assert_eq!(inv.len, 0x1000);
        }
    }

    #[test]
    fn empty_range_is_a_no_op() {
        let sim = SimMachine::new(1);
        TlbCoordinator::new(1).distribute_invlpg(&sim, VirtualAddress::new(0x1000), 0);
        assert!(sim.invalidations().is_empty());
    }

    #[test]
    #[should_panic(expected = "must not run in restricted mode")]
    fn distribute_requires_normal_mode() {
        let sim = SimMachine::new(1);
        let _c = ScopedCritical::new(&sim);
        TlbCoordinator::new(1).distribute_invlpg(&sim, VirtualAddress::new(0x1000), 0x1000);
    }

    #[test]
    fn mailbox_handshake_across_threads() {
        const TARGETS: [CpuId; 3] = [1, 2, 3];
        let mailbox = Arc::new(ShootdownMailbox::new());
        let doorbells: Arc<Vec<AtomicBool>> = Arc::new((0..4).map(|_| AtomicBool::new(false)).collect());
        let seen: Arc<Vec<AtomicU64>> = Arc::new((0..4).map(|_| AtomicU64::new(0)).collect());

        let handles: Vec<_> = TARGETS
            .iter()
            .map(|&cpu| {
                let mailbox = Arc::clone(&mailbox);
                let doorbells = Arc::clone(&doorbells);
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    while !doorbells[cpu].swap(false, Ordering::AcqRel) {
                        std::hint::spin_loop();
                    }
                    let serviced = mailbox.service(cpu, |start, len| {
                        seen[cpu].store(start.as_u64() + len, Ordering::SeqCst);
                    });
                    assert!(serviced);
                })
            })
            .collect();

        let ticket = mailbox.post(TARGETS.into_iter().collect(), VirtualAddress::new(0x7000), 0x3000);
        for cpu in TARGETS {
            doorbells[cpu].store(true, Ordering::Release);
        }
        ticket.wait();
        assert!(mailbox.pending().is_empty());

        for h in handles {
            h.join().unwrap();
        }
        for cpu in TARGETS {
            assert_eq!(seen[cpu].load(Ordering::SeqCst), 0xa000);
        }
        assert_eq!(seen[0].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn service_without_request_is_ignored() {
        let mailbox = ShootdownMailbox::new();
        assert!(!mailbox.service(2, |_, _| panic!("nothing was posted")));
    }
}
