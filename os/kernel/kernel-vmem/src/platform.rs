//! # Platform seams
//!
//! The virtual-memory core does not allocate physical memory, touch control
//! registers, or send interrupts itself. It asks the platform through three
//! traits:
//!
//! - [`FrameAlloc`] hands out and takes back physical frames.
//! - [`PhysMapper`] makes a physical range temporarily addressable; always
//!   used through [`ScopedMapping`].
//! - [`Cpu`] describes the **executing** core: its id, mode, root register,
//!   the fractal windows of its loaded table, and its TLB.
//!
//! [`Platform`] bundles all three and is implemented for anything that
//! implements them. The kernel provides one x86-64 implementation (see
//! [`mmu`](crate::mmu)); the unit tests provide an in-memory machine.

use crate::addresses::{Depth, PhysicalAddress, VirtualAddress};
use crate::entry::PageTableEntry;
use core::fmt;
use core::ptr::NonNull;
use kernel_info::memory::MAX_CORES;
use kernel_sync::Critical;

/// Index of a core, `0..core_count`.
pub type CpuId = usize;

/// Physical frame allocator.
pub trait FrameAlloc {
    /// Allocate `size` bytes of physical memory aligned to `align`.
    fn alloc(&self, size: u64, align: u64) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc`](Self::alloc).
    fn free(&self, pa: PhysicalAddress);
}

/// Temporary access to physical memory.
pub trait PhysMapper {
    /// Make `len` bytes at `pa` addressable and return where.
    ///
    /// # Safety
    /// The caller must pair this with [`unmap`](Self::unmap) and must not use
    /// the returned address afterwards.
    unsafe fn map(&self, pa: PhysicalAddress, len: u64) -> VirtualAddress;

    /// Release a range returned by [`map`](Self::map).
    ///
    /// # Safety
    /// `va` and `len` must come from a matching [`map`](Self::map) call.
    unsafe fn unmap(&self, va: VirtualAddress, len: u64);
}

/// The executing core.
pub trait Cpu: Critical {
    /// Id of the executing core.
    fn id(&self) -> CpuId;

    /// Number of cores in the system.
    fn core_count(&self) -> usize;

    /// Root table currently loaded on the executing core.
    fn active_root(&self) -> PhysicalAddress;

    /// Load `root` into the executing core's root register.
    ///
    /// # Safety
    /// `root` must be a complete table that keeps the running kernel mapped.
    unsafe fn load_root(&self, root: PhysicalAddress);

    /// Pointer to the first entry of the **loaded** table at `depth` that
    /// covers `va`.
    ///
    /// Every ancestor entry must be present and not a large page.
    fn table_window(&self, va: VirtualAddress, depth: Depth) -> NonNull<PageTableEntry>;

    /// Drop cached translations for `[start, start + len)` on the executing
    /// core. Both are 4 KiB aligned.
    fn invalidate_local(&self, start: VirtualAddress, len: u64);

    /// Have every core in `targets` drop cached translations for
    /// `[start, start + len)`; returns once all of them have done so.
    fn deliver_invalidation(&self, targets: CpuMask, start: VirtualAddress, len: u64);
}

/// Everything the virtual-memory core needs from the machine.
pub trait Platform: FrameAlloc + PhysMapper + Cpu {}

impl<T: FrameAlloc + PhysMapper + Cpu + ?Sized> Platform for T {}

/// RAII temporary mapping of a physical range.
///
/// ```rust
/// # use kernel_vmem::{PhysMapper, PhysicalAddress, ScopedMapping, VirtualAddress};
/// struct Identity;
/// impl PhysMapper for Identity {
///     unsafe fn map(&self, pa: PhysicalAddress, _len: u64) -> VirtualAddress {
///         VirtualAddress::new(pa.as_u64())
///     }
///     unsafe fn unmap(&self, _va: VirtualAddress, _len: u64) {}
/// }
///
/// let m = unsafe { ScopedMapping::new(&Identity, PhysicalAddress::new(0x3000), 0x1000) };
/// assert_eq!(m.start(), VirtualAddress::new(0x3000));
/// ```
#[must_use = "the mapping is released when the guard is dropped"]
pub struct ScopedMapping<'m, M: PhysMapper + ?Sized> {
    mapper: &'m M,
    start: VirtualAddress,
    len: u64,
}

impl<'m, M: PhysMapper + ?Sized> ScopedMapping<'m, M> {
    /// Map `len` bytes at `pa` until the guard is dropped.
    ///
    /// # Safety
    /// `pa..pa + len` must be memory the caller is allowed to access.
    pub unsafe fn new(mapper: &'m M, pa: PhysicalAddress, len: u64) -> Self {
        let start = unsafe { mapper.map(pa, len) };
        Self { mapper, start, len }
    }

    #[inline]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// The mapped range viewed as a page table.
    #[inline]
    pub fn as_table(&self) -> NonNull<PageTableEntry> {
        debug_assert!(self.len >= crate::entry::TABLE_SIZE);
        NonNull::new(self.start.as_mut_ptr()).unwrap_or(NonNull::dangling())
    }
}

impl<M: PhysMapper + ?Sized> Drop for ScopedMapping<'_, M> {
    fn drop(&mut self) {
        unsafe { self.mapper.unmap(self.start, self.len) }
    }
}

/// A set of cores, one bit per [`CpuId`].
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn insert(&mut self, cpu: CpuId) {
        assert!(cpu < MAX_CORES);
        self.0 |= 1 << cpu;
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < MAX_CORES && self.0 & (1 << cpu) != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let cpu = rest.trailing_zeros() as CpuId;
            rest &= rest - 1;
            Some(cpu)
        })
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for cpu in iter {
            mask.insert(cpu);
        }
        mask
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
