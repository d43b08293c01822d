//! # Address Space (x86-64, PML4-rooted)
//!
//! A user address space: one [`PageTable`] plus a [`FreeList`] of unused
//! virtual ranges, kept consistent by one lock.
//!
//! ## Layout
//!
//! - Top-level entry 0 links the kernel's shared PDPT, so everything below
//!   `KERNEL_END` is the same in every space.
//! - Top-level entry 511 is the self-reference that makes the fractal windows
//!   work while the space is loaded.
//! - The 255 entries above the kernel in the lower half and the 255 entries
//!   below the fractal slot in the upper half are handed out by the free list.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map`] / [`AddressSpace::unmap`] pick and release the
//!   virtual range; [`AddressSpace::map_at`] and the `reserve*` family let the
//!   caller place ranges.
//! - [`AddressSpace::activate`] loads the root on the executing core and
//!   tells the [`TlbCoordinator`](crate::TlbCoordinator).
//! - Changes other cores may have cached are shot down before the call
//!   returns.
//!
//! ## Invariants
//!
//! - A virtual range is either free or reserved, never both; only reserved
//!   ranges are mapped.
//! - All mutations and reads run under the space's lock and in normal mode.
//! - Table mutations (and reads) require the space to be loaded on the
//!   executing core.

use crate::addresses::{MapSize, PageSize, PhysicalAddress, VirtualAddress};
use crate::context::VmContext;
use crate::entry::{Attributes, PageTableEntry, TABLE_SIZE};
use crate::error::VmError;
use crate::free_list::FreeList;
use crate::page_table::{PageTable, Translation};
use crate::platform::{Platform, ScopedMapping};
use crate::tlb::AddressSpaceId;
use kernel_info::memory::{
    FRACTAL_PML4_INDEX, KERNEL_END, KERNEL_PML4_INDEX, LOWER_USER_END, LOWER_USER_START,
    UPPER_USER_END, UPPER_USER_START,
};
use kernel_sync::{SpinLock, assert_critical, assert_noncritical};

/// Flags OR-ed into every intermediate entry of a user mapping.
pub const USER_PARENT_FLAGS: PageTableEntry = PageTableEntry::new()
    .with_present(true)
    .with_writable(true)
    .with_user(true);

/// Page sizes an address space hands out.
pub const PAGE_SIZES: [PageSize; 2] = [PageSize::Size4K, PageSize::Size2M];

/// What an [`AddressSpace`] supports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// Ranges can be reserved at a chosen address.
    pub placement_reserve: bool,
    /// Ranges can be mapped at a chosen address.
    pub placement_map: bool,
    pub executable_flag: bool,
    pub writable_flag: bool,
    pub cachable_flag: bool,
}

/// A user address space.
pub struct AddressSpace<'k, P: Platform + ?Sized> {
    id: AddressSpaceId,
    ctx: &'k VmContext<'k, P>,
    table: PageTable<'k, P>,
    /// Also serializes every change to `table`.
    free_list: SpinLock<FreeList>,
}

impl<'k, P: Platform + ?Sized> AddressSpace<'k, P> {
    /// Build an empty address space.
    ///
    /// The root links the shared kernel PDPT and itself; both user regions
    /// start out free.
    ///
    /// # Panics
    /// If no frame is available for the root.
    #[must_use]
    pub fn new(ctx: &'k VmContext<'k, P>) -> Self {
        let platform = ctx.platform();
        assert_noncritical(platform, "AddressSpace::new");

        let Some(root) = platform.alloc(TABLE_SIZE, TABLE_SIZE) else {
            log::error!("out of physical memory for an address-space root");
            panic!("failed to allocate the root page table of a new address space");
        };

        {
            let mapping = unsafe { ScopedMapping::new(platform, root, TABLE_SIZE) };
            let first = mapping.as_table();
            let link = PageTableEntry::new().with_writable(true);
            unsafe {
                for index in 0..crate::entry::ENTRIES_PER_TABLE {
                    first.add(index).write_volatile(PageTableEntry::zero());
                }
                first
                    .add(KERNEL_PML4_INDEX)
                    .write_volatile(PageTableEntry::table_link(ctx.kernel_pdpt(), link));
                first
                    .add(FRACTAL_PML4_INDEX)
                    .write_volatile(PageTableEntry::table_link(root, link));
            }
        }

        let mut free_list = FreeList::new();
        free_list.insert(LOWER_USER_START, LOWER_USER_END - LOWER_USER_START);
        free_list.insert(UPPER_USER_START, UPPER_USER_END - UPPER_USER_START);

        let id = ctx.tlb().allocate_id();
        log::debug!("address space {} created with root {root}", id.get());
        Self {
            id,
            ctx,
            table: PageTable::new(ctx, root),
            free_list: SpinLock::new(free_list),
        }
    }

    #[inline]
    pub const fn id(&self) -> AddressSpaceId {
        self.id
    }

    #[inline]
    pub const fn root(&self) -> PhysicalAddress {
        self.table.root()
    }

    /// Whether the executing core has this space loaded.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.table.is_active()
    }

    #[must_use]
    pub const fn capabilities() -> Capabilities {
        Capabilities {
            placement_reserve: true,
            placement_map: true,
            executable_flag: true,
            writable_flag: true,
            cachable_flag: true,
        }
    }

    #[must_use]
    pub const fn page_sizes() -> &'static [PageSize] {
        &PAGE_SIZES
    }

    /// Load this space on the executing core.
    ///
    /// # Safety
    /// Must run in restricted mode. Everything the running code touches must
    /// be mapped in the kernel region, which every space shares.
    pub unsafe fn activate(&self) {
        let platform = self.ctx.platform();
        assert_critical(platform, "AddressSpace::activate");
        self.ctx.tlb().will_set_address_space(platform, self.id);
        unsafe { platform.load_root(self.root()) };
    }

    /// Map `size` of physical memory starting at `pa` somewhere free.
    ///
    /// # Errors
    /// [`VmError::OutOfVirtualSpace`] if no free range fits.
    pub fn map(
        &self,
        pa: PhysicalAddress,
        size: MapSize,
        attributes: Attributes,
    ) -> Result<VirtualAddress, VmError> {
        assert_noncritical(self.ctx.platform(), "AddressSpace::map");
        let mut free = self.free_list.lock();
        let va = free.alloc(size).ok_or_else(|| {
            log::debug!("map {size}: no free range");
            VmError::OutOfVirtualSpace(size)
        })?;

        let leaf = PageTableEntry::leaf_flags(size.page_size, false, attributes);
        let overwrote = self.table.set_list(va, pa, size, USER_PARENT_FLAGS, leaf);
        debug_assert!(!overwrote, "free range {va} was mapped");
        log::trace!("mapped {pa}+{size} at {va}");
        Ok(va)
    }

    /// Map at a range the caller reserved.
    ///
    /// Replacing existing translations shoots the range down.
    ///
    /// # Panics
    /// If the range is not inside one user region.
    pub fn map_at(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: MapSize,
        attributes: Attributes,
    ) {
        assert_noncritical(self.ctx.platform(), "AddressSpace::map_at");
        let len = size.bytes();
        if !in_user_region(va, len) {
            log::error!("map_at {va}+{len:#x} outside the user regions");
            panic!("map_at {va}: range is not user space");
        }

        let free = self.free_list.lock();
        debug_assert!(!free.intersects(va, len), "map_at {va}: range is not reserved");
        let leaf = PageTableEntry::leaf_flags(size.page_size, false, attributes);
        if self.table.set_list(va, pa, size, USER_PARENT_FLAGS, leaf) {
            self.ctx.distribute_invlpg(va, len);
        }
        log::trace!("mapped {pa}+{size} at fixed {va}");
    }

    /// Unmap and release `[va, va + size)`.
    ///
    /// # Panics
    /// If any page of the range is not mapped.
    pub fn unmap(&self, va: VirtualAddress, size: MapSize) {
        assert_noncritical(self.ctx.platform(), "AddressSpace::unmap");
        let mut free = self.free_list.lock();
        self.unset_all(va, size);
        free.free(va, size);
        self.ctx.distribute_invlpg(va, size.bytes());
        log::trace!("unmapped {size} at {va}");
    }

    /// Unmap `[va, va + size)` but keep the range reserved.
    pub fn unmap_and_reserve(&self, va: VirtualAddress, size: MapSize) {
        assert_noncritical(self.ctx.platform(), "AddressSpace::unmap_and_reserve");
        let _free = self.free_list.lock();
        self.unset_all(va, size);
        self.ctx.distribute_invlpg(va, size.bytes());
    }

    fn unset_all(&self, va: VirtualAddress, size: MapSize) {
        let step = size.page_size.bytes();
        let mut page = va;
        for _ in 0..size.page_count {
            self.table.unset(page);
            page += step;
        }
    }

    /// Reserve a free range without mapping it.
    ///
    /// # Errors
    /// [`VmError::OutOfVirtualSpace`] if no free range fits.
    pub fn reserve(&self, size: MapSize) -> Result<VirtualAddress, VmError> {
        assert_noncritical(self.ctx.platform(), "AddressSpace::reserve");
        self.free_list
            .lock()
            .alloc(size)
            .ok_or(VmError::OutOfVirtualSpace(size))
    }

    /// Reserve exactly `[va, va + size)`.
    ///
    /// # Panics
    /// If the range is not inside one user region or any part of it is not
    /// free.
    pub fn reserve_at(&self, va: VirtualAddress, size: MapSize) {
        assert_noncritical(self.ctx.platform(), "AddressSpace::reserve_at");
        if !in_user_region(va, size.bytes()) {
            log::error!("reserve_at {va} ({size}) outside the user regions");
            panic!("cannot reserve {va} ({size}): range is not user space");
        }
        if !self.free_list.lock().alloc_at(va, size) {
            log::error!("reserve_at {va} ({size}): range not free");
            panic!("cannot reserve {va} ({size}): range is not free");
        }
    }

    /// Release a reservation that holds no mappings.
    ///
    /// # Panics
    /// If the range is not inside one user region or is already free.
    pub fn unreserve(&self, va: VirtualAddress, size: MapSize) {
        assert_noncritical(self.ctx.platform(), "AddressSpace::unreserve");
        if !in_user_region(va, size.bytes()) {
            log::error!("unreserve {va} ({size}) outside the user regions");
            panic!("cannot unreserve {va} ({size}): range is not user space");
        }
        self.free_list.lock().free(va, size);
    }

    /// View a reservation as pages of `page_size` instead.
    ///
    /// Nothing changes in the free list; the range must divide evenly.
    ///
    /// # Panics
    /// If `va` or the length is not a multiple of `page_size`.
    #[must_use]
    pub fn rereserve(&self, va: VirtualAddress, size: MapSize, page_size: PageSize) -> MapSize {
        let len = size.bytes();
        assert!(
            va.is_aligned(page_size.bytes()) && len.is_multiple_of(page_size.bytes()),
            "cannot view {va} ({size}) as {page_size} pages"
        );
        debug_assert!(!self.free_list.lock().intersects(va, len));
        MapSize::new(page_size, len / page_size.bytes())
    }

    /// Translate `va`.
    pub fn read(&self, va: VirtualAddress) -> Option<Translation> {
        assert_noncritical(self.ctx.platform(), "AddressSpace::read");
        let _free = self.free_list.lock();
        self.table.read(va)
    }

    /// Whether all of `[va, va + len)` is free (neither reserved nor mapped).
    pub fn is_free(&self, va: VirtualAddress, len: u64) -> bool {
        self.free_list.lock().contains(va, len)
    }

    /// Copy user memory at `start` into `dest`.
    ///
    /// A range that wraps or starts in the kernel region is not copied; the
    /// page-fault delegate sees a read fault at `start` instead.
    ///
    /// # Safety
    /// This space must be loaded, and the range must be mapped or the fault
    /// must be handled by the caller's fault path.
    pub unsafe fn copy_to_kernel(&self, dest: &mut [u8], start: VirtualAddress) {
        if Self::outside_user(start, dest.len()) {
            self.ctx.raise_page_fault(start, false);
            return;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(start.as_ptr::<u8>(), dest.as_mut_ptr(), dest.len());
        }
    }

    /// Copy `src` into user memory at `dest`.
    ///
    /// A range that wraps or starts in the kernel region is not written; the
    /// page-fault delegate sees a write fault at `dest` instead.
    ///
    /// # Safety
    /// See [`copy_to_kernel`](Self::copy_to_kernel).
    pub unsafe fn copy_from_kernel(&self, dest: VirtualAddress, src: &[u8]) {
        if Self::outside_user(dest, src.len()) {
            self.ctx.raise_page_fault(dest, true);
            return;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dest.as_mut_ptr::<u8>(), src.len());
        }
    }

    fn outside_user(start: VirtualAddress, len: usize) -> bool {
        start.checked_add(len as u64).is_none() || start.as_u64() < KERNEL_END
    }
}

/// Whether `[va, va + len)` lies inside the lower or the upper user region.
fn in_user_region(va: VirtualAddress, len: u64) -> bool {
    let start = va.as_u64();
    let Some(end) = start.checked_add(len) else {
        return false;
    };
    let lower = LOWER_USER_START <= start && end <= LOWER_USER_END;
    let upper = UPPER_USER_START <= start && end <= UPPER_USER_END;
    lower || upper
}

impl<P: Platform + ?Sized> Drop for AddressSpace<'_, P> {
    fn drop(&mut self) {
        log::debug!("address space {} destroyed", self.id.get());
        self.table.free_table(KERNEL_PML4_INDEX + 1);
    }
}
