//! # Hierarchical page table
//!
//! One four-level tree rooted at one physical frame. [`PageTable`] owns the
//! frames of every non-leaf level below the root (the root itself belongs to
//! whoever created it) and never owns the frames its leaves map.
//!
//! Lookups and mutations go through the fractal windows of the **loaded**
//! table, so they require the table to be active on the executing core.
//! Teardown is the exception: it runs while the table is *not* loaded and
//! reaches each level through a [`ScopedMapping`].
//!
//! ## Invariants
//! - Every present non-leaf entry points at a table that was zero-filled when
//!   it was linked.
//! - An intermediate table is freed as soon as its last entry is cleared, and
//!   its window is shot down on every core first.
//! - Slot 511 of the root points at the root and is never followed by
//!   teardown.

use crate::addresses::{Depth, MapSize, PageSize, PhysicalAddress, VirtualAddress};
use crate::context::VmContext;
use crate::entry::{Attributes, ENTRIES_PER_TABLE, PageTableEntry, TABLE_SIZE};
use crate::error::SetError;
use crate::fractal;
use crate::platform::{Platform, ScopedMapping};
use core::ptr::NonNull;
use kernel_info::memory::FRACTAL_PML4_INDEX;
use kernel_sync::assert_noncritical;

/// Result of a successful [`PageTable::walk`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Walk {
    /// The terminal entry.
    pub entry: PageTableEntry,
    /// Depth the walk stopped at.
    pub depth: Depth,
    /// Size of the page backing the address.
    pub size: PageSize,
}

/// Result of [`PageTable::read`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    /// Base of the backing page.
    pub phys: PhysicalAddress,
    pub attributes: Attributes,
    pub size: PageSize,
}

/// Result of a successful [`PageTable::set`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SetOutcome {
    /// The replaced entry was non-zero.
    pub overwrote: bool,
}

/// 512 entries reachable through a pointer.
#[derive(Copy, Clone)]
struct TableView(NonNull<PageTableEntry>);

impl TableView {
    /// # Safety
    /// `first` must point at 512 entries that stay valid while the view is used.
    const unsafe fn new(first: NonNull<PageTableEntry>) -> Self {
        Self(first)
    }

    fn get(self, index: usize) -> PageTableEntry {
        debug_assert!(index < ENTRIES_PER_TABLE);
        unsafe { self.0.add(index).read_volatile() }
    }

    fn set(self, index: usize, entry: PageTableEntry) {
        debug_assert!(index < ENTRIES_PER_TABLE);
        unsafe { self.0.add(index).write_volatile(entry) }
    }

    fn is_empty(self) -> bool {
        (0..ENTRIES_PER_TABLE).all(|i| self.get(i).is_zero())
    }

    fn clear(self) {
        for i in 0..ENTRIES_PER_TABLE {
            self.set(i, PageTableEntry::zero());
        }
    }
}

/// A four-level tree rooted at one frame.
pub struct PageTable<'k, P: Platform + ?Sized> {
    ctx: &'k VmContext<'k, P>,
    root: PhysicalAddress,
}

impl<'k, P: Platform + ?Sized> PageTable<'k, P> {
    /// Wrap an existing root frame.
    pub const fn new(ctx: &'k VmContext<'k, P>, root: PhysicalAddress) -> Self {
        Self { ctx, root }
    }

    #[inline]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Whether the executing core has this table loaded.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.ctx.platform().active_root() == self.root
    }

    /// Entry mapping `pa` as a leaf of `size`.
    #[must_use]
    pub const fn leaf_entry(
        pa: PhysicalAddress,
        size: PageSize,
        kernel: bool,
        attributes: Attributes,
    ) -> PageTableEntry {
        PageTableEntry::leaf_flags(size, kernel, attributes).with_physical_address(pa)
    }

    #[track_caller]
    fn check_live(&self, operation: &str) {
        assert_noncritical(self.ctx.platform(), operation);
        debug_assert!(
            self.is_active(),
            "{operation} on table {} while {} is loaded",
            self.root,
            self.ctx.platform().active_root()
        );
    }

    fn table(&self, va: VirtualAddress, depth: Depth) -> TableView {
        unsafe { TableView::new(self.ctx.platform().table_window(va, depth)) }
    }

    fn entry(&self, va: VirtualAddress, depth: Depth) -> PageTableEntry {
        self.table(va, depth).get(va.index(depth))
    }

    /// Find the entry translating `va`.
    ///
    /// Stops at the first absent entry (`None`) or at a leaf: a large page at
    /// depth 1 or 2, or any entry at depth 3.
    pub fn walk(&self, va: VirtualAddress) -> Option<Walk> {
        self.check_live("PageTable::walk");
        self.find(va)
    }

    fn find(&self, va: VirtualAddress) -> Option<Walk> {
        for depth in Depth::ALL {
            let entry = self.entry(va, depth);
            if !entry.present() {
                return None;
            }
            let leaf = match depth {
                Depth::Pml4 => None,
                Depth::Pdpt | Depth::Pd if !entry.large_page() => None,
                _ => depth.leaf_size(),
            };
            if let Some(size) = leaf {
                return Some(Walk { entry, depth, size });
            }
        }
        None
    }

    /// Install `entry` for `va` at `depth`.
    ///
    /// Missing intermediate tables are allocated and zero-filled; existing
    /// ones get `parent_flags` OR-ed in. If a large page above `depth`
    /// already covers `va`, or a large leaf would replace the link to a
    /// populated table, nothing is modified.
    ///
    /// # Panics
    /// If `va` is not aligned to the span of `depth`, or an intermediate
    /// table cannot be allocated.
    pub fn set(
        &self,
        va: VirtualAddress,
        entry: PageTableEntry,
        parent_flags: PageTableEntry,
        depth: Depth,
    ) -> Result<SetOutcome, SetError> {
        self.check_live("PageTable::set");
        assert!(
            va.is_aligned(depth.span()),
            "{va} is not aligned for a leaf at {depth:?}"
        );

        // Probe first so a refused set leaves no trace.
        let mut path_exists = true;
        for d in &Depth::ALL[..depth.as_usize()] {
            let existing = self.entry(va, *d);
            if !existing.present() {
                path_exists = false;
                break;
            }
            if existing.large_page() {
                log::debug!("set {va}: blocked by large page at {d:?}");
                return Err(SetError::BlockedByLargePage { depth: *d });
            }
        }
        if path_exists && depth != Depth::Pt {
            let existing = self.entry(va, depth);
            if existing.present() && !existing.large_page() {
                log::debug!("set {va}: {depth:?} entry links a table");
                return Err(SetError::BlockedByTable { depth });
            }
        }

        let parent_flags = parent_flags.with_present(true);
        for d in &Depth::ALL[..depth.as_usize()] {
            let table = self.table(va, *d);
            let index = va.index(*d);
            let existing = table.get(index);
            if existing.present() {
                table.set(index, existing | parent_flags);
                continue;
            }

            let frame = self.alloc_table(va, *d);
            table.set(index, PageTableEntry::table_link(frame, parent_flags));
            if let Some(child) = d.child() {
                self.table(va, child).clear();
            }
        }

        let table = self.table(va, depth);
        let index = va.index(depth);
        let overwrote = !table.get(index).is_zero();
        table.set(index, entry);
        log::trace!("set {va} at {depth:?} = {:#018x}", entry.into_bits());
        Ok(SetOutcome { overwrote })
    }

    fn alloc_table(&self, va: VirtualAddress, parent: Depth) -> PhysicalAddress {
        if let Some(frame) = self.ctx.platform().alloc(TABLE_SIZE, TABLE_SIZE) {
            log::debug!("new table {frame} below {parent:?} for {va}");
            return frame;
        }
        log::error!("out of physical memory for a page table below {parent:?} ({va})");
        panic!("failed to allocate an intermediate page table for {va}");
    }

    /// Remove the leaf translating `va`, freeing every intermediate table
    /// this leaves empty. The root is kept.
    ///
    /// # Panics
    /// If nothing is mapped at `va`.
    pub fn unset(&self, va: VirtualAddress) {
        self.check_live("PageTable::unset");
        let Some(walk) = self.find(va) else {
            log::error!("unset {va}: not mapped");
            panic!("no mapping found for {va}");
        };

        let mut depth = walk.depth;
        self.table(va, depth).set(va.index(depth), PageTableEntry::zero());
        log::trace!("unset {va} at {depth:?}");

        while let Some(parent) = depth.parent() {
            if !self.table(va, depth).is_empty() {
                return;
            }
            let window = fractal::table_address(va, depth);
            let parent_table = self.table(va, parent);
            let index = va.index(parent);
            let frame = parent_table.get(index).physical_address();

            parent_table.set(index, PageTableEntry::zero());
            self.ctx.distribute_invlpg(window, TABLE_SIZE);
            self.ctx.platform().free(frame);
            log::debug!("freed empty {depth:?} table {frame} for {va}");
            depth = parent;
        }
    }

    /// Map `size.page_count` consecutive pages starting at `va` / `pa`.
    ///
    /// `leaf_flags` is applied to every leaf with the advancing physical
    /// address. Returns whether any previous entry was overwritten.
    ///
    /// # Panics
    /// If a large page or an existing table blocks any page of the run.
    pub fn set_list(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: MapSize,
        parent_flags: PageTableEntry,
        leaf_flags: PageTableEntry,
    ) -> bool {
        let step = size.page_size.bytes();
        let depth = size.page_size.depth();
        let mut overwrote = false;
        let (mut va, mut pa) = (va, pa);

        for _ in 0..size.page_count {
            let entry = leaf_flags.with_physical_address(pa);
            match self.set(va, entry, parent_flags, depth) {
                Ok(outcome) => overwrote |= outcome.overwrote,
                Err(err) => {
                    log::error!("set_list {va}: {err}");
                    panic!("cannot map {va}: {err}");
                }
            }
            va += step;
            pa += step;
        }
        overwrote
    }

    /// Physical page and attributes backing `va`.
    pub fn read(&self, va: VirtualAddress) -> Option<Translation> {
        self.check_live("PageTable::read");
        let walk = self.find(va)?;
        Some(Translation {
            phys: walk.entry.leaf_address(walk.size),
            attributes: walk.entry.attributes(),
            size: walk.size,
        })
    }

    /// Free every non-leaf frame of the tree, root included.
    ///
    /// Top-level entries below `start_index` are left alone (they are shared),
    /// as is the self-reference. The table must not be loaded on the
    /// executing core.
    pub fn free_table(&self, start_index: usize) {
        let platform = self.ctx.platform();
        assert_noncritical(platform, "PageTable::free_table");
        if self.is_active() {
            log::error!("free_table on the loaded table {}", self.root);
            panic!("cannot free page table {} while it is active", self.root);
        }
        log::debug!("freeing page table {} from index {start_index}", self.root);
        self.free_level(self.root, Depth::Pml4, start_index, FRACTAL_PML4_INDEX);
    }

    fn free_level(&self, frame: PhysicalAddress, depth: Depth, from: usize, to: usize) {
        let platform = self.ctx.platform();
        if let Some(child) = depth.child() {
            let mapping = unsafe { ScopedMapping::new(platform, frame, TABLE_SIZE) };
            let table = unsafe { TableView::new(mapping.as_table()) };
            for index in from..to {
                let entry = table.get(index);
                if !entry.present() || entry.large_page() {
                    continue;
                }
                self.free_level(entry.physical_address(), child, 0, ENTRIES_PER_TABLE);
            }
        }
        platform.free(frame);
    }
}
