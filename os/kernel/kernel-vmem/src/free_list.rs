//! # Virtual free list
//!
//! Free virtual space of one address space as an address-ordered set of
//! extents. Allocation is first-fit with the page size as alignment; frees
//! coalesce with both neighbours.
//!
//! ```text
//!   before alloc(2M, 1):  [0x80_0000_1000 ............................ 0x80_4000_0000)
//!   after:                [0x80_0000_1000 .. 0x80_0020_0000) [0x80_0040_0000 .. 0x80_4000_0000)
//!                                                 ^ allocated 0x80_0020_0000 .. 0x80_0040_0000
//! ```
//!
//! # Invariants
//! - Extents are non-empty, never overlap and never touch (touching extents
//!   are merged).
//! - A range handed out is absent from the list until returned.

use crate::addresses::{MapSize, VirtualAddress};
use alloc::collections::BTreeMap;

/// First-fit, coalescing free list over virtual addresses.
#[derive(Debug, Default, Clone)]
pub struct FreeList {
    /// start -> end (exclusive)
    extents: BTreeMap<u64, u64>,
}

impl FreeList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            extents: BTreeMap::new(),
        }
    }

    /// Lowest address aligned to the page size with room for `size`.
    pub fn alloc(&mut self, size: MapSize) -> Option<VirtualAddress> {
        let align = size.page_size.bytes();
        let len = size.page_size.bytes().checked_mul(size.page_count)?;
        if len == 0 {
            return None;
        }

        let base = self.extents.iter().find_map(|(&start, &end)| {
            let base = start.checked_add(align - 1)? & !(align - 1);
            (base.checked_add(len)? <= end).then_some(base)
        })?;
        self.carve(base, len);
        Some(VirtualAddress::new(base))
    }

    /// Take exactly `[va, va + size)` if all of it is free.
    pub fn alloc_at(&mut self, va: VirtualAddress, size: MapSize) -> bool {
        let Some(len) = size.page_size.bytes().checked_mul(size.page_count) else {
            return false;
        };
        if len == 0 || !va.is_aligned(size.page_size.bytes()) || !self.contains(va, len) {
            return false;
        }
        self.carve(va.as_u64(), len);
        true
    }

    /// Return `[va, va + size)` to the list.
    ///
    /// # Panics
    /// If any part of the range is already free.
    pub fn free(&mut self, va: VirtualAddress, size: MapSize) {
        self.insert(va.as_u64(), size.bytes());
    }

    /// Add a raw `[start, start + len)` extent, merging with neighbours.
    ///
    /// # Panics
    /// If the range overlaps a free extent.
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let Some(mut end) = start.checked_add(len) else {
            log::error!("free list: extent at {start:#x}+{len:#x} wraps");
            panic!("free list extent at {start:#x} wraps the address space");
        };
        let mut start = start;

        if self.overlaps(start, end) {
            log::error!("free list: {start:#x}..{end:#x} is already (partly) free");
            panic!("freeing {start:#x}..{end:#x} twice");
        }

        if let Some((&prev_start, &prev_end)) = self.extents.range(..start).next_back()
            && prev_end == start
        {
            self.extents.remove(&prev_start);
            start = prev_start;
        }
        if let Some(next_end) = self.extents.remove(&end) {
            end = next_end;
        }
        self.extents.insert(start, end);
    }

    /// Whether all of `[va, va + len)` is free.
    #[must_use]
    pub fn contains(&self, va: VirtualAddress, len: u64) -> bool {
        let start = va.as_u64();
        let Some(end) = start.checked_add(len) else {
            return false;
        };
        self.extents
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &e)| end <= e)
    }

    /// Whether any byte of `[va, va + len)` is free.
    #[must_use]
    pub fn intersects(&self, va: VirtualAddress, len: u64) -> bool {
        let start = va.as_u64();
        self.overlaps(start, start.saturating_add(len))
    }

    /// Free extents as `(start, end)` pairs in address order.
    pub fn extents(&self) -> impl Iterator<Item = (VirtualAddress, VirtualAddress)> + '_ {
        self.extents
            .iter()
            .map(|(&s, &e)| (VirtualAddress::new(s), VirtualAddress::new(e)))
    }

    /// Total free bytes.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.extents.iter().map(|(s, e)| e - s).sum()
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        let before = self
            .extents
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &e)| e > start);
        let inside = self.extents.range(start..end).next().is_some();
        before || inside
    }

    /// Remove `[base, base + len)`, which lies inside one extent.
    fn carve(&mut self, base: u64, len: u64) {
        let Some((&start, &end)) = self.extents.range(..=base).next_back() else {
            unreachable!("carving {base:#x} outside any extent");
        };
        debug_assert!(base + len <= end);
        self.extents.remove(&start);
        if start < base {
            self.extents.insert(start, base);
        }
        if base + len < end {
            self.extents.insert(base + len, end);
        }
    }
}
