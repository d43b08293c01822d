//! # Virtual Memory Support
//!
//! The virtual-memory core of the kernel's x86-64 layer.
//!
//! ## What you get
//! - [`PageTable`]: one four-level tree, edited through the fractal windows
//!   of the loaded table, torn down through temporary mappings.
//! - [`AddressSpace`]: a page table plus a [`FreeList`] of unused virtual
//!   ranges, guarded by one lock.
//! - [`TlbCoordinator`]: which space each core runs, and who has to drop a
//!   translation when a mapping changes. [`ShootdownMailbox`] is the
//!   interrupt handshake behind remote invalidation.
//! - [`VmContext`]: the kernel-lifetime state all of the above borrow.
//! - The platform seams ([`FrameAlloc`], [`PhysMapper`], [`Cpu`]) and their
//!   x86-64 [`mmu`] adapters.
//!
//! ## Address decomposition
//!
//! ```text
//! | 47..39 | 38..30 | 29..21 | 20..12 | 11..0  |
//! |  PML4  |  PDPT  |   PD   |   PT   | offset |
//! ```
//!
//! Each 9-bit field indexes one 512-entry table. A walk ends early at a PDPT
//! entry with `PS=1` (1 GiB page) or a PD entry with `PS=1` (2 MiB page);
//! otherwise the PT entry maps a 4 KiB page. The PML4 is found through `CR3`.
//!
//! ## The fractal slot
//!
//! Top-level entry 511 of every table points at the table's own root. While a
//! table is loaded, its levels appear as ordinary memory in the top 512 GiB;
//! see [`fractal`].

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod address_space;
mod addresses;
pub mod context;
mod entry;
mod error;
pub mod fractal;
pub mod free_list;
pub mod mmu;
pub mod page_table;
pub mod platform;
#[cfg(test)]
mod testing;
pub mod tlb;

pub use crate::address_space::{AddressSpace, Capabilities, PAGE_SIZES, USER_PARENT_FLAGS};
pub use crate::addresses::{Depth, MapSize, PageSize, PhysicalAddress, VirtualAddress};
pub use crate::context::{PageDelegate, VmContext};
pub use crate::entry::{Attributes, ENTRIES_PER_TABLE, PageTableEntry, TABLE_SIZE};
pub use crate::error::{SetError, VmError};
pub use crate::free_list::FreeList;
pub use crate::page_table::{PageTable, SetOutcome, Translation, Walk};
pub use crate::platform::{
    Cpu, CpuId, CpuMask, FrameAlloc, PhysMapper, Platform, ScopedMapping,
};
pub use crate::tlb::{AddressSpaceId, ShootdownMailbox, ShootdownTicket, TlbCoordinator};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Round `x` down to a multiple of the power of two `a`.
///
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0x20_1fff, 0x1000), 0x20_1000);
/// assert_eq!(align_down(0x20_0000, 0x20_0000), 0x20_0000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Round `x` up to a multiple of the power of two `a`.
///
/// `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0x80_0000_1000, 0x20_0000), 0x80_0020_0000);
/// assert_eq!(align_up(0x4000, 0x1000), 0x4000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers_agree() {
        for x in [0, 1, 0xfff, 0x1000, 0x1001, 0x20_0000] {
            let down = align_down(x, 0x1000);
            let up = align_up(x, 0x1000);
            assert!(down <= x && x <= up);
            assert_eq!(down % 0x1000, 0);
            assert_eq!(up % 0x1000, 0);
            assert!(up - down <= 0x1000);
        }
    }
}
