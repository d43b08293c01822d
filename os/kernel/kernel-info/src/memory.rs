//! # Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐  PML4[0]
//!                       │  Kernel region (shared PDPT)    │
//! HHDM_BASE             │  ├ direct map of physical memory│
//! KERNEL_END            ├─────────────────────────────────┤  PML4[1]
//!                       │  Lower user region              │
//! LOWER_USER_END        ├─────────────────────────────────┤  PML4[256]
//!                       │  (non-canonical hole)           │
//! UPPER_USER_START      ├─────────────────────────────────┤  PML4[256]
//!                       │  Upper user region              │
//! FRACTAL_BASE          ├─────────────────────────────────┤  PML4[511]
//!                       │  Self-referential table windows │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

/// Size of the region covered by a single top-level (PML4) entry: 512 GiB.
pub const PML4_ENTRY_SPAN: u64 = 0x80_0000_0000;

/// End of the always-mapped kernel region.
///
/// Everything below this address is reached through top-level entry 0, which
/// every address space shares with the kernel's global map.
pub const KERNEL_END: u64 = PML4_ENTRY_SPAN;

/// Top-level index of the shared kernel entry.
pub const KERNEL_PML4_INDEX: usize = 0;

/// Top-level index whose entry points back at the table's own root.
pub const FRACTAL_PML4_INDEX: usize = 511;

/// Number of top-level entries in each user region.
pub const USER_REGION_ENTRIES: u64 = 0xff;

/// Start of the user region in the lower canonical half.
pub const LOWER_USER_START: u64 = KERNEL_END;

/// End (exclusive) of the lower user region.
pub const LOWER_USER_END: u64 = LOWER_USER_START + USER_REGION_ENTRIES * PML4_ENTRY_SPAN;

/// Start of the user region in the upper canonical half.
pub const UPPER_USER_START: u64 = 0xffff_8000_0000_0000;

/// End (exclusive) of the upper user region; the fractal slot follows it.
pub const UPPER_USER_END: u64 = UPPER_USER_START + USER_REGION_ENTRIES * PML4_ENTRY_SPAN;

/// Base of the virtual range claimed by the self-referential entry.
pub const FRACTAL_BASE: u64 = 0xffff_ff80_0000_0000;

/// Fixed virtual windows through which the **active** table's levels are
/// addressable, indexed by depth (0 = PML4 … 3 = PT).
///
/// With `PML4[511]` pointing at the root, the hardware walk for an address in
/// one of these windows stops one level early per repeated 511 index, so the
/// bytes found there are page-table entries instead of data.
pub const FRACTAL_WINDOWS: [u64; 4] = [
    0xffff_ffff_ffff_f000,
    0xffff_ffff_ffe0_0000,
    0xffff_ffff_c000_0000,
    0xffff_ff80_0000_0000,
];

/// Base of the direct map of physical memory.
///
/// Physical address `pa` is visible at [`HHDM_BASE`] + `pa` in every address
/// space, because the map lives in the shared kernel region. Used for
/// temporary table access while building and tearing down spaces that are
/// not loaded.
pub const HHDM_BASE: u64 = 0x40_0000_0000;

/// Bytes of physical memory the direct map covers: 256 GiB.
pub const HHDM_SIZE: u64 = KERNEL_END - HHDM_BASE;

/// Upper bound on the number of cores the translation-cache bookkeeping
/// tracks; core sets are carried in a single `u64` mask.
pub const MAX_CORES: usize = 64;

const _: () = {
    assert!(KERNEL_END.is_multiple_of(PML4_ENTRY_SPAN));
    assert!(LOWER_USER_END <= 0x0000_8000_0000_0000);
    assert!(UPPER_USER_END == FRACTAL_BASE);
    assert!(FRACTAL_BASE == 0xffff_0000_0000_0000 | ((FRACTAL_PML4_INDEX as u64) << 39));
    assert!(MAX_CORES <= 64);
    // The direct map must be reachable from every root.
    assert!(HHDM_BASE + HHDM_SIZE <= KERNEL_END);
    assert!(HHDM_BASE + HHDM_SIZE <= LOWER_USER_START || HHDM_BASE >= LOWER_USER_END);
    assert!(HHDM_BASE + HHDM_SIZE <= UPPER_USER_START || HHDM_BASE >= UPPER_USER_END);
};
