//! # Page Table Entries
//!
//! One 64-bit format for every level (PML4E, PDPTE, PDE, PTE), modeled with
//! [`bitfield_struct`]. Which bits matter depends on the depth the entry sits
//! at; see [`PageTableEntry`].

use crate::addresses::{PageSize, PhysicalAddress};
use bitfield_struct::bitfield;
use core::ops::BitOr;

/// Entries per table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Size (and alignment) of one table frame.
pub const TABLE_SIZE: u64 = 0x1000;

/// A single x86-64 page-table entry.
///
/// | Bits  | Field | Meaning |
/// |-------|-------|---------|
/// | 0     | `P`   | present |
/// | 1     | `RW`  | writable |
/// | 2     | `US`  | user accessible |
/// | 3     | `PWT` | write-through |
/// | 4     | `PCD` | cache disable |
/// | 5     | `A`   | accessed |
/// | 6     | `D`   | dirty (leaf only) |
/// | 7     | `PS`  | large page at depths 1 and 2; `PAT` in a 4 KiB PTE |
/// | 8     | `G`   | global (leaf only) |
/// | 12–51 | frame | physical frame number |
/// | 63    | `NX`  | execute disable |
///
/// A zero entry is absent. Permissions are the intersection over the walk, so
/// intermediate entries carry the permissive `parent flags` and leaves carry
/// the real ones.
///
/// ```rust
/// # use kernel_vmem::{PageTableEntry, PhysicalAddress};
/// let e = PageTableEntry::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_physical_address(PhysicalAddress::new(0x5000));
/// assert_eq!(e.into_bits(), 0x5003);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    /// `PCD`; set for mappings that are not cachable.
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// `PS`. A leaf at depth 1 (1 GiB) or depth 2 (2 MiB).
    pub large_page: bool,
    /// Survives CR3 reloads; used for kernel leaves.
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    #[bits(40)]
    frame: u64,
    #[bits(7)]
    pub os_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    /// `NX`; set for mappings that are not executable.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// The absent entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.into_bits() == 0
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.as_u64() >> 12)
    }

    /// Base of the page a leaf of `size` maps.
    ///
    /// For large pages the frame field's low bits hold `PAT` and must be
    /// masked off.
    #[inline]
    #[must_use]
    pub const fn leaf_address(self, size: PageSize) -> PhysicalAddress {
        self.physical_address().align_down(size.bytes())
    }

    /// Flags of a leaf mapping `size` with the given privilege and attributes.
    ///
    /// Kernel leaves are global and supervisor-only; user leaves carry `US`.
    #[must_use]
    pub const fn leaf_flags(size: PageSize, kernel: bool, attributes: Attributes) -> Self {
        Self::new()
            .with_present(true)
            .with_large_page(!matches!(size, PageSize::Size4K))
            .with_global(kernel)
            .with_user(!kernel)
            .with_no_execute(!attributes.executable)
            .with_writable(attributes.writable)
            .with_cache_disable(!attributes.cachable)
    }

    /// Link to a child table at `table` carrying `flags`.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalAddress, flags: Self) -> Self {
        flags.with_present(true).with_physical_address(table)
    }

    /// Attributes a leaf grants.
    #[inline]
    #[must_use]
    pub const fn attributes(self) -> Attributes {
        Attributes {
            executable: !self.no_execute(),
            writable: self.writable(),
            cachable: !self.cache_disable(),
        }
    }
}

impl BitOr for PageTableEntry {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self.into_bits() | rhs.into_bits())
    }
}

/// Permissions and caching of a mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Attributes {
    pub executable: bool,
    pub writable: bool,
    pub cachable: bool,
}

impl Attributes {
    #[must_use]
    pub const fn new(executable: bool, writable: bool, cachable: bool) -> Self {
        Self {
            executable,
            writable,
            cachable,
        }
    }
}

impl Default for Attributes {
    /// Executable, writable and cachable.
    fn default() -> Self {
        Self::new(true, true, true)
    }
}
