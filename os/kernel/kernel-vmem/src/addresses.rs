//! # Virtual and Physical Memory Addresses
//!
//! Thin `u64` newtypes that keep physical and virtual addresses apart, the
//! runtime page-size classes, and the page-table [`Depth`] an address is
//! decomposed against.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Mask selecting the 48 translated bits of a virtual address.
const VA_BITS_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// A **physical** memory address (machine bus address).
///
/// Never dereferenced directly; physical memory is only touched through a
/// [`ScopedMapping`](crate::platform::ScopedMapping).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// A **virtual** memory address in the space loaded on the executing core.
///
/// Canonicality is not validated; only the kind of address is carried.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(crate::align_down(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// The address with the sign-extension bits 48..63 cleared.
    #[inline]
    #[must_use]
    pub const fn without_sign_extension(self) -> u64 {
        self.0 & VA_BITS_MASK
    }

    /// Table index (0..512) this address selects at `depth`.
    #[inline]
    #[must_use]
    pub const fn index(self, depth: Depth) -> usize {
        ((self.0 >> depth.index_shift()) & 0x1ff) as usize
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(crate::align_down(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

/// Supported x86-64 page sizes.
///
/// 4 KiB pages are mapped through the PT level; 2 MiB and 1 GiB are large
/// pages that terminate the walk early at the PD or PDPT.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageSize {
    /// 4 KiB page mapped by a PTE (PT leaf).
    Size4K,
    /// 2 MiB page mapped by a PDE with `PS=1` (PD leaf).
    Size2M,
    /// 1 GiB page mapped by a PDPTE with `PS=1` (PDPT leaf).
    Size1G,
}

impl PageSize {
    /// Page size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }

    /// log2 of [`bytes`](Self::bytes).
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size2M => 21,
            Self::Size1G => 30,
        }
    }

    /// Depth at which a leaf of this size lives.
    #[inline]
    #[must_use]
    pub const fn depth(self) -> Depth {
        match self {
            Self::Size4K => Depth::Pt,
            Self::Size2M => Depth::Pd,
            Self::Size1G => Depth::Pdpt,
        }
    }

    /// Page size for a byte count, if it is one of the supported sizes.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            0x1000 => Some(Self::Size4K),
            0x20_0000 => Some(Self::Size2M),
            0x4000_0000 => Some(Self::Size1G),
            _ => None,
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size1G => "1G",
        })
    }
}

/// Shape of a mapping or reservation: `page_count` pages of `page_size`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MapSize {
    pub page_size: PageSize,
    pub page_count: u64,
}

impl MapSize {
    #[inline]
    #[must_use]
    pub const fn new(page_size: PageSize, page_count: u64) -> Self {
        Self {
            page_size,
            page_count,
        }
    }

    /// Total length in bytes.
    ///
    /// # Panics
    /// If the length does not fit in a `u64`.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self.page_size.bytes().checked_mul(self.page_count) {
            Some(b) => b,
            None => panic!("MapSize overflows the address space"),
        }
    }
}

impl fmt::Display for MapSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}", self.page_count, self.page_size)
    }
}

/// Level of the four-level tree, counted from the root.
///
/// | Depth | Table | Leaf at this depth |
/// |:------|:------|:-------------------|
/// | 0 | PML4 | none |
/// | 1 | PDPT | 1 GiB (`PS=1`) |
/// | 2 | PD   | 2 MiB (`PS=1`) |
/// | 3 | PT   | 4 KiB |
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Depth {
    Pml4 = 0,
    Pdpt = 1,
    Pd = 2,
    Pt = 3,
}

impl Depth {
    /// Root to leaf.
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    /// Shift that brings this depth's index bits down to bit 0.
    #[inline]
    #[must_use]
    pub const fn index_shift(self) -> u32 {
        39 - 9 * self as u32
    }

    /// Bytes of address space covered by one entry at this depth.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.index_shift()
    }

    #[inline]
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Pml4 => None,
            Self::Pdpt => Some(Self::Pml4),
            Self::Pd => Some(Self::Pdpt),
            Self::Pt => Some(Self::Pd),
        }
    }

    /// Page size of a leaf at this depth; the PML4 cannot hold leaves.
    #[inline]
    #[must_use]
    pub const fn leaf_size(self) -> Option<PageSize> {
        match self {
            Self::Pml4 => None,
            Self::Pdpt => Some(PageSize::Size1G),
            Self::Pd => Some(PageSize::Size2M),
            Self::Pt => Some(PageSize::Size4K),
        }
    }
}
