//! # x86-64 MMU adapters
//!
//! The pieces of a production [`Cpu`](crate::Cpu) that only depend on the
//! memory-management unit: the `CR3` root register, `invlpg`, and pointers
//! into the fractal windows. A platform combines [`Mmu`] with its own core
//! numbering and interrupt delivery to implement the full trait.
//!
//! [`HhdmMapper`] is the [`PhysMapper`] for kernels that map physical
//! memory at [`HHDM_BASE`] inside the shared kernel region.
//!
//! The instructions themselves are behind the `asm` feature; without it
//! only the pure parts are built.

use crate::addresses::{Depth, PhysicalAddress, VirtualAddress};
use crate::entry::PageTableEntry;
use crate::fractal;
use crate::platform::PhysMapper;
use bitfield_struct::bitfield;
use core::ptr::NonNull;
use kernel_info::memory::{HHDM_BASE, HHDM_SIZE};

/// Ranges longer than this many pages are dropped with a full flush.
pub const FLUSH_ALL_THRESHOLD: u64 = 64;

/// CR3, the root register (PCID disabled).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    #[bits(3)]
    pub reserved0: u8,
    /// PWT for accesses to the PML4.
    pub pwt: bool,
    /// PCD for accesses to the PML4.
    pub pcd: bool,
    #[bits(7)]
    pub reserved1: u8,
    /// PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` with write-back caching.
    #[must_use]
    pub const fn from_root(root: PhysicalAddress) -> Self {
        debug_assert!(root.is_aligned(0x1000), "PML4 base must be 4K-aligned");
        Self::new().with_pml4_base_4k(root.as_u64() >> 12)
    }

    #[must_use]
    pub const fn root(self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }
}

/// MMU of the executing core.
#[derive(Debug, Default, Copy, Clone)]
pub struct Mmu;

impl Mmu {
    /// Pointer to the loaded table at `depth` covering `va`.
    #[must_use]
    pub fn table_window(self, va: VirtualAddress, depth: Depth) -> NonNull<PageTableEntry> {
        let table = fractal::table_address(va, depth);
        NonNull::new(table.as_mut_ptr()).unwrap_or(NonNull::dangling())
    }

    /// Number of `invlpg`s needed for `len` bytes, or `None` if a full
    /// flush is cheaper.
    #[must_use]
    pub const fn invlpg_count(len: u64) -> Option<u64> {
        let pages = len.div_ceil(0x1000);
        if pages > FLUSH_ALL_THRESHOLD {
            None
        } else {
            Some(pages)
        }
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl Mmu {
    #[must_use]
    pub fn read_cr3(self) -> Cr3 {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Cr3::from_bits(cr3)
    }

    /// # Safety
    /// `cr3` must select a complete table that maps the running code.
    pub unsafe fn write_cr3(self, cr3: Cr3) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3.into_bits(), options(nostack, preserves_flags));
        }
    }

    #[must_use]
    pub fn active_root(self) -> PhysicalAddress {
        self.read_cr3().root()
    }

    /// # Safety
    /// See [`write_cr3`](Self::write_cr3).
    pub unsafe fn load_root(self, root: PhysicalAddress) {
        unsafe { self.write_cr3(Cr3::from_root(root)) }
    }

    /// Drop the translation of the page containing `va`.
    #[inline]
    pub fn invlpg(self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    /// Drop the translations of `[start, start + len)`.
    ///
    /// Long ranges outside the global kernel mappings reload CR3 instead.
    pub fn invalidate_range(self, start: VirtualAddress, len: u64) {
        let global = start.as_u64() < kernel_info::memory::KERNEL_END;
        match Self::invlpg_count(len) {
            None if !global => unsafe { self.write_cr3(self.read_cr3()) },
            count => {
                let pages = count.unwrap_or_else(|| len.div_ceil(0x1000));
                for page in 0..pages {
                    self.invlpg(start + page * 0x1000);
                }
            }
        }
    }
}

/// [`PhysMapper`] over the direct map in the shared kernel region.
///
/// Mapping is address arithmetic; unmapping does nothing. The window is
/// valid whichever address space is loaded.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmMapper;

impl PhysMapper for HhdmMapper {
    unsafe fn map(&self, pa: PhysicalAddress, len: u64) -> VirtualAddress {
        debug_assert!(
            pa.as_u64().saturating_add(len) <= HHDM_SIZE,
            "{pa}+{len:#x} is outside the direct map"
        );
        VirtualAddress::new(HHDM_BASE + pa.as_u64())
    }

    unsafe fn unmap(&self, _va: VirtualAddress, _len: u64) {}
}
