//! # Fractal (self-referential) windows
//!
//! PML4 slot 511 of every address space points back at the PML4 itself. A
//! walk that goes through that slot once stops one level early, so the CPU
//! hands out the page tables of the *loaded* space as ordinary memory:
//!
//! | Depth | Tables visible at | Window size |
//! |:------|:------------------|:------------|
//! | 3 (PT)   | `0xFFFF_FF80_0000_0000` | 512 GiB |
//! | 2 (PD)   | `0xFFFF_FFFF_C000_0000` | 1 GiB |
//! | 1 (PDPT) | `0xFFFF_FFFF_FFE0_0000` | 2 MiB |
//! | 0 (PML4) | `0xFFFF_FFFF_FFFF_F000` | 4 KiB |
//!
//! Within a window the tables are laid out in address order, so the entry
//! covering `va` at `depth` is found by shifting the 48-bit address right by
//! `9 * (4 - depth)` and clearing the low three bits.
//!
//! A window only resolves when every ancestor entry on the way is present and
//! not a large page.

use crate::addresses::{Depth, VirtualAddress};
use crate::entry::TABLE_SIZE;
use kernel_info::memory::FRACTAL_WINDOWS;

/// Address of the entry covering `va` at `depth` in the loaded space.
#[inline]
#[must_use]
pub const fn entry_address(va: VirtualAddress, depth: Depth) -> VirtualAddress {
    let shift = 9 * (4 - depth as u32);
    let offset = (va.without_sign_extension() >> shift) & !7;
    VirtualAddress::new(FRACTAL_WINDOWS[depth as usize] + offset)
}

/// Address of the table holding the entry covering `va` at `depth`.
#[inline]
#[must_use]
pub const fn table_address(va: VirtualAddress, depth: Depth) -> VirtualAddress {
    entry_address(va, depth).align_down(TABLE_SIZE)
}
