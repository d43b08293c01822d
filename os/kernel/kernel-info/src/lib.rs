//! # Kernel Configuration
//!
//! Compile-time layout constants shared by the virtual-memory core and the
//! code that boots it.
//!
//! ## Overview
//!
//! The x86-64 address space is split along top-level (PML4) entries:
//!
//! * **Entry 0** holds the kernel's global PDPT and is shared by every address
//!   space, so the kernel region below [`memory::KERNEL_END`] is always mapped.
//! * **Entries 1‒255 and 256‒510** are handed to user address spaces.
//! * **Entry 511** points back at the root of whichever table it lives in,
//!   which makes the active table's own entries addressable at the fixed
//!   [`memory::FRACTAL_WINDOWS`].
//!
//! All constants are `const` and checked with compile-time assertions; no
//! layout is computed at runtime.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
