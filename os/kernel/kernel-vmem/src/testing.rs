//! In-memory machine for unit tests.
//!
//! Table frames are real 4 KiB host allocations. The fractal windows are
//! emulated by walking the executing core's loaded root, so a window is only
//! reachable when the hardware would reach it too. Frame traffic, temporary
//! mappings and invalidations are recorded for inspection.

use crate::addresses::{Depth, PhysicalAddress, VirtualAddress};
use crate::entry::{ENTRIES_PER_TABLE, PageTableEntry, TABLE_SIZE};
use crate::platform::{Cpu, CpuId, CpuMask, FrameAlloc, PhysMapper};
use kernel_info::memory::{FRACTAL_PML4_INDEX, KERNEL_PML4_INDEX};
use kernel_sync::Critical;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// First simulated physical frame.
const RAM_BASE: u64 = 0x10_0000;

#[repr(C, align(4096))]
struct Frame([PageTableEntry; ENTRIES_PER_TABLE]);

/// One recorded invalidation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Invalidation {
    pub cpu: CpuId,
    pub start: VirtualAddress,
    pub len: u64,
    /// Delivered by another core.
    pub remote: bool,
}

#[derive(Default)]
struct Ram {
    frames: HashMap<u64, NonNull<Frame>>,
    live: HashSet<u64>,
    next: u64,
    allocations_left: Option<usize>,
    bad_frees: Vec<PhysicalAddress>,
}

pub struct SimMachine {
    ram: Mutex<Ram>,
    current: AtomicUsize,
    roots: Vec<AtomicU64>,
    critical: Vec<AtomicBool>,
    open_mappings: AtomicUsize,
    invalidations: Mutex<Vec<Invalidation>>,
    kernel_root: PhysicalAddress,
    kernel_pdpt: PhysicalAddress,
}

impl SimMachine {
    /// A machine with `cores` cores, all running on the kernel's own root.
    pub fn new(cores: usize) -> Self {
        let mut sim = Self {
            ram: Mutex::new(Ram {
                next: RAM_BASE,
                ..Ram::default()
            }),
            current: AtomicUsize::new(0),
            roots: (0..cores).map(|_| AtomicU64::new(0)).collect(),
            critical: (0..cores).map(|_| AtomicBool::new(false)).collect(),
            open_mappings: AtomicUsize::new(0),
            invalidations: Mutex::new(Vec::new()),
            kernel_root: PhysicalAddress::zero(),
            kernel_pdpt: PhysicalAddress::zero(),
        };
        sim.kernel_pdpt = sim.alloc_zeroed();
        sim.kernel_root = sim.new_root();
        for root in &sim.roots {
            root.store(sim.kernel_root.as_u64(), Ordering::Relaxed);
        }
        sim
    }

    fn alloc_zeroed(&self) -> PhysicalAddress {
        self.alloc(TABLE_SIZE, TABLE_SIZE)
            .expect("simulated RAM exhausted during setup")
    }

    /// A root seeded with the shared kernel entry and the self-reference.
    pub fn new_root(&self) -> PhysicalAddress {
        let root = self.alloc_zeroed();
        let rw = PageTableEntry::new().with_writable(true);
        self.write(root, KERNEL_PML4_INDEX, PageTableEntry::table_link(self.kernel_pdpt, rw));
        self.write(root, FRACTAL_PML4_INDEX, PageTableEntry::table_link(root, rw));
        root
    }

    pub const fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    pub const fn kernel_pdpt(&self) -> PhysicalAddress {
        self.kernel_pdpt
    }

    /// Run subsequent calls as core `cpu`.
    pub fn switch_to(&self, cpu: CpuId) {
        assert!(cpu < self.roots.len());
        self.current.store(cpu, Ordering::Relaxed);
    }

    /// Root loaded on `cpu`, regardless of the executing core.
    pub fn root_of(&self, cpu: CpuId) -> PhysicalAddress {
        PhysicalAddress::new(self.roots[cpu].load(Ordering::Relaxed))
    }

    fn frame_ptr(&self, pa: PhysicalAddress) -> NonNull<PageTableEntry> {
        let ram = self.ram.lock().expect("ram lock");
        let frame = ram
            .frames
            .get(&pa.align_down(TABLE_SIZE).as_u64())
            .unwrap_or_else(|| panic!("{pa:?} is not simulated RAM"));
        frame.cast()
    }

    pub fn read(&self, table: PhysicalAddress, index: usize) -> PageTableEntry {
        assert!(index < ENTRIES_PER_TABLE);
        unsafe { self.frame_ptr(table).add(index).read() }
    }

    pub fn write(&self, table: PhysicalAddress, index: usize, entry: PageTableEntry) {
        assert!(index < ENTRIES_PER_TABLE);
        unsafe { self.frame_ptr(table).add(index).write(entry) }
    }

    /// Frames currently allocated.
    pub fn live_frames(&self) -> usize {
        self.ram.lock().expect("ram lock").live.len()
    }

    pub fn is_live(&self, pa: PhysicalAddress) -> bool {
        self.ram.lock().expect("ram lock").live.contains(&pa.as_u64())
    }

    /// Frees of frames that were not allocated at the time.
    pub fn bad_frees(&self) -> Vec<PhysicalAddress> {
        self.ram.lock().expect("ram lock").bad_frees.clone()
    }

    /// Let only `n` more allocations succeed.
    pub fn limit_allocations(&self, n: usize) {
        self.ram.lock().expect("ram lock").allocations_left = Some(n);
    }

    pub fn open_mappings(&self) -> usize {
        self.open_mappings.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> Vec<Invalidation> {
        self.invalidations.lock().expect("log lock").clone()
    }

    pub fn clear_invalidations(&self) {
        self.invalidations.lock().expect("log lock").clear();
    }

    fn record(&self, inv: Invalidation) {
        self.invalidations.lock().expect("log lock").push(inv);
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        let ram = self.ram.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, frame) in ram.frames.drain() {
            drop(unsafe { Box::from_raw(frame.as_ptr()) });
        }
    }
}

impl FrameAlloc for SimMachine {
    fn alloc(&self, size: u64, align: u64) -> Option<PhysicalAddress> {
        assert!(size <= TABLE_SIZE && TABLE_SIZE % align == 0);
        let mut ram = self.ram.lock().expect("ram lock");
        if let Some(left) = ram.allocations_left.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }

        // Frames are never reused, which keeps double frees visible.
        let pa = ram.next;
        ram.next += TABLE_SIZE;
        let frame = Box::new(Frame([PageTableEntry::zero(); ENTRIES_PER_TABLE]));
        ram.frames.insert(pa, NonNull::from(Box::leak(frame)));
        ram.live.insert(pa);
        Some(PhysicalAddress::new(pa))
    }

    fn free(&self, pa: PhysicalAddress) {
        let mut ram = self.ram.lock().expect("ram lock");
        if !ram.live.remove(&pa.as_u64()) {
            ram.bad_frees.push(pa);
        }
    }
}

impl PhysMapper for SimMachine {
    unsafe fn map(&self, pa: PhysicalAddress, len: u64) -> VirtualAddress {
        assert!(len <= TABLE_SIZE);
        self.open_mappings.fetch_add(1, Ordering::Relaxed);
        VirtualAddress::from_ptr(self.frame_ptr(pa).as_ptr())
    }

    unsafe fn unmap(&self, _va: VirtualAddress, _len: u64) {
        self.open_mappings.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Critical for SimMachine {
    fn is_critical(&self) -> bool {
        self.critical[self.id()].load(Ordering::Relaxed)
    }

    fn enter_critical(&self) -> bool {
        self.critical[self.id()].swap(true, Ordering::Relaxed)
    }

    fn leave_critical(&self, nested: bool) {
        if !nested {
            self.critical[self.id()].store(false, Ordering::Relaxed);
        }
    }
}

impl Cpu for SimMachine {
    fn id(&self) -> CpuId {
        self.current.load(Ordering::Relaxed)
    }

    fn core_count(&self) -> usize {
        self.roots.len()
    }

    fn active_root(&self) -> PhysicalAddress {
        self.root_of(self.id())
    }

    unsafe fn load_root(&self, root: PhysicalAddress) {
        self.roots[self.id()].store(root.as_u64(), Ordering::Relaxed);
    }

    fn table_window(&self, va: VirtualAddress, depth: Depth) -> NonNull<PageTableEntry> {
        let mut table = self.active_root();
        for d in &Depth::ALL[..depth.as_usize()] {
            let entry = self.read(table, va.index(*d));
            assert!(
                entry.present() && !entry.large_page(),
                "fractal window for {va:?} at {depth:?} does not resolve (stopped at {d:?})"
            );
            table = entry.physical_address();
        }
        self.frame_ptr(table)
    }

    fn invalidate_local(&self, start: VirtualAddress, len: u64) {
        self.record(Invalidation {
            cpu: self.id(),
            start,
            len,
            remote: false,
        });
    }

    fn deliver_invalidation(&self, targets: CpuMask, start: VirtualAddress, len: u64) {
        assert!(!targets.contains(self.id()), "delivering to the initiator");
        for cpu in targets.iter() {
            self.record(Invalidation {
                cpu,
                start,
                len,
                remote: true,
            });
        }
    }
}
