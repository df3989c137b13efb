//! Shared fixtures: simulated physical RAM and a booted memory manager.

#![allow(dead_code)]

use kcore_kernel::config::MemoryConfig;
use kcore_kernel::memory::bootinfo::{MemoryMapEntry, MEMORY_TYPE_AVAILABLE, MEMORY_TYPE_RESERVED};
use kcore_kernel::memory::manager::BootInfo;
use kcore_kernel::memory::{MemoryManager, PhysAddr, PhysMapper, PAGE_SIZE};

pub const MIB: usize = 1024 * 1024;

/// Where the simulated kernel image ends.
pub const KERNEL_END: u32 = 0x0020_0000;

#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct Page([u8; PAGE_SIZE]);

/// Page-aligned simulated RAM; physical address `pa` lives at `base + pa`.
pub struct RamMapper {
    base: *mut u8,
    len: usize,
    _storage: Box<[Page]>,
}

impl RamMapper {
    pub fn new(bytes: usize) -> Self {
        let mut storage = vec![Page([0; PAGE_SIZE]); bytes / PAGE_SIZE].into_boxed_slice();
        let base = storage.as_mut_ptr().cast::<u8>();
        Self {
            base,
            len: bytes,
            _storage: storage,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn read_u32(&self, pa: PhysAddr) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.slice(pa, 4));
        u32::from_le_bytes(raw)
    }

    pub fn slice(&self, pa: PhysAddr, len: usize) -> &[u8] {
        assert!(pa.as_usize() + len <= self.len, "{:?}+{} outside simulated RAM", pa, len);
        // SAFETY: bounds checked against the owned storage.
        unsafe { std::slice::from_raw_parts(self.base.add(pa.as_usize()), len) }
    }
}

impl PhysMapper for RamMapper {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        assert!(pa.as_usize() < self.len, "{:?} outside simulated RAM", pa);
        // SAFETY: in bounds of the owned storage.
        unsafe { self.base.add(pa.as_usize()) }
    }
}

/// PC-style map: conventional memory, the BIOS hole, then RAM up to `total`.
pub fn pc_memory_map(total: usize) -> Vec<MemoryMapEntry> {
    vec![
        MemoryMapEntry::new(0, 0x9_FC00, MEMORY_TYPE_AVAILABLE),
        MemoryMapEntry::new(0x9_FC00, 0x10_0000 - 0x9_FC00, MEMORY_TYPE_RESERVED),
        MemoryMapEntry::new(0x10_0000, (total - MIB) as u64, MEMORY_TYPE_AVAILABLE),
    ]
}

pub fn boot_with(total: usize, config: &MemoryConfig) -> MemoryManager<RamMapper> {
    let map = pc_memory_map(total);
    let info = BootInfo {
        memory_map: &map,
        kernel_end: PhysAddr::new(KERNEL_END),
        command_line: "",
    };
    match MemoryManager::bootstrap(RamMapper::new(total), &info, config, |_| {}) {
        Ok(mm) => mm,
        Err(err) => panic!("bootstrap of {} bytes failed: {}", total, err),
    }
}

/// Memory manager over 16 MiB of simulated RAM.
pub fn boot_16mb() -> MemoryManager<RamMapper> {
    boot_with(16 * MIB, &MemoryConfig::default())
}
