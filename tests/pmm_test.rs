//! Frame stack behaviour against booted and hand-built memory maps.

mod common;

use std::collections::HashSet;
use std::ptr::NonNull;

use common::{boot_16mb, pc_memory_map, RamMapper, KERNEL_END, MIB};
use kcore_kernel::config::MemoryConfig;
use kcore_kernel::memory::bootinfo::{
    BootMemoryMap, MemoryMapEntry, LOW_MEMORY_END, MEMORY_TYPE_AVAILABLE, MEMORY_TYPE_RESERVED,
};
use kcore_kernel::memory::manager::BootInfo;
use kcore_kernel::memory::MemoryManager;
use kcore_kernel::memory::pmm::{FrameAllocator, Zone};
use kcore_kernel::memory::{PhysAddr, PAGE_SIZE};

fn allocator_over(storage: &mut Vec<u32>) -> FrameAllocator {
    let ptr = NonNull::new(storage.as_mut_ptr()).expect("vec storage is never null");
    // SAFETY: the vector outlives the allocator in every test and is not
    // touched while the allocator is alive.
    unsafe { FrameAllocator::from_raw_parts(ptr, storage.len()) }
}

#[test]
fn test_every_frame_is_handed_out_once() {
    let mut mm = boot_16mb();
    let free = mm.free_frames();
    let footprint = mm.footprint_end();

    let mut seen = HashSet::new();
    while let Some(frame) = mm.alloc_page(Zone::Normal) {
        assert!(frame.is_page_aligned());
        assert!(frame >= footprint, "{:?} inside the boot footprint", frame);
        assert!(frame.as_usize() < 16 * MIB);
        assert!(seen.insert(frame), "{:?} handed out twice", frame);
    }
    assert_eq!(seen.len(), free);
    assert_eq!(mm.free_frames(), 0);

    for frame in seen {
        mm.free_page(frame);
    }
    assert_eq!(mm.free_frames(), free);
}

#[test]
fn test_overlapping_map_entries_yield_each_frame_once() {
    let mut map = pc_memory_map(16 * MIB);
    // Firmware repeating the top of RAM and the whole RAM entry.
    map.push(MemoryMapEntry::new(12 * MIB as u64, 4 * MIB as u64, MEMORY_TYPE_AVAILABLE));
    map.push(MemoryMapEntry::new(MIB as u64, 15 * MIB as u64, MEMORY_TYPE_AVAILABLE));
    // A reserved hole overlapping available RAM stays out of the stack.
    map.push(MemoryMapEntry::new(14 * MIB as u64, MIB as u64, MEMORY_TYPE_RESERVED));
    let info = BootInfo {
        memory_map: &map,
        kernel_end: PhysAddr::new(KERNEL_END),
        command_line: "",
    };
    let mut mm =
        MemoryManager::bootstrap(RamMapper::new(16 * MIB), &info, &MemoryConfig::default(), |_| {})
            .unwrap();

    let footprint = mm.footprint_end().as_usize();
    let hole = 14 * MIB..15 * MIB;
    let expected = (16 * MIB - footprint - MIB) / PAGE_SIZE;
    assert_eq!(mm.free_frames(), expected);

    let mut seen = HashSet::new();
    while let Some(frame) = mm.alloc_page(Zone::Normal) {
        assert!(!hole.contains(&frame.as_usize()), "{:?} lies in the reserved hole", frame);
        assert!(seen.insert(frame), "{:?} handed out twice", frame);
    }
    assert_eq!(seen.len(), expected);
}

#[test]
fn test_footprint_frames_are_never_free() {
    let mm = boot_16mb();
    let kernel = PhysAddr::new(0x10_0000);
    assert!(!mm.is_frame_free(kernel));
    assert!(!mm.is_frame_free(mm.kernel_directory()));
    let last_boot_page = PhysAddr::new(mm.footprint_end().as_u32() - PAGE_SIZE as u32);
    assert!(!mm.is_frame_free(last_boot_page));
    assert!(mm.is_frame_free(mm.footprint_end()));
}

#[test]
fn test_freed_frame_comes_back_first() {
    let mut mm = boot_16mb();
    let a = mm.alloc_page(Zone::Normal).unwrap();
    let b = mm.alloc_page(Zone::Dma).unwrap();
    assert_ne!(a, b);

    mm.free_page(a);
    assert_eq!(mm.alloc_page(Zone::Dma), Some(a));
}

#[test]
fn test_populate_skips_low_memory_and_reservations() {
    let mut map = BootMemoryMap::from_entries(&pc_memory_map(4 * MIB));
    map.insert_reserved(0x10_0000, 0x18_0000).unwrap();

    let expected = map.available_frames(LOW_MEMORY_END, 4 * MIB as u64);
    let mut storage = vec![0u32; expected];
    let mut frames = allocator_over(&mut storage);
    assert_eq!(frames.populate(&map, LOW_MEMORY_END, 4 * MIB as u64), expected);
    assert_eq!(expected, (4 * MIB - 0x18_0000) / PAGE_SIZE);

    let mut lowest = None;
    while let Some(frame) = frames.alloc_page(Zone::Normal) {
        assert!(frame.as_u32() >= 0x18_0000, "{:?} below the reservation", frame);
        lowest.get_or_insert(frame);
    }
    assert_eq!(lowest, Some(PhysAddr::new(0x18_0000)));
}

#[test]
fn test_small_stack_ignores_extra_memory() {
    let map = BootMemoryMap::from_entries(&pc_memory_map(4 * MIB));
    let mut storage = vec![0u32; 16];
    let mut frames = allocator_over(&mut storage);

    assert_eq!(frames.populate(&map, LOW_MEMORY_END, 4 * MIB as u64), 16);
    assert_eq!(frames.free_frames(), frames.capacity());
}
