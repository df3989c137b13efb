//! Memory bootstrap: footprint layout, failure modes, configuration and logs.

mod common;

use common::{boot_16mb, boot_with, pc_memory_map, RamMapper, KERNEL_END, MIB};
use kcore_kernel::config::{KernelConfig, LogConfig, MemoryConfig};
use kcore_kernel::logging;
use kcore_kernel::memory::bitmap::{HeapWindow, BITMAP_BYTES};
use kcore_kernel::memory::bootinfo::{MemoryMapEntry, MEMORY_TYPE_AVAILABLE};
use kcore_kernel::memory::early::EarlyAllocError;
use kcore_kernel::memory::heap::{AllocFlags, HEADER_SIZE};
use kcore_kernel::memory::manager::{BootError, BootInfo};
use kcore_kernel::memory::paging::PagingError;
use kcore_kernel::memory::pmm::Zone;
use kcore_kernel::memory::{
    pages_for, AddressSpaceId, MemoryManager, PhysAddr, VirtAddr, DIRECTORY_ENTRIES, PAGE_SIZE,
    TABLE_SPAN,
};
use log::LevelFilter;

fn try_boot(ram: usize, map: &[MemoryMapEntry]) -> Result<MemoryManager<RamMapper>, BootError> {
    let info = BootInfo {
        memory_map: map,
        kernel_end: PhysAddr::new(KERNEL_END),
        command_line: "",
    };
    MemoryManager::bootstrap(RamMapper::new(ram), &info, &MemoryConfig::default(), |_| {})
}

#[test]
fn test_footprint_follows_the_kernel_image() {
    let mm = boot_16mb();
    let stack_pages = pages_for((16 * MIB - MIB) / PAGE_SIZE * 4);
    let boot_pages = stack_pages + 1 + DIRECTORY_ENTRIES + BITMAP_BYTES / PAGE_SIZE;

    assert_eq!(
        mm.footprint_end().as_usize(),
        KERNEL_END as usize + boot_pages * PAGE_SIZE
    );
    assert_eq!(mm.identity_end().as_usize(), 16 * MIB);
    assert_eq!(
        mm.free_frames(),
        (16 * MIB - mm.footprint_end().as_usize()) / PAGE_SIZE
    );
    // Directory first, right after the frame-stack storage.
    assert_eq!(
        mm.kernel_directory().as_usize(),
        KERNEL_END as usize + stack_pages * PAGE_SIZE
    );
}

#[test]
fn test_paging_is_enabled_with_the_finished_directory() {
    let map = pc_memory_map(16 * MIB);
    let info = BootInfo {
        memory_map: &map,
        kernel_end: PhysAddr::new(KERNEL_END),
        command_line: "",
    };
    let mut loaded = Vec::new();
    let mm = MemoryManager::bootstrap(RamMapper::new(16 * MIB), &info, &MemoryConfig::default(), |dir| {
        loaded.push(dir)
    })
    .unwrap();

    assert_eq!(loaded, [mm.kernel_directory()]);
    let image = VirtAddr::new(0xC010_0000);
    assert_eq!(
        mm.translate(AddressSpaceId::KERNEL, image),
        Some(PhysAddr::new(0x10_0000))
    );
}

#[test]
fn test_memory_below_the_image_only_is_unusable() {
    let map = [MemoryMapEntry::new(0, 0x9_FC00, MEMORY_TYPE_AVAILABLE)];
    assert_eq!(
        try_boot(MIB, &map).err(),
        Some(BootError::NoUsableMemory)
    );
}

#[test]
fn test_too_little_memory_for_the_kernel_directory() {
    let map = pc_memory_map(3 * MIB);
    assert_eq!(
        try_boot(3 * MIB, &map).err(),
        Some(BootError::Paging(PagingError::OutOfMemory))
    );
}

#[test]
fn test_too_little_memory_for_the_heap_bitmap() {
    let ram = KERNEL_END as usize + 1040 * PAGE_SIZE;
    let map = pc_memory_map(ram);
    match try_boot(ram, &map) {
        Err(BootError::Early(EarlyAllocError::Exhausted { requested, .. })) => {
            assert_eq!(requested, BITMAP_BYTES)
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("bootstrap succeeded without room for the bitmap"),
    }
}

#[test]
fn test_heap_window_from_the_command_line() {
    let (config, rejected) = KernelConfig::parse("heap=300-400 debug=heap");
    assert!(rejected.is_empty());
    let mut mm = boot_with(16 * MIB, &config.memory);

    let ptr = mm.kmalloc(10, AllocFlags::ZEROED).unwrap();
    assert_eq!(ptr.as_usize(), 300 * TABLE_SPAN + HEADER_SIZE);
    assert!(mm.table_present(AddressSpaceId::KERNEL, 300));
}

#[test]
fn test_heap_window_outside_the_kernel_range_falls_back() {
    let config = MemoryConfig {
        heap_window: HeapWindow::new(0, 16),
        ..MemoryConfig::default()
    };
    let mut mm = boot_with(16 * MIB, &config);
    let ptr = mm.kmalloc(10, AllocFlags::ZEROED).unwrap();
    assert_eq!(ptr.as_usize(), 256 * TABLE_SPAN + HEADER_SIZE);
}

// The only test in this binary that touches the global logger.
#[test]
fn test_debug_toggles_show_up_in_captured_log() {
    logging::init(&LogConfig {
        level: LevelFilter::Trace,
        capture: true,
    });

    let (config, _) = KernelConfig::parse("debug=pmm,paging,heap");
    let mut mm = boot_with(16 * MIB, &config.memory);
    let frame = mm.alloc_page(Zone::Normal).unwrap();
    mm.free_page(frame);
    let ptr = mm.kmalloc(10, AllocFlags::ZEROED).unwrap();
    mm.kfree(ptr);

    assert!(logging::captured_count("boot") >= 1);
    assert!(logging::captured_count("pmm") >= 3);
    logging::with_captured(|text, overflow| {
        assert!(!overflow);
        assert!(text.contains("boot|INFO|memory up"), "{}", text);
        assert!(text.contains("pmm|INFO|frame stack populated"), "{}", text);
        assert!(text.contains("pmm|TRACE|alloc"), "{}", text);
        assert!(text.contains("paging|TRACE|kernel directory"), "{}", text);
        assert!(text.contains("heap|TRACE|alloc 10 bytes"), "{}", text);
    });

    logging::set_capture_enabled(false);
    assert_eq!(logging::captured_count("boot"), 0);
    logging::set_level(LevelFilter::Info);
}
