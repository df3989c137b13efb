//! Bitmap heap: run sizes, table bookkeeping, reuse and failure paths.

mod common;

use common::{boot_16mb, boot_with, RamMapper, MIB};
use kcore_kernel::config::KernelConfig;
use kcore_kernel::memory::heap::{AllocFlags, HeapError, HEADER_SIZE};
use kcore_kernel::memory::pmm::Zone;
use kcore_kernel::memory::{
    pages_for, AddressSpaceId, MemoryManager, PhysAddr, VirtAddr, HEAP_FIRST_TABLE, PAGE_SIZE,
    TABLE_SPAN,
};

const KERNEL: AddressSpaceId = AddressSpaceId::KERNEL;
const HEAP_START: u32 = (HEAP_FIRST_TABLE * TABLE_SPAN) as u32;

fn assert_consistent(mm: &MemoryManager<RamMapper>) {
    assert_eq!(mm.heap_pages_in_use(KERNEL), mm.mapped_heap_pages(KERNEL));
}

/// Allocates and frees one page so the first heap table is released.
fn release_first_table(mm: &mut MemoryManager<RamMapper>) {
    let ptr = mm.kmalloc(1, AllocFlags::NORMAL_ZONE).unwrap();
    mm.kfree(ptr);
    assert!(!mm.table_present(KERNEL, HEAP_FIRST_TABLE));
}

#[test]
fn test_small_block_takes_one_zeroed_page() {
    let mut mm = boot_16mb();
    let free = mm.free_frames();

    let ptr = mm.kmalloc(4000, AllocFlags::ZEROED).unwrap();
    assert_eq!(ptr, VirtAddr::new(HEAP_START + HEADER_SIZE as u32));
    assert_eq!(mm.heap_pages_in_use(KERNEL), 1);
    assert_eq!(mm.free_frames(), free - 1);
    assert_consistent(&mm);

    let mut out = vec![0xFFu8; 4000];
    mm.read_bytes(KERNEL, ptr, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn test_header_pushes_two_pages_into_three() {
    let mut mm = boot_16mb();
    let small = mm.kmalloc(4000, AllocFlags::ZEROED).unwrap();
    let large = mm.kmalloc(8192, AllocFlags::ZEROED).unwrap();

    assert_eq!(mm.heap_pages_in_use(KERNEL), 4);
    assert_eq!(large.as_u32() - small.as_u32(), PAGE_SIZE as u32);
    assert_consistent(&mm);

    mm.kfree(small);
    let again = mm.kmalloc(4000, AllocFlags::ZEROED).unwrap();
    assert_eq!(again, small);
}

#[test]
fn test_zeroed_flag_clears_reused_frames() {
    let mut mm = boot_16mb();
    let ptr = mm.kmalloc(256, AllocFlags::NORMAL_ZONE).unwrap();
    mm.write_bytes(KERNEL, ptr, &[0xAA; 256]).unwrap();
    mm.kfree(ptr);

    let ptr = mm.kmalloc(256, AllocFlags::ZEROED).unwrap();
    let mut out = [0xFFu8; 256];
    mm.read_bytes(KERNEL, ptr, &mut out).unwrap();
    assert_eq!(out, [0u8; 256]);
}

#[test]
fn test_block_filling_one_table_leaves_the_next_alone() {
    let mut mm = boot_16mb();
    let free = mm.free_frames();

    let ptr = mm.kmalloc(TABLE_SPAN - HEADER_SIZE, AllocFlags::NORMAL_ZONE).unwrap();
    assert_eq!(mm.heap_pages_in_use(KERNEL), 1024);
    assert_eq!(mm.free_frames(), free - 1024);
    assert_consistent(&mm);

    mm.kfree(ptr);
    assert!(!mm.table_present(KERNEL, HEAP_FIRST_TABLE));
    assert!(mm.table_present(KERNEL, HEAP_FIRST_TABLE + 1));
    assert_eq!(mm.free_frames(), free + 1);
}

#[test]
fn test_block_crossing_a_table_boundary() {
    let mut mm = boot_16mb();
    let free = mm.free_frames();

    let ptr = mm.kmalloc(TABLE_SPAN, AllocFlags::NORMAL_ZONE).unwrap();
    assert_eq!(mm.heap_pages_in_use(KERNEL), 1025);
    assert_eq!(mm.free_frames(), free - 1025);
    let last_byte = ptr.checked_add(TABLE_SPAN as u32 - 1).unwrap();
    assert!(mm.translate(KERNEL, last_byte).is_some());
    assert_consistent(&mm);

    // Freeing empties both tables, so both are released.
    mm.kfree(ptr);
    assert!(!mm.table_present(KERNEL, HEAP_FIRST_TABLE));
    assert!(!mm.table_present(KERNEL, HEAP_FIRST_TABLE + 1));
    let after_free = mm.free_frames();
    assert_eq!(after_free, free + 2);

    // The next run of the same size rebuilds them on demand.
    let ptr = mm.kmalloc(TABLE_SPAN, AllocFlags::NORMAL_ZONE).unwrap();
    assert_eq!(mm.free_frames(), after_free - 1027);
    assert!(mm.table_present(KERNEL, HEAP_FIRST_TABLE + 1));
    assert_consistent(&mm);
    mm.kfree(ptr);
    assert_eq!(mm.free_frames(), after_free);
}

#[test]
fn test_largest_block_fills_the_whole_window() {
    let (config, _) = KernelConfig::parse("heap=300-302");
    let mut mm = boot_with(16 * MIB, &config.memory);
    let window = 2 * TABLE_SPAN;

    assert_eq!(
        mm.kmalloc(window - HEADER_SIZE + 1, AllocFlags::NORMAL_ZONE),
        Err(HeapError::OutOfMemory)
    );
    let ptr = mm.kmalloc(window - HEADER_SIZE, AllocFlags::NORMAL_ZONE).unwrap();
    assert_eq!(ptr.as_usize(), 300 * TABLE_SPAN + HEADER_SIZE);
    assert_eq!(mm.heap_pages_in_use(KERNEL), 2048);
    assert_eq!(mm.kmalloc(1, AllocFlags::NORMAL_ZONE), Err(HeapError::OutOfMemory));
    assert_consistent(&mm);

    mm.kfree(ptr);
    assert_eq!(mm.heap_pages_in_use(KERNEL), 0);
    assert!(!mm.table_present(KERNEL, 300));
    assert!(!mm.table_present(KERNEL, 301));
}

#[test]
fn test_free_restores_bitmap_and_frames() {
    let mut mm = boot_16mb();
    release_first_table(&mut mm);
    let bitmap = mm.bitmap_window_snapshot(KERNEL);
    let free = mm.free_frames();

    let sizes = [1, 4080, 4081, 20_000, 3 * PAGE_SIZE];
    let blocks: Vec<_> = sizes
        .iter()
        .map(|&size| mm.kmalloc(size, AllocFlags::ZEROED).unwrap())
        .collect();
    assert_eq!(mm.heap_pages_in_use(KERNEL), 1 + 1 + 2 + 5 + 4);
    assert_consistent(&mm);

    for ptr in blocks.into_iter().rev() {
        mm.kfree(ptr);
        assert_consistent(&mm);
    }
    assert_eq!(mm.bitmap_window_snapshot(KERNEL), bitmap);
    assert_eq!(mm.free_frames(), free);
    assert_eq!(mm.heap_pages_in_use(KERNEL), 0);
}

#[test]
fn test_live_blocks_never_overlap() {
    let mut mm = boot_16mb();
    let mut live: Vec<(u32, u32)> = Vec::new();

    for round in 0..40usize {
        let size = 1 + (round * 2_731) % (5 * PAGE_SIZE);
        let ptr = mm.kmalloc(size, AllocFlags::NORMAL_ZONE).unwrap();
        let start = ptr.as_u32() - HEADER_SIZE as u32;
        let end = start + (pages_for(size + HEADER_SIZE) * PAGE_SIZE) as u32;
        for &(s, e) in &live {
            assert!(end <= s || start >= e, "{:#x}..{:#x} overlaps {:#x}..{:#x}", start, end, s, e);
        }
        live.push((start, end));

        if round % 3 == 2 {
            let (s, _) = live.remove(round % live.len());
            mm.kfree(VirtAddr::new(s + HEADER_SIZE as u32));
        }
        assert_consistent(&mm);
    }
}

#[test]
fn test_out_of_frames_rolls_back_everything() {
    let mut mm = boot_16mb();
    release_first_table(&mut mm);

    let mut hoard = Vec::new();
    while mm.free_frames() > 3 {
        hoard.push(mm.alloc_page(Zone::Normal).unwrap());
    }
    let bitmap = mm.bitmap_window_snapshot(KERNEL);

    // One table plus two pages fit, the third page does not.
    assert_eq!(
        mm.kmalloc(3 * PAGE_SIZE, AllocFlags::NORMAL_ZONE),
        Err(HeapError::OutOfMemory)
    );
    assert_eq!(mm.free_frames(), 3);
    assert_eq!(mm.bitmap_window_snapshot(KERNEL), bitmap);
    assert!(!mm.table_present(KERNEL, HEAP_FIRST_TABLE));
    assert_consistent(&mm);

    for frame in hoard {
        mm.free_page(frame);
    }
    assert!(mm.kmalloc(3 * PAGE_SIZE, AllocFlags::NORMAL_ZONE).is_ok());
}

#[test]
fn test_request_larger_than_the_window_fails_cleanly() {
    let mut mm = boot_16mb();
    let free = mm.free_frames();
    assert_eq!(
        mm.kmalloc(3 << 30, AllocFlags::NORMAL_ZONE),
        Err(HeapError::OutOfMemory)
    );
    assert_eq!(mm.free_frames(), free);
    assert_eq!(mm.kmalloc(0, AllocFlags::ZEROED), Err(HeapError::ZeroSize));
}

#[test]
fn test_bad_frees_are_reported() {
    let mut mm = boot_16mb();
    let a = mm.kmalloc(64, AllocFlags::ZEROED).unwrap();
    let b = mm.kmalloc(64, AllocFlags::ZEROED).unwrap();

    let inside = a.checked_add(8).unwrap();
    assert!(matches!(
        mm.try_kfree_in(KERNEL, inside),
        Err(HeapError::InconsistentState(_))
    ));

    // Identity-mapped kernel memory carries no region header.
    let outside = VirtAddr::new(0x30_0000 + HEADER_SIZE as u32);
    assert!(matches!(
        mm.try_kfree_in(KERNEL, outside),
        Err(HeapError::InconsistentState(_))
    ));

    mm.kfree(a);
    assert!(matches!(
        mm.try_kfree_in(KERNEL, a),
        Err(HeapError::InconsistentState(_))
    ));
    assert_eq!(mm.heap_pages_in_use(KERNEL), 1);
    mm.kfree(b);
}

#[test]
#[should_panic(expected = "kfree")]
fn test_kfree_of_unknown_pointer_panics() {
    let mut mm = boot_16mb();
    mm.kfree(VirtAddr::new(HEAP_START + 7 * PAGE_SIZE as u32 + HEADER_SIZE as u32));
}

#[test]
fn test_dma_zone_requests_share_the_frame_stack() {
    let mut mm = boot_16mb();
    let free = mm.free_frames();
    let ptr = mm.kmalloc(100, AllocFlags::DMA_ZONE | AllocFlags::ZEROED).unwrap();
    assert_eq!(mm.free_frames(), free - 1);
    let pa = mm.translate(KERNEL, ptr).unwrap();
    assert!(pa >= mm.footprint_end());
    assert_eq!(pa.as_u32() % PAGE_SIZE as u32, HEADER_SIZE as u32);
    assert_ne!(pa, PhysAddr::zero());
}
