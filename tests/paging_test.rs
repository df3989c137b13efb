//! Address space construction, sharing of kernel mappings and teardown.

mod common;

use common::{boot_16mb, boot_with, MIB};
use kcore_kernel::config::MemoryConfig;
use kcore_kernel::memory::heap::{AllocFlags, HeapError};
use kcore_kernel::memory::manager::MAX_ADDRESS_SPACES;
use kcore_kernel::memory::paging::PagingError;
use kcore_kernel::memory::{
    AddressSpaceId, PhysAddr, VirtAddr, DIRECTORY_ENTRIES, HEAP_FIRST_TABLE, KERNEL_VIRT_OFFSET,
};

const DIRECTORY_FRAMES: usize = 1 + DIRECTORY_ENTRIES;

#[test]
fn test_kernel_directory_identity_and_double_map() {
    let mm = boot_16mb();
    let kernel = AddressSpaceId::KERNEL;

    for pa in [0x0u32, 0xB_8000, 0x10_0000, 0x20_0123, 0xFF_F000] {
        assert_eq!(
            mm.translate(kernel, VirtAddr::new(pa)),
            Some(PhysAddr::new(pa)),
            "identity map of {:#x}",
            pa
        );
    }

    let image = VirtAddr::new(KERNEL_VIRT_OFFSET + 0x10_0040);
    assert_eq!(mm.translate(kernel, image), Some(PhysAddr::new(0x10_0040)));
    let past_footprint = VirtAddr::new(KERNEL_VIRT_OFFSET + mm.footprint_end().as_u32());
    assert_eq!(mm.translate(kernel, past_footprint), None);

    let heap_start = VirtAddr::from_page(HEAP_FIRST_TABLE * 1024);
    assert_eq!(mm.translate(kernel, heap_start), None);
    assert!(mm.table_present(kernel, HEAP_FIRST_TABLE));
}

#[test]
fn test_new_space_shares_kernel_mappings_only() {
    let mut mm = boot_16mb();
    let free = mm.free_frames();

    let space = mm.make_address_space().unwrap();
    assert_ne!(space, AddressSpaceId::KERNEL);
    assert_eq!(mm.free_frames(), free - DIRECTORY_FRAMES);
    assert_ne!(mm.directory_of(space), mm.directory_of(AddressSpaceId::KERNEL));

    let image = VirtAddr::new(KERNEL_VIRT_OFFSET + 0x10_0000);
    assert_eq!(mm.translate(space, image), Some(PhysAddr::new(0x10_0000)));
    assert_eq!(
        mm.translate(space, VirtAddr::new(0x30_0000)),
        Some(PhysAddr::new(0x30_0000))
    );

    let kernel_block = mm.kmalloc(64, AllocFlags::ZEROED).unwrap();
    assert_eq!(mm.translate(space, kernel_block), None);
}

#[test]
fn test_heaps_of_different_spaces_are_isolated() {
    let mut mm = boot_16mb();
    let space = mm.make_address_space().unwrap();

    let in_kernel = mm.kmalloc(32, AllocFlags::ZEROED).unwrap();
    let in_space = mm.kmalloc_in(space, 32, AllocFlags::ZEROED).unwrap();
    // Both heaps start at the same window.
    assert_eq!(in_kernel, in_space);

    mm.write_bytes(AddressSpaceId::KERNEL, in_kernel, b"kernel").unwrap();
    mm.write_bytes(space, in_space, b"space!").unwrap();

    let mut out = [0u8; 6];
    mm.read_bytes(AddressSpaceId::KERNEL, in_kernel, &mut out).unwrap();
    assert_eq!(&out, b"kernel");
    mm.read_bytes(space, in_space, &mut out).unwrap();
    assert_eq!(&out, b"space!");
    assert_ne!(
        mm.translate(AddressSpaceId::KERNEL, in_kernel),
        mm.translate(space, in_space)
    );
}

#[test]
fn test_destroy_returns_every_frame() {
    let mut mm = boot_16mb();
    let free = mm.free_frames();

    let space = mm.make_address_space().unwrap();
    mm.kmalloc_in(space, 3 * 4096, AllocFlags::NORMAL_ZONE).unwrap();
    mm.kmalloc_in(space, 100, AllocFlags::ZEROED).unwrap();
    assert_eq!(mm.heap_pages_in_use(space), 5);

    let bitmap = mm.destroy_address_space(space).unwrap();
    drop(bitmap);
    assert_eq!(mm.free_frames(), free);
    assert_eq!(mm.directory_of(space), None);
    assert_eq!(
        mm.write_bytes(space, VirtAddr::new(0x4000_0010), b"x"),
        Err(PagingError::NotMapped(VirtAddr::new(0x4000_0010)))
    );
    assert_eq!(
        mm.kmalloc_in(space, 8, AllocFlags::NORMAL_ZONE),
        Err(HeapError::UnknownAddressSpace)
    );
}

#[test]
fn test_kernel_space_cannot_be_destroyed() {
    let mut mm = boot_16mb();
    assert!(matches!(
        mm.destroy_address_space(AddressSpaceId::KERNEL),
        Err(HeapError::InconsistentState(_))
    ));
    assert!(mm.directory_of(AddressSpaceId::KERNEL).is_some());
}

#[test]
fn test_failed_directory_build_returns_its_frames() {
    let mut mm = boot_16mb();
    // 16 MiB leaves room for two more directories, not three.
    mm.make_address_space().unwrap();
    mm.make_address_space().unwrap();
    let free = mm.free_frames();
    assert!(free < DIRECTORY_FRAMES);

    assert_eq!(mm.make_address_space(), Err(PagingError::OutOfMemory));
    assert_eq!(mm.free_frames(), free);
}

#[test]
fn test_space_slots_are_bounded() {
    let mut mm = boot_with(64 * MIB, &MemoryConfig::default());
    for _ in 1..MAX_ADDRESS_SPACES {
        mm.make_address_space().unwrap();
    }
    let free = mm.free_frames();
    assert_eq!(mm.make_address_space(), Err(PagingError::OutOfMemory));
    assert_eq!(mm.free_frames(), free);

    let last = AddressSpaceId::from_index(MAX_ADDRESS_SPACES - 1).unwrap();
    mm.destroy_address_space(last).unwrap();
    assert_eq!(mm.make_address_space(), Ok(last));
}
