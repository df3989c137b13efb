//! Memory manager: the frame stack plus the heaps of all address spaces.
//!
//! Boot data flow ([`MemoryManager::bootstrap`]):
//!
//! ```text
//!  boot memory map ──► bootstrap allocator ──► frame-stack storage
//!                                         ├──► kernel directory + 1024 tables
//!                                         └──► kernel bitmap (128 KiB)
//!  map_kernel ──► enable paging ──► seal bootstrap allocator
//!  reserve [1 MiB, footprint_end) ──► populate frame stack
//! ```
//!
//! A process-wide instance lives in [`MEMORY`]; the free functions at the end
//! of this module run against it with interrupts masked.

use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::MemoryConfig;
use crate::memory::bitmap::{HeapWindow, PageBitmap, BITMAP_BYTES};
use crate::memory::bootinfo::{
    BootMemoryMap, MemoryMapEntry, MemoryMapError, LOW_MEMORY_END,
};
use crate::memory::early::{EarlyAllocError, EarlyAllocator};
use crate::memory::heap::{AllocFlags, HeapError, MemoryMap};
use crate::memory::paging::{self, PagingError};
use crate::memory::pmm::{FrameAllocator, Zone};
use crate::memory::{
    align_down, align_up, IdentityMapper, PhysAddr, PhysMapper, VirtAddr, IDENTITY_LIMIT,
    KERNEL_PHYS_BASE, KERNEL_VIRT_OFFSET, PAGE_SIZE,
};
use crate::sync::spinlock::SpinLock;

/// Address spaces (kernel included) the manager can hold at once.
pub const MAX_ADDRESS_SPACES: usize = 8;

/// Index of an address space slot. Slot 0 is the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(u8);

impl AddressSpaceId {
    pub const KERNEL: Self = Self(0);

    pub const fn from_index(index: usize) -> Option<Self> {
        if index < MAX_ADDRESS_SPACES {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What the boot stage hands to the kernel.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo<'a> {
    /// Firmware memory map as collected by the boot stage.
    pub memory_map: &'a [MemoryMapEntry],
    /// First byte after the loaded kernel image.
    pub kernel_end: PhysAddr,
    pub command_line: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("no usable memory behind the kernel image")]
    NoUsableMemory,
    #[error(transparent)]
    Early(#[from] EarlyAllocError),
    #[error("kernel directory: {0}")]
    Paging(#[from] PagingError),
    #[error("memory map: {0}")]
    MemoryMap(#[from] MemoryMapError),
}

pub struct MemoryManager<M: PhysMapper> {
    mapper: M,
    frames: FrameAllocator,
    spaces: [Option<MemoryMap>; MAX_ADDRESS_SPACES],
    kernel_directory: PhysAddr,
    footprint_end: PhysAddr,
    identity_end: PhysAddr,
    debug_heap: bool,
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Brings up physical and virtual memory.
    ///
    /// `enable_paging` receives the kernel directory once it is complete; on
    /// bare metal it loads CR3 and sets CR0.PG. Every failure is fatal for the
    /// kernel, so nothing is rolled back.
    pub fn bootstrap(
        mapper: M,
        info: &BootInfo<'_>,
        config: &MemoryConfig,
        enable_paging: impl FnOnce(PhysAddr),
    ) -> Result<Self, BootError> {
        let mut map = BootMemoryMap::from_entries(info.memory_map);
        map.log_entries();

        let image_end = align_up(info.kernel_end.as_u32(), PAGE_SIZE as u32)
            .ok_or(BootError::NoUsableMemory)? as u64;
        let identity_end = align_down(
            map.highest_available().min(IDENTITY_LIMIT as u64) as u32,
            PAGE_SIZE as u32,
        ) as u64;
        let region = map
            .region_containing(image_end)
            .ok_or(BootError::NoUsableMemory)?;
        let capacity = map.available_frames(LOW_MEMORY_END, identity_end);
        if capacity == 0 {
            return Err(BootError::NoUsableMemory);
        }

        let mut early = EarlyAllocator::new(
            PhysAddr::new(image_end as u32),
            PhysAddr::new(region.end.min(identity_end) as u32),
        );

        let stack_storage = early.early_alloc(capacity * core::mem::size_of::<u32>())?;
        let kernel_directory = paging::make_address_space(&mut early, &mapper)?;
        let bitmap_storage = early.early_alloc(BITMAP_BYTES)?;
        // SAFETY:
        // - The bitmap range was just handed out by the bootstrap allocator.
        // - The mapper keeps bootstrap ranges contiguous.
        unsafe { core::ptr::write_bytes(mapper.phys_to_ptr(bitmap_storage), 0, BITMAP_BYTES) };

        let footprint_end = early.footprint_end();
        let identity_end = PhysAddr::new(identity_end as u32);
        paging::map_kernel(&mapper, kernel_directory, footprint_end, identity_end)?;
        if config.debug_paging {
            log::trace!(
                target: "paging",
                "kernel directory {:?}: identity up to {:?}, image at {:#010x}",
                kernel_directory,
                identity_end,
                KERNEL_VIRT_OFFSET + KERNEL_PHYS_BASE
            );
        }

        enable_paging(kernel_directory);
        early.seal();

        map.insert_reserved(KERNEL_PHYS_BASE as u64, footprint_end.as_u32() as u64)?;

        let stack_ptr = NonNull::new(mapper.phys_to_ptr(stack_storage).cast::<u32>())
            .ok_or(BootError::NoUsableMemory)?;
        // SAFETY:
        // - The storage holds `capacity` u32 entries and belongs to the
        //   frame stack for the rest of the kernel's life.
        let mut frames = unsafe { FrameAllocator::from_raw_parts(stack_ptr, capacity) };
        frames.set_debug_output(config.debug_pmm);
        frames.populate(&map, LOW_MEMORY_END, identity_end.as_u32() as u64);

        let bitmap_ptr =
            NonNull::new(mapper.phys_to_ptr(bitmap_storage)).ok_or(BootError::NoUsableMemory)?;
        // SAFETY: zeroed bootstrap memory owned by the kernel bitmap from now on.
        let bitmap = unsafe { PageBitmap::from_static(bitmap_ptr, BITMAP_BYTES) };

        let window = if !config.heap_window.is_empty()
            && HeapWindow::KERNEL.contains_run(config.heap_window.first_page, config.heap_window.len())
        {
            config.heap_window
        } else {
            log::warn!(target: "boot", "heap window {:?} rejected, using default", config.heap_window);
            HeapWindow::KERNEL
        };
        let mut kernel_map = MemoryMap::new(AddressSpaceId::KERNEL, kernel_directory, bitmap, window);
        kernel_map.set_debug_output(config.debug_heap);

        let mut spaces: [Option<MemoryMap>; MAX_ADDRESS_SPACES] = core::array::from_fn(|_| None);
        spaces[AddressSpaceId::KERNEL.index()] = Some(kernel_map);

        log::info!(
            target: "boot",
            "memory up: footprint ends at {:?}, {} frames free",
            footprint_end,
            frames.free_frames()
        );

        Ok(Self {
            mapper,
            frames,
            spaces,
            kernel_directory,
            footprint_end,
            identity_end,
            debug_heap: config.debug_heap,
        })
    }

    #[inline]
    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Pops one free frame; `None` is out of memory.
    pub fn alloc_page(&mut self, zone: Zone) -> Option<PhysAddr> {
        self.frames.alloc_page(zone)
    }

    pub fn free_page(&mut self, frame: PhysAddr) {
        self.frames.free_page(frame);
    }

    pub fn kmalloc(&mut self, size: usize, flags: AllocFlags) -> Result<VirtAddr, HeapError> {
        self.kmalloc_in(AddressSpaceId::KERNEL, size, flags)
    }

    /// Frees a kernel block.
    ///
    /// # Panics
    /// When `ptr` does not name a live block of the kernel heap.
    pub fn kfree(&mut self, ptr: VirtAddr) {
        self.kfree_in(AddressSpaceId::KERNEL, ptr);
    }

    pub fn kmalloc_in(
        &mut self,
        space: AddressSpaceId,
        size: usize,
        flags: AllocFlags,
    ) -> Result<VirtAddr, HeapError> {
        let Self {
            mapper,
            frames,
            spaces,
            ..
        } = self;
        let map = spaces[space.index()]
            .as_mut()
            .ok_or(HeapError::UnknownAddressSpace)?;
        map.allocate(frames, &*mapper, size, flags)
    }

    /// Frees a block of `space`.
    ///
    /// # Panics
    /// On any inconsistency; use [`Self::try_kfree_in`] to get the error.
    pub fn kfree_in(&mut self, space: AddressSpaceId, ptr: VirtAddr) {
        if let Err(err) = self.try_kfree_in(space, ptr) {
            panic!("kfree({:?}) in {:?}: {}", ptr, space, err);
        }
    }

    pub fn try_kfree_in(&mut self, space: AddressSpaceId, ptr: VirtAddr) -> Result<(), HeapError> {
        let Self {
            mapper,
            frames,
            spaces,
            ..
        } = self;
        let map = spaces[space.index()]
            .as_mut()
            .ok_or(HeapError::UnknownAddressSpace)?;
        map.free(frames, &*mapper, ptr)
    }

    /// Builds a new address space with its own heap.
    ///
    /// The bitmap is allocated here on the global heap. Callers holding the
    /// global memory lock must use [`Self::make_address_space_with`] instead.
    pub fn make_address_space(&mut self) -> Result<AddressSpaceId, PagingError> {
        let bitmap = PageBitmap::try_new_boxed(BITMAP_BYTES).map_err(|_| PagingError::OutOfMemory)?;
        self.make_address_space_with(&mut Some(bitmap))
    }

    /// Builds a new address space around a caller-provided bitmap.
    ///
    /// Frames come from the frame stack. The kernel's identity and
    /// double-map entries are copied in. On success the bitmap is moved out
    /// of `bitmap`; on failure it stays with the caller and every frame is
    /// returned.
    pub fn make_address_space_with(
        &mut self,
        bitmap: &mut Option<PageBitmap>,
    ) -> Result<AddressSpaceId, PagingError> {
        let Some(slot) = self.spaces.iter().position(Option::is_none) else {
            log::warn!(target: "paging", "all {} address space slots in use", MAX_ADDRESS_SPACES);
            return Err(PagingError::OutOfMemory);
        };
        if bitmap.is_none() {
            return Err(PagingError::OutOfMemory);
        }
        let id = AddressSpaceId(slot as u8);

        let directory = paging::make_address_space(&mut self.frames, &self.mapper)?;
        if let Err(err) = paging::share_kernel_mappings(&self.mapper, self.kernel_directory, directory) {
            paging::release_address_space(&mut self.frames, &self.mapper, directory);
            return Err(err);
        }

        let Some(bitmap) = bitmap.take() else {
            paging::release_address_space(&mut self.frames, &self.mapper, directory);
            return Err(PagingError::OutOfMemory);
        };
        let mut map = MemoryMap::new(id, directory, bitmap, HeapWindow::KERNEL);
        map.set_debug_output(self.debug_heap);
        self.spaces[slot] = Some(map);
        log::debug!(target: "paging", "address space {:?} created at {:?}", id, directory);
        Ok(id)
    }

    /// Tears down `space`: heap pages, tables and the directory frame.
    ///
    /// Returns the bitmap so the caller can drop it outside any lock.
    pub fn destroy_address_space(&mut self, space: AddressSpaceId) -> Result<PageBitmap, HeapError> {
        if space == AddressSpaceId::KERNEL {
            return Err(HeapError::InconsistentState("kernel address space cannot be destroyed"));
        }
        let mut map = self.spaces[space.index()]
            .take()
            .ok_or(HeapError::UnknownAddressSpace)?;
        map.release_all(&mut self.frames, &self.mapper);
        paging::release_address_space(&mut self.frames, &self.mapper, map.directory());
        log::debug!(target: "paging", "address space {:?} destroyed", space);
        Ok(map.into_bitmap())
    }

    fn space(&self, space: AddressSpaceId) -> Result<&MemoryMap, HeapError> {
        self.spaces[space.index()]
            .as_ref()
            .ok_or(HeapError::UnknownAddressSpace)
    }

    /// Page directory of `space`, for loading into CR3.
    pub fn directory_of(&self, space: AddressSpaceId) -> Option<PhysAddr> {
        self.space(space).ok().map(MemoryMap::directory)
    }

    pub fn translate(&self, space: AddressSpaceId, va: VirtAddr) -> Option<PhysAddr> {
        self.space(space).ok()?.translate(&self.mapper, va)
    }

    /// Copies `bytes` to `va` through the page tables of `space`.
    pub fn write_bytes(&self, space: AddressSpaceId, va: VirtAddr, bytes: &[u8]) -> Result<(), PagingError> {
        let map = self.space(space).map_err(|_| PagingError::NotMapped(va))?;
        map.write_bytes(&self.mapper, va, bytes)
    }

    pub fn read_bytes(&self, space: AddressSpaceId, va: VirtAddr, out: &mut [u8]) -> Result<(), PagingError> {
        let map = self.space(space).map_err(|_| PagingError::NotMapped(va))?;
        map.read_bytes(&self.mapper, va, out)
    }

    #[inline]
    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    /// Pages the heap of `space` has handed out.
    pub fn heap_pages_in_use(&self, space: AddressSpaceId) -> usize {
        self.space(space).map_or(0, MemoryMap::pages_in_use)
    }

    /// Present page-table entries inside the heap window of `space`.
    pub fn mapped_heap_pages(&self, space: AddressSpaceId) -> usize {
        self.space(space)
            .map_or(0, |map| map.mapped_pages(&self.mapper))
    }

    /// Copy of the bitmap bytes covering the heap window.
    pub fn bitmap_window_snapshot(&self, space: AddressSpaceId) -> Vec<u8> {
        self.space(space)
            .map(|map| map.bitmap().window_bytes(map.window()).to_vec())
            .unwrap_or_default()
    }

    /// Whether directory slot `slot` of `space` has a table.
    pub fn table_present(&self, space: AddressSpaceId, slot: usize) -> bool {
        self.space(space).is_ok_and(|map| {
            paging::read_entry(&self.mapper, map.directory(), slot).is_present()
        })
    }

    /// Whether `frame` is currently on the free stack.
    pub fn is_frame_free(&self, frame: PhysAddr) -> bool {
        self.frames.is_free(frame)
    }

    #[inline]
    pub fn kernel_directory(&self) -> PhysAddr {
        self.kernel_directory
    }

    /// First byte after the kernel image and all bootstrap allocations.
    #[inline]
    pub fn footprint_end(&self) -> PhysAddr {
        self.footprint_end
    }

    #[inline]
    pub fn identity_end(&self) -> PhysAddr {
        self.identity_end
    }
}

/// Global memory manager singleton.
struct GlobalMemory {
    inner: SpinLock<Option<MemoryManager<IdentityMapper>>>,
    initialized: AtomicBool,
}

impl GlobalMemory {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }
}

static MEMORY: GlobalMemory = GlobalMemory::new();

/// Installs the booted memory manager as the global instance.
pub fn install(manager: MemoryManager<IdentityMapper>) {
    *MEMORY.inner.lock() = Some(manager);
    MEMORY.initialized.store(true, Ordering::Release);
}

pub fn is_initialized() -> bool {
    MEMORY.initialized.load(Ordering::Acquire)
}

/// Runs `f` with exclusive access to the global memory manager.
///
/// # Panics
/// When called before [`install`].
pub fn with_memory<R>(f: impl FnOnce(&mut MemoryManager<IdentityMapper>) -> R) -> R {
    let mut guard = MEMORY.inner.lock();
    match guard.as_mut() {
        Some(manager) => f(manager),
        None => panic!("memory manager not initialized"),
    }
}

pub fn alloc_page(zone: Zone) -> Option<PhysAddr> {
    with_memory(|mm| mm.alloc_page(zone))
}

pub fn free_page(frame: PhysAddr) {
    with_memory(|mm| mm.free_page(frame));
}

pub fn kmalloc(size: usize, flags: AllocFlags) -> Result<VirtAddr, HeapError> {
    with_memory(|mm| mm.kmalloc(size, flags))
}

pub fn kfree(ptr: VirtAddr) {
    with_memory(|mm| mm.kfree(ptr));
}

/// Creates an address space; the bitmap is allocated before the lock is taken.
pub fn make_address_space() -> Result<AddressSpaceId, PagingError> {
    let mut bitmap = Some(
        PageBitmap::try_new_boxed(BITMAP_BYTES).map_err(|_| PagingError::OutOfMemory)?,
    );
    let result = with_memory(|mm| mm.make_address_space_with(&mut bitmap));
    drop(bitmap);
    result
}

/// Destroys an address space; its bitmap is dropped after the lock is released.
pub fn destroy_address_space(space: AddressSpaceId) -> Result<(), HeapError> {
    let bitmap = with_memory(|mm| mm.destroy_address_space(space))?;
    drop(bitmap);
    Ok(())
}
