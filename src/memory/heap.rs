//! Bitmap-backed page heap of one address space.
//!
//! Design summary:
//! - Every allocation is a run of whole virtual pages inside the heap window.
//! - The run is found first-fit in the address space's [`PageBitmap`].
//! - Each page of the run is backed by its own frame from the frame stack;
//!   missing page tables are created on the way.
//! - A [`RegionHeader`] sits at the start of the run; the caller gets the
//!   address right after it.
//!
//! Notes:
//! - The header counts against the size, so `size + 16` bytes are rounded up
//!   to pages. A 4080-byte request fits in one page, 4081 bytes need two.
//! - Frames are not contiguous; all reads and writes go through the
//!   owning directory.
//! - A failed allocation leaves bitmap, tables and frame stack exactly as
//!   they were.

use core::mem::size_of;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::arch::cpu;
use crate::memory::bitmap::{HeapWindow, PageBitmap};
use crate::memory::manager::AddressSpaceId;
use crate::memory::paging::{self, PageTableEntry, PagingError, KERNEL_RW};
use crate::memory::pmm::{FrameAllocator, Zone};
use crate::memory::{pages_for, zero_frame, PhysAddr, PhysMapper, VirtAddr, DIRECTORY_ENTRIES};

/// Tag written into every region header.
pub const REGION_MAGIC: u32 = 0x4B4D_5247;

/// Bytes in front of every returned block.
pub const HEADER_SIZE: usize = size_of::<RegionHeader>();

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// Zero the returned block.
        const ZEROED = 1 << 0;
        /// Take frames from the DMA pool.
        const DMA_ZONE = 1 << 1;
        /// Take frames from the normal pool (default).
        const NORMAL_ZONE = 1 << 2;
    }
}

impl AllocFlags {
    fn zone(self) -> Zone {
        if self.contains(Self::DMA_ZONE) {
            Zone::Dma
        } else {
            Zone::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("inconsistent heap state: {0}")]
    InconsistentState(&'static str),
    #[error("unknown address space")]
    UnknownAddressSpace,
}

/// Metadata stored in front of every block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub magic: u32,
    /// Owning address space.
    pub space: u32,
    /// First virtual page of the run.
    pub first_page: u32,
    /// Pages in the run, header page included.
    pub page_count: u32,
}

const_assert_eq!(size_of::<RegionHeader>(), 16);

impl RegionHeader {
    pub const fn new(space: AddressSpaceId, first_page: usize, page_count: usize) -> Self {
        Self {
            magic: REGION_MAGIC,
            space: space.index() as u32,
            first_page: first_page as u32,
            page_count: page_count as u32,
        }
    }

    /// Address of the header belonging to the block at `ptr`.
    ///
    /// This is the only place that steps back from a returned pointer.
    pub fn locate(ptr: VirtAddr) -> Option<VirtAddr> {
        ptr.checked_sub(HEADER_SIZE as u32)
    }

    /// Address handed to the caller for a run starting at `base`.
    pub fn payload(base: VirtAddr) -> VirtAddr {
        VirtAddr::new(base.as_u32() + HEADER_SIZE as u32)
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        for (chunk, word) in out
            .chunks_exact_mut(4)
            .zip([self.magic, self.space, self.first_page, self.page_count])
        {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            magic: word(0),
            space: word(4),
            first_page: word(8),
            page_count: word(12),
        }
    }
}

/// Directory slots touched by one allocation that had no table before it.
struct CreatedTables([u32; DIRECTORY_ENTRIES / 32]);

impl CreatedTables {
    const fn new() -> Self {
        Self([0; DIRECTORY_ENTRIES / 32])
    }

    fn insert(&mut self, slot: usize) {
        self.0[slot / 32] |= 1 << (slot % 32);
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..DIRECTORY_ENTRIES).filter(|&slot| self.0[slot / 32] & (1 << (slot % 32)) != 0)
    }
}

/// Heap state of one address space: its directory plus its page bitmap.
pub struct MemoryMap {
    id: AddressSpaceId,
    directory: PhysAddr,
    bitmap: PageBitmap,
    window: HeapWindow,
    debug_enabled: bool,
}

impl MemoryMap {
    pub fn new(
        id: AddressSpaceId,
        directory: PhysAddr,
        bitmap: PageBitmap,
        window: HeapWindow,
    ) -> Self {
        debug_assert!(window.end_page <= bitmap.page_capacity());
        Self {
            id,
            directory,
            bitmap,
            window,
            debug_enabled: false,
        }
    }

    pub fn set_debug_output(&mut self, enabled: bool) {
        self.debug_enabled = enabled;
    }

    #[inline]
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    #[inline]
    pub fn directory(&self) -> PhysAddr {
        self.directory
    }

    #[inline]
    pub fn window(&self) -> HeapWindow {
        self.window
    }

    #[inline]
    pub fn bitmap(&self) -> &PageBitmap {
        &self.bitmap
    }

    /// Gives up the bitmap once the address space is torn down.
    pub fn into_bitmap(self) -> PageBitmap {
        self.bitmap
    }

    /// Pages currently marked allocated.
    pub fn pages_in_use(&self) -> usize {
        self.bitmap.count_set(self.window.pages())
    }

    /// Present page-table entries inside the heap window.
    pub fn mapped_pages<M: PhysMapper + ?Sized>(&self, mapper: &M) -> usize {
        let first = paging::table_index(self.window.first_page);
        let end = self.window.end_page.div_ceil(crate::memory::TABLE_ENTRIES);
        (first..end)
            .map(|slot| paging::read_entry(mapper, self.directory, slot))
            .filter(|pde| pde.is_present())
            .map(|pde| paging::present_entries(mapper, pde.frame()))
            .sum()
    }

    /// Allocates `size` bytes and returns the address after the header.
    pub fn allocate<M: PhysMapper + ?Sized>(
        &mut self,
        frames: &mut FrameAllocator,
        mapper: &M,
        size: usize,
        flags: AllocFlags,
    ) -> Result<VirtAddr, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let total = size.checked_add(HEADER_SIZE).ok_or(HeapError::OutOfMemory)?;
        let pages = pages_for(total);

        let first = self
            .bitmap
            .find_first_fit(self.window, pages)
            .ok_or_else(|| {
                log::debug!(target: "heap", "no run of {} free pages", pages);
                HeapError::OutOfMemory
            })?;

        let zone = flags.zone();
        let mut created = CreatedTables::new();
        let mut table = PhysAddr::zero();

        for done in 0..pages {
            let page = first + done;
            let slot = paging::table_index(page);
            let offset = paging::table_offset(page);

            // Entering a table: the first page of the run or a table boundary.
            if done == 0 || offset == 0 {
                let pde = paging::read_entry(mapper, self.directory, slot);
                if pde.is_present() {
                    table = pde.frame();
                } else {
                    let Some(frame) = frames.alloc_page(zone) else {
                        self.roll_back(frames, mapper, first, done, &created);
                        return Err(HeapError::OutOfMemory);
                    };
                    zero_frame(mapper, frame);
                    paging::write_entry(
                        mapper,
                        self.directory,
                        slot,
                        PageTableEntry::new(frame, KERNEL_RW),
                    );
                    created.insert(slot);
                    table = frame;
                    if self.debug_enabled {
                        log::trace!(target: "heap", "table {} created at {:?}", slot, frame);
                    }
                }
            }

            let Some(frame) = frames.alloc_page(zone) else {
                self.roll_back(frames, mapper, first, done, &created);
                return Err(HeapError::OutOfMemory);
            };
            paging::write_entry(mapper, table, offset, PageTableEntry::new(frame, KERNEL_RW));
            self.bitmap.set(page);
        }

        let base = VirtAddr::from_page(first);
        let header = RegionHeader::new(self.id, first, pages);
        paging::write_virtual(mapper, self.directory, base, &header.to_bytes())
            .map_err(|_| HeapError::InconsistentState("fresh region is not mapped"))?;

        let ptr = RegionHeader::payload(base);
        if flags.contains(AllocFlags::ZEROED) {
            paging::fill_virtual(mapper, self.directory, ptr, 0, size)
                .map_err(|_| HeapError::InconsistentState("fresh region is not mapped"))?;
        }

        if self.debug_enabled {
            log::trace!(
                target: "heap",
                "alloc {} bytes -> {:?} ({} pages from {:#x})",
                size,
                ptr,
                pages,
                first
            );
        }
        Ok(ptr)
    }

    /// Undoes the first `committed` pages of a run plus the tables created for it.
    fn roll_back<M: PhysMapper + ?Sized>(
        &mut self,
        frames: &mut FrameAllocator,
        mapper: &M,
        first: usize,
        committed: usize,
        created: &CreatedTables,
    ) {
        for page in (first..first + committed).rev() {
            let table = paging::read_entry(mapper, self.directory, paging::table_index(page)).frame();
            let offset = paging::table_offset(page);
            frames.free_page(paging::read_entry(mapper, table, offset).frame());
            paging::write_entry(mapper, table, offset, PageTableEntry::empty());
            self.bitmap.clear(page);
        }
        for slot in created.iter() {
            let pde = paging::read_entry(mapper, self.directory, slot);
            frames.free_page(pde.frame());
            paging::write_entry(mapper, self.directory, slot, PageTableEntry::empty());
        }
        log::warn!(
            target: "heap",
            "out of frames after {} pages, allocation rolled back",
            committed
        );
    }

    /// Reads and validates the header of the block at `ptr`.
    pub fn header_of<M: PhysMapper + ?Sized>(
        &self,
        mapper: &M,
        ptr: VirtAddr,
    ) -> Result<RegionHeader, HeapError> {
        let base = RegionHeader::locate(ptr)
            .filter(|base| base.is_page_aligned())
            .ok_or(HeapError::InconsistentState("pointer is not a block start"))?;

        let mut raw = [0u8; HEADER_SIZE];
        paging::read_virtual(mapper, self.directory, base, &mut raw)
            .map_err(|_| HeapError::InconsistentState("region header is not mapped"))?;
        let header = RegionHeader::from_bytes(&raw);

        if header.magic != REGION_MAGIC {
            return Err(HeapError::InconsistentState("bad region magic"));
        }
        if header.space != self.id.index() as u32 {
            return Err(HeapError::InconsistentState("region owned by another address space"));
        }
        let first = header.first_page as usize;
        let count = header.page_count as usize;
        if first != base.page_index() || count == 0 || !self.window.contains_run(first, count) {
            return Err(HeapError::InconsistentState("region outside the heap window"));
        }
        if !self.bitmap.all_set(first, count) {
            return Err(HeapError::InconsistentState("region pages are not allocated"));
        }
        Ok(header)
    }

    /// Frees the block at `ptr`.
    ///
    /// Pages are released last to first. A page table left without any present
    /// entry is released too and its directory slot cleared.
    pub fn free<M: PhysMapper + ?Sized>(
        &mut self,
        frames: &mut FrameAllocator,
        mapper: &M,
        ptr: VirtAddr,
    ) -> Result<(), HeapError> {
        let header = self.header_of(mapper, ptr)?;
        let first = header.first_page as usize;
        let count = header.page_count as usize;

        for page in (first..first + count).rev() {
            let slot = paging::table_index(page);
            let offset = paging::table_offset(page);
            let pde = paging::read_entry(mapper, self.directory, slot);
            if !pde.is_present() {
                return Err(HeapError::InconsistentState("allocated page without a table"));
            }
            let table = pde.frame();
            let pte = paging::read_entry(mapper, table, offset);
            if pte.is_present() {
                frames.free_page(pte.frame());
            }
            paging::write_entry(mapper, table, offset, PageTableEntry::empty());
            cpu::invalidate_page(VirtAddr::from_page(page));
            self.bitmap.clear(page);

            // Leaving this table: its first entry or the run's first page.
            if (offset == 0 || page == first) && paging::table_is_empty(mapper, table) {
                frames.free_page(table);
                paging::write_entry(mapper, self.directory, slot, PageTableEntry::empty());
                if self.debug_enabled {
                    log::trace!(target: "heap", "table {} released", slot);
                }
            }
        }

        if self.debug_enabled {
            log::trace!(target: "heap", "free {:?} ({} pages from {:#x})", ptr, count, first);
        }
        Ok(())
    }

    /// Frees every allocated page of the window. Used when the address space
    /// is torn down; tables are left for the directory teardown.
    pub fn release_all<M: PhysMapper + ?Sized>(&mut self, frames: &mut FrameAllocator, mapper: &M) {
        for page in self.window.pages() {
            if !self.bitmap.test(page) {
                continue;
            }
            let pde = paging::read_entry(mapper, self.directory, paging::table_index(page));
            if pde.is_present() {
                let offset = paging::table_offset(page);
                let pte = paging::read_entry(mapper, pde.frame(), offset);
                if pte.is_present() {
                    frames.free_page(pte.frame());
                }
                paging::write_entry(mapper, pde.frame(), offset, PageTableEntry::empty());
            }
            self.bitmap.clear(page);
        }
    }

    /// Translates `va` through this address space.
    pub fn translate<M: PhysMapper + ?Sized>(&self, mapper: &M, va: VirtAddr) -> Option<PhysAddr> {
        paging::translate(mapper, self.directory, va)
    }

    pub fn write_bytes<M: PhysMapper + ?Sized>(
        &self,
        mapper: &M,
        va: VirtAddr,
        bytes: &[u8],
    ) -> Result<(), PagingError> {
        paging::write_virtual(mapper, self.directory, va, bytes)
    }

    pub fn read_bytes<M: PhysMapper + ?Sized>(
        &self,
        mapper: &M,
        va: VirtAddr,
        out: &mut [u8],
    ) -> Result<(), PagingError> {
        paging::read_virtual(mapper, self.directory, va, out)
    }
}
