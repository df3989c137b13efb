//! Page directory construction and two-level page-table walks (32-bit, 4 KiB).
//!
//! Directory layout shared by every address space:
//!
//! ```text
//!  directory slot      virtual range                   contents
//! ┌───────────────┬──────────────────────────────┬──────────────────────────────┐
//! │ [0, 256)      │ 0x0000_0000 .. 0x4000_0000   │ identity map of low memory   │
//! │ [256, 768)    │ 0x4000_0000 .. 0xC000_0000   │ heap window (bitmap tracked) │
//! │ [768, 1024)   │ 0xC000_0000 .. 0xFFFF_FFFF   │ kernel double map            │
//! └───────────────┴──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Every directory is built with all 1024 tables present. Lookups never branch
//! on a missing table, except in the heap window after the allocator released
//! a table that became empty.
//!
//! Tables are reached through a [`PhysMapper`], never through the MMU, so the
//! same walks work before paging is enabled and on the host.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::memory::{
    zero_frame, FrameSource, PhysAddr, PhysMapper, VirtAddr, DIRECTORY_ENTRIES, HEAP_FIRST_TABLE,
    KERNEL_PDIR_SPACE, KERNEL_VIRT_OFFSET, PAGE_SIZE, TABLE_ENTRIES,
};

bitflags! {
    /// Low flag bits of a directory or table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

const ENTRY_FRAME_MASK: u32 = !(PAGE_SIZE as u32 - 1);

/// Flags used for every kernel-owned directory and table entry.
pub const KERNEL_RW: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PagingError {
    /// No frame was available for a directory or table.
    #[error("out of page frames while building page tables")]
    OutOfMemory,

    /// A walk reached a directory slot without a table.
    #[error("directory slot {0} has no page table")]
    TableNotPresent(usize),

    /// A virtual address has no present mapping.
    #[error("{0:?} is not mapped")]
    NotMapped(VirtAddr),
}

/// One 32-bit directory or table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

const_assert_eq!(core::mem::size_of::<PageTableEntry>(), 4);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn new(frame: PhysAddr, flags: PageTableFlags) -> Self {
        Self((frame.as_u32() & ENTRY_FRAME_MASK) | flags.bits())
    }

    /// Returns the frame this entry points at.
    #[inline]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & ENTRY_FRAME_MASK)
    }

    #[inline]
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn set(&mut self, frame: PhysAddr, flags: PageTableFlags) {
        *self = Self::new(frame, flags);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Directory slot holding virtual page `page`.
#[inline]
pub const fn table_index(page: usize) -> usize {
    page / TABLE_ENTRIES
}

/// Entry of virtual page `page` inside its table.
#[inline]
pub const fn table_offset(page: usize) -> usize {
    page % TABLE_ENTRIES
}

/// Reads entry `index` of the table (or directory) at `table`.
#[inline]
pub fn read_entry<M: PhysMapper + ?Sized>(mapper: &M, table: PhysAddr, index: usize) -> PageTableEntry {
    debug_assert!(index < TABLE_ENTRIES);
    // SAFETY:
    // - `table` is a page-aligned table frame, so the mapper returns a
    //   4-byte aligned pointer valid for the whole page.
    // - `index < 1024` keeps the access inside that page.
    unsafe { mapper.phys_to_ptr(table).cast::<PageTableEntry>().add(index).read() }
}

/// Writes entry `index` of the table (or directory) at `table`.
#[inline]
pub fn write_entry<M: PhysMapper + ?Sized>(
    mapper: &M,
    table: PhysAddr,
    index: usize,
    entry: PageTableEntry,
) {
    debug_assert!(index < TABLE_ENTRIES);
    // SAFETY: see `read_entry`; the caller owns the table.
    unsafe {
        mapper
            .phys_to_ptr(table)
            .cast::<PageTableEntry>()
            .add(index)
            .write(entry)
    }
}

/// Returns whether a table contains no present entries.
pub fn table_is_empty<M: PhysMapper + ?Sized>(mapper: &M, table: PhysAddr) -> bool {
    (0..TABLE_ENTRIES).all(|i| !read_entry(mapper, table, i).is_present())
}

/// Counts the present entries of one table.
pub fn present_entries<M: PhysMapper + ?Sized>(mapper: &M, table: PhysAddr) -> usize {
    (0..TABLE_ENTRIES)
        .filter(|&i| read_entry(mapper, table, i).is_present())
        .count()
}

/// Builds an empty directory with all 1024 tables pre-allocated and zeroed.
///
/// Frames come from `source`: the bootstrap allocator for the kernel
/// directory, the frame stack for every later one. On failure every frame
/// taken so far is handed back, so the caller sees either a complete
/// directory or nothing.
pub fn make_address_space<S, M>(source: &mut S, mapper: &M) -> Result<PhysAddr, PagingError>
where
    S: FrameSource + ?Sized,
    M: PhysMapper + ?Sized,
{
    let directory = source.take_frame().ok_or(PagingError::OutOfMemory)?;
    zero_frame(mapper, directory);

    for slot in 0..DIRECTORY_ENTRIES {
        let Some(table) = source.take_frame() else {
            log::warn!(
                target: "paging",
                "directory build failed after {} of {} tables",
                slot,
                DIRECTORY_ENTRIES
            );
            // Roll back the tables taken so far, then the directory itself.
            for taken in (0..slot).rev() {
                source.release_frame(read_entry(mapper, directory, taken).frame());
            }
            source.release_frame(directory);
            return Err(PagingError::OutOfMemory);
        };
        zero_frame(mapper, table);
        write_entry(mapper, directory, slot, PageTableEntry::new(table, KERNEL_RW));
    }

    log::debug!(target: "paging", "directory {:?} built with {} tables", directory, DIRECTORY_ENTRIES);
    Ok(directory)
}

/// Releases every table frame of `directory` and the directory frame.
///
/// Leaf frames are not touched; heap pages must be freed beforehand.
pub fn release_address_space<S, M>(source: &mut S, mapper: &M, directory: PhysAddr)
where
    S: FrameSource + ?Sized,
    M: PhysMapper + ?Sized,
{
    let mut released = 0usize;
    for slot in 0..DIRECTORY_ENTRIES {
        let pde = read_entry(mapper, directory, slot);
        if pde.is_present() {
            source.release_frame(pde.frame());
            write_entry(mapper, directory, slot, PageTableEntry::empty());
            released += 1;
        }
    }
    source.release_frame(directory);
    log::debug!(target: "paging", "directory {:?} released ({} tables)", directory, released);
}

/// Maps one page in a directory whose table for `va` is present.
pub fn map_page<M: PhysMapper + ?Sized>(
    mapper: &M,
    directory: PhysAddr,
    va: VirtAddr,
    frame: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), PagingError> {
    let page = va.page_index();
    let slot = table_index(page);
    let pde = read_entry(mapper, directory, slot);
    if !pde.is_present() {
        return Err(PagingError::TableNotPresent(slot));
    }
    write_entry(mapper, pde.frame(), table_offset(page), PageTableEntry::new(frame, flags));
    Ok(())
}

/// Installs the kernel mappings into a freshly built kernel directory.
///
/// - `[0, identity_end)` is identity mapped.
/// - `[0, footprint_end)` is mapped a second time at `KERNEL_PDIR_SPACE`
///   (`0xC000_0000 + pa`), so addresses with and without the kernel offset
///   both resolve.
pub fn map_kernel<M: PhysMapper + ?Sized>(
    mapper: &M,
    directory: PhysAddr,
    footprint_end: PhysAddr,
    identity_end: PhysAddr,
) -> Result<(), PagingError> {
    debug_assert!(identity_end.as_usize() <= HEAP_FIRST_TABLE * TABLE_ENTRIES * PAGE_SIZE);

    for pa in (0..identity_end.as_usize()).step_by(PAGE_SIZE) {
        let pa = PhysAddr::new(pa as u32);
        map_page(mapper, directory, VirtAddr::new(pa.as_u32()), pa, KERNEL_RW)?;
    }

    for pa in (0..footprint_end.as_usize()).step_by(PAGE_SIZE) {
        let pa = PhysAddr::new(pa as u32);
        map_page(
            mapper,
            directory,
            VirtAddr::new(KERNEL_VIRT_OFFSET + pa.as_u32()),
            pa,
            KERNEL_RW,
        )?;
    }

    log::info!(
        target: "paging",
        "kernel directory {:?}: identity to {:#x}, double map of {:#x} bytes at {:#x}",
        directory,
        identity_end.as_u32(),
        footprint_end.as_u32(),
        KERNEL_VIRT_OFFSET
    );
    Ok(())
}

/// Copies the identity and kernel double-map entries of `kernel_dir` into the
/// tables of `new_dir`, so kernel code stays reachable after a CR3 switch.
///
/// The heap window is left untouched.
pub fn share_kernel_mappings<M: PhysMapper + ?Sized>(
    mapper: &M,
    kernel_dir: PhysAddr,
    new_dir: PhysAddr,
) -> Result<(), PagingError> {
    let shared = (0..HEAP_FIRST_TABLE).chain(KERNEL_PDIR_SPACE..DIRECTORY_ENTRIES);
    for slot in shared {
        let src = read_entry(mapper, kernel_dir, slot);
        let dst = read_entry(mapper, new_dir, slot);
        if !src.is_present() {
            continue;
        }
        if !dst.is_present() {
            return Err(PagingError::TableNotPresent(slot));
        }
        for offset in 0..TABLE_ENTRIES {
            let entry = read_entry(mapper, src.frame(), offset);
            write_entry(mapper, dst.frame(), offset, entry);
        }
    }
    Ok(())
}

/// Resolves `va` through `directory`.
pub fn translate<M: PhysMapper + ?Sized>(
    mapper: &M,
    directory: PhysAddr,
    va: VirtAddr,
) -> Option<PhysAddr> {
    let page = va.page_index();
    let pde = read_entry(mapper, directory, table_index(page));
    if !pde.is_present() {
        return None;
    }
    let pte = read_entry(mapper, pde.frame(), table_offset(page));
    pte.is_present()
        .then(|| PhysAddr::new(pte.frame().as_u32() | va.page_offset() as u32))
}

/// Splits `[va, va + len)` at page boundaries and hands each piece's
/// physical pointer to `f`.
fn for_each_chunk<M, F>(
    mapper: &M,
    directory: PhysAddr,
    va: VirtAddr,
    len: usize,
    mut f: F,
) -> Result<(), PagingError>
where
    M: PhysMapper + ?Sized,
    F: FnMut(*mut u8, usize, usize),
{
    let mut done = 0usize;
    while done < len {
        let cursor = va
            .checked_add(done as u32)
            .ok_or(PagingError::NotMapped(va))?;
        let pa = translate(mapper, directory, cursor).ok_or(PagingError::NotMapped(cursor))?;
        let chunk = (PAGE_SIZE - cursor.page_offset()).min(len - done);
        f(mapper.phys_to_ptr(pa), done, chunk);
        done += chunk;
    }
    Ok(())
}

/// Copies `bytes` to virtual address `va` of `directory`.
pub fn write_virtual<M: PhysMapper + ?Sized>(
    mapper: &M,
    directory: PhysAddr,
    va: VirtAddr,
    bytes: &[u8],
) -> Result<(), PagingError> {
    for_each_chunk(mapper, directory, va, bytes.len(), |dst, at, len| {
        // SAFETY:
        // - `dst` points into a mapped frame with `len` bytes left in it.
        // - `bytes[at..at + len]` is in bounds by construction.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr().add(at), dst, len) }
    })
}

/// Fills `len` bytes at virtual address `va` of `directory` with `value`.
pub fn fill_virtual<M: PhysMapper + ?Sized>(
    mapper: &M,
    directory: PhysAddr,
    va: VirtAddr,
    value: u8,
    len: usize,
) -> Result<(), PagingError> {
    for_each_chunk(mapper, directory, va, len, |dst, _, len| {
        // SAFETY: `dst` points into a mapped frame with `len` bytes left in it.
        unsafe { core::ptr::write_bytes(dst, value, len) }
    })
}

/// Copies `out.len()` bytes from virtual address `va` of `directory`.
pub fn read_virtual<M: PhysMapper + ?Sized>(
    mapper: &M,
    directory: PhysAddr,
    va: VirtAddr,
    out: &mut [u8],
) -> Result<(), PagingError> {
    let out_ptr = out.as_mut_ptr();
    for_each_chunk(mapper, directory, va, out.len(), |src, at, len| {
        // SAFETY:
        // - `src` points into a mapped frame with `len` bytes left in it.
        // - `out[at..at + len]` is in bounds by construction.
        unsafe { core::ptr::copy_nonoverlapping(src, out_ptr.add(at), len) }
    })
}
