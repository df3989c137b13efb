//! Global allocator backed by the kernel heap.
//!
//! Every `Box`, `Vec` and `VecDeque` in the kernel ends up in `kmalloc`.
//! Blocks start 16 bytes into a page, so alignments up to 16 are served
//! directly; larger ones over-allocate and keep the original pointer in the
//! word just below the aligned address.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;

use crate::memory::heap::{AllocFlags, HEADER_SIZE};
use crate::memory::{manager, VirtAddr};

/// Alignment every `kmalloc` block already has.
pub const HEAP_ALIGNMENT: usize = HEADER_SIZE;

const BACKREF_SIZE: usize = size_of::<u32>();

pub struct KernelAllocator;

#[inline]
fn align_up(addr: usize, align: usize) -> Option<usize> {
    let mask = align.checked_sub(1)?;
    addr.checked_add(mask).map(|v| v & !mask)
}

/// Bytes to request for an over-aligned `size`/`align` pair.
fn over_aligned_size(size: usize, align: usize) -> Option<usize> {
    align
        .checked_sub(1)?
        .checked_add(BACKREF_SIZE)?
        .checked_add(size)
}

/// Aligned address inside a block starting at `raw`, leaving room for the
/// back-reference below it.
fn aligned_within(raw: usize, align: usize) -> Option<usize> {
    align_up(raw.checked_add(BACKREF_SIZE)?, align)
}

#[inline]
fn backref_slot(aligned_ptr: *mut u8) -> *mut u32 {
    aligned_ptr.wrapping_sub(BACKREF_SIZE).cast::<u32>()
}

fn heap_alloc(size: usize) -> *mut u8 {
    if !manager::is_initialized() {
        return core::ptr::null_mut();
    }
    match manager::kmalloc(size, AllocFlags::NORMAL_ZONE) {
        Ok(va) => va.as_usize() as *mut u8,
        Err(_) => core::ptr::null_mut(),
    }
}

fn heap_free(ptr: *mut u8) {
    manager::kfree(VirtAddr::new(ptr as usize as u32));
}

// SAFETY:
// - `kmalloc`/`kfree` serialize through the memory manager's spinlock.
// - Heap blocks live in the kernel directory's mapped heap window.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        let align = layout.align();
        if align <= HEAP_ALIGNMENT {
            return heap_alloc(size);
        }

        let Some(total_size) = over_aligned_size(size, align) else {
            return core::ptr::null_mut();
        };
        let raw_ptr = heap_alloc(total_size);
        if raw_ptr.is_null() {
            return core::ptr::null_mut();
        }

        let Some(aligned_addr) = aligned_within(raw_ptr as usize, align) else {
            heap_free(raw_ptr);
            return core::ptr::null_mut();
        };
        let aligned_ptr = aligned_addr as *mut u8;

        // SAFETY:
        // - `aligned_ptr` lies within the over-allocated block.
        // - The word below `aligned_ptr` is inside the block too.
        unsafe {
            core::ptr::write_unaligned(backref_slot(aligned_ptr), raw_ptr as usize as u32);
        }
        aligned_ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }

        if layout.align() <= HEAP_ALIGNMENT {
            heap_free(ptr);
            return;
        }

        // SAFETY:
        // - `alloc` stored the original block address just below `ptr`.
        let raw = unsafe { core::ptr::read_unaligned(backref_slot(ptr)) };
        heap_free(raw as usize as *mut u8);
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
pub static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_aligned_request_fits_aligned_payload() {
        let align = 4096;
        let size = 100;
        let total = over_aligned_size(size, align).unwrap();
        // kmalloc blocks start 16 bytes into a page
        let raw = 0x4000_0010;
        let aligned = aligned_within(raw, align).unwrap();
        assert_eq!(aligned % align, 0);
        assert!(aligned - raw >= BACKREF_SIZE);
        assert!(aligned + size <= raw + total);
    }

    #[test]
    fn overflowing_requests_are_refused() {
        assert_eq!(over_aligned_size(usize::MAX, 64), None);
        assert_eq!(aligned_within(usize::MAX - 2, 64), None);
    }
}
