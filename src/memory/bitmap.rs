//! One bit per virtual page index of an address space.
//!
//! Bit order is byte-major, most significant bit first: page `p` lives in
//! byte `p / 8` under mask `0x80 >> (p % 8)`. A set bit means "allocated by
//! the heap".

use alloc::boxed::Box;
use alloc::collections::TryReserveError;
use alloc::vec::Vec;
use core::ops::Range;
use core::ptr::NonNull;

use crate::memory::{HEAP_END_TABLE, HEAP_FIRST_TABLE, MAX_PAGES, TABLE_ENTRIES};

/// Bytes needed for one bit per page of a full address space.
pub const BITMAP_BYTES: usize = MAX_PAGES / 8;

/// Page-index range `[first_page, end_page)` the heap may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapWindow {
    pub first_page: usize,
    pub end_page: usize,
}

impl HeapWindow {
    /// Directory slots 256..768 (`0x4000_0000..0xC000_0000`).
    pub const KERNEL: Self = Self {
        first_page: HEAP_FIRST_TABLE * TABLE_ENTRIES,
        end_page: HEAP_END_TABLE * TABLE_ENTRIES,
    };

    pub const fn new(first_page: usize, end_page: usize) -> Self {
        Self {
            first_page,
            end_page,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.end_page.saturating_sub(self.first_page)
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `[first, first + count)` lies inside the window.
    #[inline]
    pub const fn contains_run(&self, first: usize, count: usize) -> bool {
        first >= self.first_page
            && count <= self.end_page
            && first <= self.end_page - count
    }

    #[inline]
    pub fn pages(&self) -> Range<usize> {
        self.first_page..self.end_page
    }
}

impl Default for HeapWindow {
    fn default() -> Self {
        Self::KERNEL
    }
}

enum Storage {
    /// Bootstrap memory; lives for the rest of the kernel's life.
    Static(NonNull<u8>),
    Owned(Box<[u8]>),
}

pub struct PageBitmap {
    storage: Storage,
    len: usize,
}

// SAFETY:
// - `Static` storage is exclusively owned by this bitmap.
// - Mutation needs `&mut self`.
unsafe impl Send for PageBitmap {}

impl PageBitmap {
    /// Wraps `len` zeroed bytes of bootstrap memory.
    ///
    /// # Safety
    /// `bits` must be valid for reads and writes of `len` bytes for the rest of
    /// the program and not be accessed through any other path.
    pub unsafe fn from_static(bits: NonNull<u8>, len: usize) -> Self {
        Self {
            storage: Storage::Static(bits),
            len,
        }
    }

    /// Allocates a zeroed bitmap on the kernel heap, reporting OOM instead of
    /// aborting.
    pub fn try_new_boxed(len: usize) -> Result<Self, TryReserveError> {
        let mut bits = Vec::new();
        bits.try_reserve_exact(len)?;
        bits.resize(len, 0u8);
        Ok(Self {
            storage: Storage::Owned(bits.into_boxed_slice()),
            len,
        })
    }

    fn bytes(&self) -> &[u8] {
        match &self.storage {
            // SAFETY: see `from_static`.
            Storage::Static(ptr) => unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            Storage::Owned(bits) => bits,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            // SAFETY: see `from_static`.
            Storage::Static(ptr) => unsafe {
                core::slice::from_raw_parts_mut(ptr.as_ptr(), self.len)
            },
            Storage::Owned(bits) => bits,
        }
    }

    /// Number of page bits this bitmap holds.
    #[inline]
    pub fn page_capacity(&self) -> usize {
        self.len * 8
    }

    #[inline]
    const fn mask(page: usize) -> u8 {
        0x80 >> (page % 8)
    }

    #[inline]
    pub fn test(&self, page: usize) -> bool {
        self.bytes()[page / 8] & Self::mask(page) != 0
    }

    #[inline]
    pub fn set(&mut self, page: usize) {
        self.bytes_mut()[page / 8] |= Self::mask(page);
    }

    #[inline]
    pub fn clear(&mut self, page: usize) {
        self.bytes_mut()[page / 8] &= !Self::mask(page);
    }

    /// Number of set bits in `pages`.
    pub fn count_set(&self, pages: Range<usize>) -> usize {
        pages.filter(|&page| self.test(page)).count()
    }

    /// Whether every bit in `[first, first + count)` is set.
    pub fn all_set(&self, first: usize, count: usize) -> bool {
        (first..first + count).all(|page| self.test(page))
    }

    /// Raw bytes covering the window, for before/after comparisons.
    pub fn window_bytes(&self, window: HeapWindow) -> &[u8] {
        let start = window.first_page / 8;
        let end = window.end_page.div_ceil(8).min(self.len);
        &self.bytes()[start..end]
    }

    /// First-fit search for `pages` consecutive clear bits inside `window`.
    ///
    /// The scan walks bit by bit in byte-major, MSB-first order. A set bit
    /// restarts the run at the next clear bit. Bytes that are completely set
    /// are skipped whole; that gives the same answer as walking their bits.
    pub fn find_first_fit(&self, window: HeapWindow, pages: usize) -> Option<usize> {
        if pages == 0 || pages > window.len() || window.end_page > self.page_capacity() {
            return None;
        }

        let bytes = self.bytes();
        let mut run_start = window.first_page;
        let mut run_len = 0usize;
        let mut page = window.first_page;

        while page < window.end_page {
            if page % 8 == 0 && page + 8 <= window.end_page && bytes[page / 8] == 0xFF {
                run_len = 0;
                page += 8;
                continue;
            }

            if bytes[page / 8] & Self::mask(page) != 0 {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = page;
                }
                run_len += 1;
                if run_len == pages {
                    return Some(run_start);
                }
            }
            page += 1;
        }
        None
    }
}

impl core::fmt::Debug for PageBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageBitmap")
            .field("bytes", &self.len)
            .field("owned", &matches!(self.storage, Storage::Owned(_)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(bytes: usize) -> PageBitmap {
        PageBitmap::try_new_boxed(bytes).unwrap()
    }

    #[test]
    fn bits_are_msb_first_within_a_byte() {
        let mut bits = small(2);
        bits.set(0);
        bits.set(9);
        assert_eq!(bits.window_bytes(HeapWindow::new(0, 16)), &[0x80, 0x40]);
        assert!(bits.test(9));
        bits.clear(9);
        assert!(!bits.test(9));
    }

    #[test]
    fn first_fit_restarts_after_a_set_bit() {
        let mut bits = small(4);
        let window = HeapWindow::new(0, 32);
        bits.set(2);
        assert_eq!(bits.find_first_fit(window, 2), Some(0));
        assert_eq!(bits.find_first_fit(window, 3), Some(3));
        bits.set(5);
        assert_eq!(bits.find_first_fit(window, 3), Some(6));
    }

    #[test]
    fn full_bytes_are_skipped_with_identical_result() {
        let mut bits = small(4);
        let window = HeapWindow::new(0, 32);
        for page in 0..15 {
            bits.set(page);
        }
        assert_eq!(bits.find_first_fit(window, 1), Some(15));
        assert_eq!(bits.find_first_fit(window, 2), Some(15));
        assert_eq!(bits.find_first_fit(window, 17), Some(15));
        assert_eq!(bits.find_first_fit(window, 18), None);
    }

    #[test]
    fn scan_stays_inside_the_window() {
        let bits = small(4);
        let window = HeapWindow::new(5, 12);
        assert_eq!(bits.find_first_fit(window, 1), Some(5));
        assert_eq!(bits.find_first_fit(window, 7), Some(5));
        assert_eq!(bits.find_first_fit(window, 8), None);
        assert_eq!(bits.find_first_fit(window, 0), None);
    }

    #[test]
    fn kernel_window_covers_the_middle_half() {
        let window = HeapWindow::KERNEL;
        assert_eq!(window.first_page, 0x4_0000);
        assert_eq!(window.len(), 512 * 1024);
        assert!(window.contains_run(0x4_0000, 512 * 1024));
        assert!(!window.contains_run(0x3_FFFF, 1));
        assert!(!window.contains_run(0xB_FFFF, 2));
    }
}
