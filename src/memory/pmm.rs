/*
                    FRAME STACK LAYOUT
    ═══════════════════════════════════════════════════════════════════

    The free-frame stack is an array of 32-bit frame addresses carved out of
    bootstrap memory. `top` counts the live entries; `alloc_page` pops from
    the top, `free_page` pushes onto it.

    storage (capacity entries, u32 each)
    ┌────────────┬────────────┬────────────┬─────┬────────────┬───────────┐
    │ 0x00FFF000 │ 0x00FFE000 │ 0x00FFD000 │ ... │ 0x00562000 │ (unused)  │
    └────────────┴────────────┴────────────┴─────┴────────────┴───────────┘
      [0]          [1]          [2]                [top - 1]    [top..capacity)
                                                       ▲
                                                       └── next alloc_page()

    Population pushes every available frame above the kernel footprint in
    descending order, so a fresh allocator hands out ascending addresses.
    `capacity` equals the number of available frames in the boot map before
    the footprint was reserved, so every frame the kernel can legitimately
    release (including bootstrap page tables freed by the heap) fits.
*/

use core::ptr::NonNull;

use crate::memory::bootinfo::BootMemoryMap;
use crate::memory::{FrameSource, PhysAddr};

/// Allocation zone requested by a caller.
///
/// Both zones are served from one shared stack; the split is kept in the
/// interface only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zone {
    Dma,
    #[default]
    Normal,
}

/// Stack-of-free-frames physical page allocator.
pub struct FrameAllocator {
    /// Base of the `capacity`-entry storage array.
    stack: NonNull<u32>,

    /// Number of entries the storage can hold.
    capacity: usize,

    /// Number of frames currently on the stack.
    top: usize,

    /// Emit a trace record for every push/pop.
    debug_enabled: bool,
}

// SAFETY:
// - The storage pointer is owned exclusively by this allocator.
// - All access goes through `&mut self`; globals wrap it in a `SpinLock`.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// An allocator without storage; every allocation fails.
    pub const fn empty() -> Self {
        Self {
            stack: NonNull::dangling(),
            capacity: 0,
            top: 0,
            debug_enabled: false,
        }
    }

    /// Wraps caller-provided storage for `capacity` frame addresses.
    ///
    /// # Safety
    /// `storage` must be valid for reads and writes of `capacity` `u32`
    /// values, suitably aligned, and not accessed through any other path for
    /// as long as the allocator lives.
    pub unsafe fn from_raw_parts(storage: NonNull<u32>, capacity: usize) -> Self {
        Self {
            stack: storage,
            capacity,
            top: 0,
            debug_enabled: false,
        }
    }

    pub fn set_debug_output(&mut self, enabled: bool) {
        self.debug_enabled = enabled;
    }

    /// Pushes every available frame of `map` in `[floor, ceiling)`.
    ///
    /// Returns the number of frames pushed.
    pub fn populate(&mut self, map: &BootMemoryMap, floor: u64, ceiling: u64) -> usize {
        let before = self.top;
        'regions: for region in map.available_regions(floor, ceiling).rev() {
            for frame in region.frames().rev() {
                if self.top == self.capacity {
                    log::warn!(
                        target: "pmm",
                        "frame stack full at {} entries, ignoring remaining memory",
                        self.capacity
                    );
                    break 'regions;
                }
                self.push(frame);
            }
        }
        let pushed = self.top - before;
        log::info!(
            target: "pmm",
            "frame stack populated: {} frames ({} KiB) free",
            pushed,
            pushed * 4
        );
        pushed
    }

    /// Pops one free frame.
    ///
    /// Returns `None` when the stack is exhausted; callers treat this as out
    /// of memory and propagate it.
    pub fn alloc_page(&mut self, zone: Zone) -> Option<PhysAddr> {
        if self.top == 0 {
            log::debug!(target: "pmm", "out of frames (zone {:?})", zone);
            return None;
        }
        self.top -= 1;
        // SAFETY:
        // - `top < capacity`, so the slot lies inside the storage array.
        // - Storage is exclusively owned (see `from_raw_parts`).
        let frame = PhysAddr::new(unsafe { self.stack.as_ptr().add(self.top).read() });
        if self.debug_enabled {
            log::trace!(target: "pmm", "alloc {:?} zone={:?} free={}", frame, zone, self.top);
        }
        Some(frame)
    }

    /// Returns `frame` to the stack.
    ///
    /// There is no check that the frame was handed out by this allocator or
    /// that it is not already free.
    pub fn free_page(&mut self, frame: PhysAddr) {
        debug_assert!(frame.is_page_aligned(), "free_page: unaligned frame {:?}", frame);
        debug_assert!(self.top < self.capacity, "free_page: frame stack overflow");
        if self.top == self.capacity {
            log::error!(target: "pmm", "frame stack overflow, dropping {:?}", frame);
            return;
        }
        self.push(frame);
        if self.debug_enabled {
            log::trace!(target: "pmm", "free {:?} free={}", frame, self.top);
        }
    }

    #[inline]
    fn push(&mut self, frame: PhysAddr) {
        // SAFETY:
        // - Callers check `top < capacity` first.
        // - Storage is exclusively owned (see `from_raw_parts`).
        unsafe { self.stack.as_ptr().add(self.top).write(frame.as_u32()) };
        self.top += 1;
    }

    /// Number of frames currently free.
    #[inline]
    pub fn free_frames(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `frame` is currently on the free stack. Linear scan.
    pub fn is_free(&self, frame: PhysAddr) -> bool {
        // SAFETY:
        // - The first `top` entries are initialized and inside the storage.
        let live = unsafe { core::slice::from_raw_parts(self.stack.as_ptr(), self.top) };
        live.contains(&frame.as_u32())
    }
}

impl FrameSource for FrameAllocator {
    fn take_frame(&mut self) -> Option<PhysAddr> {
        self.alloc_page(Zone::Normal)
    }

    fn release_frame(&mut self, frame: PhysAddr) {
        self.free_page(frame);
    }
}
