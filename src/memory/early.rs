//! Bootstrap (early) allocator.
//!
//! A bump allocator over physical memory directly behind the kernel image. It
//! exists only until paging is enabled: it provides the frame-stack storage,
//! the kernel page directory with all of its tables, and the kernel heap
//! bitmap. Nothing it hands out is ever freed. Once [`EarlyAllocator::seal`]
//! has run every further call fails with [`EarlyAllocError::Sealed`].

use crate::memory::{align_up, FrameSource, PhysAddr, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EarlyAllocError {
    #[error("bootstrap allocator used after paging was enabled")]
    Sealed,
    #[error("bootstrap allocator exhausted ({requested} bytes requested, {remaining} left)")]
    Exhausted { requested: usize, remaining: usize },
}

/// Monotonic bump allocator used before paging is enabled.
#[derive(Debug)]
pub struct EarlyAllocator {
    cursor: u32,
    limit: u32,
    sealed: bool,
    allocations: usize,
}

impl EarlyAllocator {
    /// Creates an allocator handing out memory from `start` (rounded up to a
    /// page boundary) up to `limit` (exclusive).
    pub fn new(start: PhysAddr, limit: PhysAddr) -> Self {
        let cursor = align_up(start.as_u32(), PAGE_SIZE as u32).unwrap_or(u32::MAX);
        Self {
            cursor: cursor.min(limit.as_u32()),
            limit: limit.as_u32(),
            sealed: false,
            allocations: 0,
        }
    }

    /// Reserves `size` bytes and returns their start address.
    ///
    /// The cursor is page aligned again after every call, so each allocation
    /// starts on its own page.
    pub fn early_alloc(&mut self, size: usize) -> Result<PhysAddr, EarlyAllocError> {
        if self.sealed {
            return Err(EarlyAllocError::Sealed);
        }

        let remaining = (self.limit - self.cursor) as usize;
        let next = u32::try_from(size)
            .ok()
            .and_then(|size| self.cursor.checked_add(size))
            .and_then(|end| align_up(end, PAGE_SIZE as u32))
            .filter(|&end| end <= self.limit)
            .ok_or(EarlyAllocError::Exhausted {
                requested: size,
                remaining,
            })?;

        let start = PhysAddr::new(self.cursor);
        self.cursor = next;
        self.allocations += 1;
        log::trace!(target: "boot", "early_alloc {:#x} bytes at {:?}", size, start);
        Ok(start)
    }

    /// Ends the bootstrap phase. Called once paging is enabled.
    pub fn seal(&mut self) {
        self.sealed = true;
        log::debug!(
            target: "boot",
            "bootstrap allocator sealed after {} allocations, footprint ends at {:#x}",
            self.allocations,
            self.cursor
        );
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// First byte after everything handed out so far (page aligned).
    #[inline]
    pub fn footprint_end(&self) -> PhysAddr {
        PhysAddr::new(self.cursor)
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        (self.limit - self.cursor) as usize
    }
}

impl FrameSource for EarlyAllocator {
    fn take_frame(&mut self) -> Option<PhysAddr> {
        self.early_alloc(PAGE_SIZE).ok()
    }

    fn release_frame(&mut self, frame: PhysAddr) {
        // Bump memory cannot be given back; boot-time failures are fatal anyway.
        log::debug!(target: "boot", "bootstrap frame {:?} not reclaimed", frame);
    }
}
