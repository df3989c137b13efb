//! Boot-time physical memory map.
//!
//! The boot stage hands the kernel an array of firmware memory-map records
//! (`{base_low, base_high, length_low, length_high, type}`, type 1 meaning
//! available). The kernel keeps a bounded, owned copy so it can splice in a
//! synthetic reserved entry covering its own physical footprint before the
//! frame stack is populated.
//!
//! ```text
//!   0x00000000 ┌──────────────────────────────┐
//!              │ real mode memory, BIOS data  │  available (below 1 MiB, ignored)
//!   0x0009FC00 ├──────────────────────────────┤
//!              │ EBDA / VGA / option ROMs     │  reserved
//!   0x00100000 ├══════════════════════════════┤ ◄─ KERNEL_PHYS_BASE
//!              │ kernel image                 │
//!              │ bootstrap allocations        │  synthetic reserved entry
//!              │  (stack storage, directory,  │  inserted by `insert_reserved`
//!              │   1024 tables, bitmap)       │
//!              ├──────────────────────────────┤ ◄─ footprint end
//!              │ free frames                  │  pushed onto the frame stack
//!              └──────────────────────────────┘
//! ```

use core::fmt;

use crate::memory::{PhysAddr, PAGE_SIZE};

/// Firmware type of usable RAM.
pub const MEMORY_TYPE_AVAILABLE: u32 = 1;

/// Firmware type of reserved memory; also used for the kernel footprint.
pub const MEMORY_TYPE_RESERVED: u32 = 2;

/// Upper bound of entries the kernel keeps.
pub const MAX_MEMORY_MAP_ENTRIES: usize = 32;

/// Regions below this address are never handed to the frame allocator.
pub const LOW_MEMORY_END: u64 = 0x0010_0000;

const ADDRESS_LIMIT: u64 = 1 << 32;
const PAGE: u64 = PAGE_SIZE as u64;

/// One record of the firmware memory map as laid out by the boot stage.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryMapEntry {
    pub base_low: u32,
    pub base_high: u32,
    pub length_low: u32,
    pub length_high: u32,
    pub kind: u32,
}

impl MemoryMapEntry {
    pub const fn new(base: u64, length: u64, kind: u32) -> Self {
        Self {
            base_low: base as u32,
            base_high: (base >> 32) as u32,
            length_low: length as u32,
            length_high: (length >> 32) as u32,
            kind,
        }
    }

    #[inline]
    pub const fn base(&self) -> u64 {
        ((self.base_high as u64) << 32) | self.base_low as u64
    }

    #[inline]
    pub const fn length(&self) -> u64 {
        ((self.length_high as u64) << 32) | self.length_low as u64
    }

    #[inline]
    pub const fn end(&self) -> u64 {
        self.base().saturating_add(self.length())
    }

    #[inline]
    pub const fn is_available(&self) -> bool {
        self.kind == MEMORY_TYPE_AVAILABLE
    }

    /// Human-readable firmware type.
    pub const fn kind_name(&self) -> &'static str {
        match self.kind {
            1 => "Available",
            2 => "Reserved",
            3 => "ACPI Reclaim",
            4 => "ACPI NVS Memory",
            5 => "Bad Memory",
            _ => "Unknown",
        }
    }
}

impl fmt::Debug for MemoryMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#010x} - {:#010x} ({})",
            self.base(),
            self.end(),
            self.kind_name()
        )
    }
}

/// Page-aligned half-open physical range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub start: u64,
    pub end: u64,
}

impl PhysRange {
    #[inline]
    pub const fn frame_count(&self) -> usize {
        ((self.end - self.start) / PAGE) as usize
    }

    #[inline]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Iterates the frames of this range, lowest address first.
    pub fn frames(&self) -> impl DoubleEndedIterator<Item = PhysAddr> {
        let start = self.start;
        (0..self.frame_count()).map(move |i| PhysAddr::new((start + i as u64 * PAGE) as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("memory map has no room for another entry")]
    Full,
    #[error("empty or inverted range {start:#x}..{end:#x}")]
    InvalidRange { start: u64, end: u64 },
}

fn dominant_kind(a: u32, b: u32) -> u32 {
    match (a, b) {
        (MEMORY_TYPE_AVAILABLE, other) | (other, MEMORY_TYPE_AVAILABLE) => other,
        _ => a.max(b),
    }
}

/// Owned, bounded copy of the firmware memory map: sorted by base address,
/// entries never overlap.
#[derive(Clone)]
pub struct BootMemoryMap {
    entries: [MemoryMapEntry; MAX_MEMORY_MAP_ENTRIES],
    len: usize,
}

impl BootMemoryMap {
    pub const fn empty() -> Self {
        Self {
            entries: [MemoryMapEntry::new(0, 0, 0); MAX_MEMORY_MAP_ENTRIES],
            len: 0,
        }
    }

    /// Copies the records handed over by the boot stage.
    ///
    /// Zero-length records are dropped, records reaching past 4 GiB are
    /// clipped and records beyond [`MAX_MEMORY_MAP_ENTRIES`] are ignored.
    /// Overlapping records are resolved into disjoint entries.
    pub fn from_entries(raw: &[MemoryMapEntry]) -> Self {
        let mut clipped = [MemoryMapEntry::default(); MAX_MEMORY_MAP_ENTRIES];
        let mut count = 0usize;
        for entry in raw {
            let base = entry.base();
            let end = entry.end().min(ADDRESS_LIMIT);
            if base >= end {
                continue;
            }
            if count == MAX_MEMORY_MAP_ENTRIES {
                log::warn!(
                    target: "boot",
                    "memory map truncated to {} entries",
                    MAX_MEMORY_MAP_ENTRIES
                );
                break;
            }
            clipped[count] = MemoryMapEntry::new(base, end - base, entry.kind);
            count += 1;
        }
        Self::normalized(&clipped[..count])
    }

    /// Splits `records` at every boundary and rebuilds them as sorted,
    /// disjoint entries.
    ///
    /// Each piece takes the type of the records covering it: any other type
    /// beats available, and among those the higher type number wins.
    /// Touching pieces of the same type are merged. Firmware maps with
    /// overlapping or repeated records therefore never describe a frame
    /// twice.
    fn normalized(records: &[MemoryMapEntry]) -> Self {
        let mut bounds = [0u64; 2 * MAX_MEMORY_MAP_ENTRIES];
        for (i, record) in records.iter().enumerate() {
            bounds[2 * i] = record.base();
            bounds[2 * i + 1] = record.end();
        }
        let bounds = &mut bounds[..2 * records.len()];
        bounds.sort_unstable();

        let mut unique = 0usize;
        for i in 0..bounds.len() {
            if unique == 0 || bounds[i] != bounds[unique - 1] {
                bounds[unique] = bounds[i];
                unique += 1;
            }
        }

        let mut map = Self::empty();
        for piece in bounds[..unique].windows(2) {
            let (start, end) = (piece[0], piece[1]);
            let kind = records
                .iter()
                .filter(|r| r.base() <= start && r.end() >= end)
                .map(|r| r.kind)
                .reduce(dominant_kind);
            let Some(kind) = kind else {
                continue;
            };

            if let Some(last) = map.len.checked_sub(1).map(|i| &mut map.entries[i]) {
                if last.end() == start && last.kind == kind {
                    *last = MemoryMapEntry::new(last.base(), end - last.base(), kind);
                    continue;
                }
            }
            if map.len == MAX_MEMORY_MAP_ENTRIES {
                log::warn!(target: "boot", "memory map split past {} entries", MAX_MEMORY_MAP_ENTRIES);
                break;
            }
            map.entries[map.len] = MemoryMapEntry::new(start, end - start, kind);
            map.len += 1;
        }

        if map.len != records.len() {
            log::debug!(
                target: "boot",
                "memory map normalized from {} to {} entries",
                records.len(),
                map.len
            );
        }
        map
    }

    #[inline]
    pub fn entries(&self) -> &[MemoryMapEntry] {
        &self.entries[..self.len]
    }

    fn sort(&mut self) {
        self.entries[..self.len].sort_unstable_by_key(|e| e.base());
    }

    /// Carves `[start, end)` out of every available entry it overlaps and
    /// records it as a reserved entry.
    pub fn insert_reserved(&mut self, start: u64, end: u64) -> Result<(), MemoryMapError> {
        if start >= end {
            return Err(MemoryMapError::InvalidRange { start, end });
        }

        let mut rebuilt = [MemoryMapEntry::default(); MAX_MEMORY_MAP_ENTRIES];
        let mut count = 0usize;
        let mut push = |entry: MemoryMapEntry| -> Result<(), MemoryMapError> {
            if count == MAX_MEMORY_MAP_ENTRIES {
                return Err(MemoryMapError::Full);
            }
            rebuilt[count] = entry;
            count += 1;
            Ok(())
        };

        for entry in self.entries() {
            let overlaps = entry.base() < end && entry.end() > start;
            if !entry.is_available() || !overlaps {
                push(*entry)?;
                continue;
            }
            if entry.base() < start {
                push(MemoryMapEntry::new(
                    entry.base(),
                    start - entry.base(),
                    entry.kind,
                ))?;
            }
            if entry.end() > end {
                push(MemoryMapEntry::new(end, entry.end() - end, entry.kind))?;
            }
        }
        push(MemoryMapEntry::new(start, end - start, MEMORY_TYPE_RESERVED))?;

        self.entries = rebuilt;
        self.len = count;
        self.sort();
        Ok(())
    }

    /// Available ranges at or above `floor` and below `ceiling`, shrunk
    /// inward to page boundaries.
    pub fn available_regions(
        &self,
        floor: u64,
        ceiling: u64,
    ) -> impl DoubleEndedIterator<Item = PhysRange> + '_ {
        self.entries()
            .iter()
            .filter(|e| e.is_available())
            .filter_map(move |e| {
                let start = e.base().max(floor).div_ceil(PAGE) * PAGE;
                let end = (e.end().min(ceiling) / PAGE) * PAGE;
                (start < end).then_some(PhysRange { start, end })
            })
    }

    /// Number of whole available frames between `floor` and `ceiling`.
    pub fn available_frames(&self, floor: u64, ceiling: u64) -> usize {
        self.available_regions(floor, ceiling)
            .map(|r| r.frame_count())
            .sum()
    }

    /// The available range (page-aligned) holding `addr`, if any.
    pub fn region_containing(&self, addr: u64) -> Option<PhysRange> {
        self.available_regions(0, ADDRESS_LIMIT)
            .find(|r| r.contains(addr))
    }

    /// End of the highest available range.
    pub fn highest_available(&self) -> u64 {
        self.available_regions(0, ADDRESS_LIMIT)
            .map(|r| r.end)
            .max()
            .unwrap_or(0)
    }

    /// Logs every entry at `info`.
    pub fn log_entries(&self) {
        log::info!(target: "boot", "{} memory map entries", self.len);
        for entry in self.entries() {
            log::info!(target: "boot", "  {:?}", entry);
        }
    }
}
