//! Memory management: frames, page directories and the bitmap heap.
//!
//! All physical memory is reached through a [`PhysMapper`]. On bare metal that
//! is the identity map set up during boot; host tests substitute a mapper over
//! simulated RAM so page-table walks run unchanged.

pub mod bitmap;
pub mod bootinfo;
pub mod early;
pub mod heap;
pub mod manager;
pub mod paging;
pub mod pmm;

use core::fmt;

pub use manager::{AddressSpaceId, MemoryManager};

/// Size of one page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Entries per page table.
pub const TABLE_ENTRIES: usize = 1024;

/// Page tables per page directory (one per 4 MiB virtual region).
pub const DIRECTORY_ENTRIES: usize = 1024;

/// Number of virtual page indices one address space can describe.
pub const MAX_PAGES: usize = TABLE_ENTRIES * DIRECTORY_ENTRIES;

/// Bytes covered by one page table.
pub const TABLE_SPAN: usize = TABLE_ENTRIES * PAGE_SIZE;

/// First directory slot of the kernel double map (`0xC000_0000`).
pub const KERNEL_PDIR_SPACE: usize = 768;

/// Virtual offset of the kernel double map.
pub const KERNEL_VIRT_OFFSET: u32 = (KERNEL_PDIR_SPACE * TABLE_SPAN) as u32;

/// Physical load address of the kernel image (1 MiB).
pub const KERNEL_PHYS_BASE: u32 = 0x0010_0000;

/// First directory slot of the heap window.
pub const HEAP_FIRST_TABLE: usize = 256;

/// Directory slot one past the heap window.
pub const HEAP_END_TABLE: usize = KERNEL_PDIR_SPACE;

/// Highest identity-mapped physical address (exclusive).
pub const IDENTITY_LIMIT: u32 = (HEAP_FIRST_TABLE * TABLE_SPAN) as u32;

/// A 32-bit physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

/// A 32-bit virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

macro_rules! impl_address {
    ($ty:ident, $tag:literal) => {
        impl $ty {
            pub const fn new(addr: u32) -> Self {
                Self(addr)
            }

            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.0 as usize % PAGE_SIZE == 0
            }

            /// Rounds down to the containing page boundary.
            #[inline]
            pub const fn page_base(self) -> Self {
                Self(self.0 & !(PAGE_SIZE as u32 - 1))
            }

            /// Offset of this address inside its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 as usize % PAGE_SIZE
            }

            #[inline]
            pub const fn checked_add(self, bytes: u32) -> Option<Self> {
                match self.0.checked_add(bytes) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            #[inline]
            pub const fn checked_sub(self, bytes: u32) -> Option<Self> {
                match self.0.checked_sub(bytes) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "({:#010x})"), self.0)
            }
        }

        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

impl_address!(PhysAddr, "PhysAddr");
impl_address!(VirtAddr, "VirtAddr");

impl VirtAddr {
    /// Builds the address of `page` within an address space.
    #[inline]
    pub const fn from_page(page: usize) -> Self {
        Self((page * PAGE_SIZE) as u32)
    }

    /// Virtual page index of this address.
    #[inline]
    pub const fn page_index(self) -> usize {
        self.0 as usize / PAGE_SIZE
    }
}

impl PhysAddr {
    /// Page frame number of this address.
    #[inline]
    pub const fn frame_number(self) -> usize {
        self.0 as usize / PAGE_SIZE
    }
}

/// Aligns `value` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: u32, align: u32) -> Option<u32> {
    let mask = align - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

/// Aligns `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

/// Number of pages needed to hold `bytes`.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Gives the core a dereferenceable pointer for a physical address.
///
/// Implementations must return a pointer through which at least the rest of
/// the containing page can be read and written. Page-aligned addresses map to
/// page-aligned pointers, and physically contiguous ranges handed out by the
/// bootstrap allocator must stay contiguous behind the pointer.
pub trait PhysMapper {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8;
}

/// Bare-metal mapper: low physical memory is identity-mapped.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        pa.as_usize() as *mut u8
    }
}

/// Source of whole page frames for directory construction.
///
/// Implemented by the bootstrap allocator before paging and by the frame
/// stack afterwards.
pub trait FrameSource {
    fn take_frame(&mut self) -> Option<PhysAddr>;

    fn release_frame(&mut self, frame: PhysAddr);
}

/// Zeroes one physical page.
pub(crate) fn zero_frame<M: PhysMapper + ?Sized>(mapper: &M, frame: PhysAddr) {
    debug_assert!(frame.is_page_aligned());
    // SAFETY:
    // - `frame` is page aligned and owned by the caller.
    // - The mapper contract guarantees the whole page is reachable.
    unsafe {
        core::ptr::write_bytes(mapper.phys_to_ptr(frame), 0, PAGE_SIZE);
    }
}
