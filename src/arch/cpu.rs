//! Privileged CPU state: CR3, paging enable, TLB and halt.
//!
//! Host builds keep a software copy of CR3 so the scheduler's "reload only
//! when it differs" rule can be observed in tests.

use crate::memory::{PhysAddr, VirtAddr};

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    use core::arch::asm;

    use crate::memory::{PhysAddr, VirtAddr};

    const CR0_PG: u32 = 1 << 31;

    pub fn read_cr3() -> PhysAddr {
        let val: u32;
        // SAFETY:
        // - Reading CR3 is privileged and valid in ring 0.
        // - Does not dereference memory.
        unsafe { asm!("mov {}, cr3", out(reg) val, options(nomem, nostack, preserves_flags)) };
        PhysAddr::new(val)
    }

    pub unsafe fn write_cr3(directory: PhysAddr) {
        // SAFETY: caller guarantees `directory` is a complete page directory.
        unsafe {
            asm!("mov cr3, {}", in(reg) directory.as_u32(), options(nostack, preserves_flags))
        };
    }

    pub unsafe fn enable_paging(directory: PhysAddr) {
        unsafe {
            write_cr3(directory);
            asm!(
                "mov {tmp}, cr0",
                "or {tmp}, {pg}",
                "mov cr0, {tmp}",
                tmp = out(reg) _,
                pg = const CR0_PG,
                options(nostack, preserves_flags)
            );
        }
    }

    pub fn invalidate_page(va: VirtAddr) {
        // SAFETY:
        // - `invlpg` is privileged and valid in ring 0.
        // - Operand is treated as an address tag for TLB invalidation.
        unsafe { asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags)) };
    }

    pub fn halt() {
        // SAFETY: waits for the next interrupt.
        unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }

    pub fn halt_forever() -> ! {
        loop {
            // SAFETY: terminal stop, interrupts stay off.
            unsafe { asm!("cli", "hlt", options(nomem, nostack, preserves_flags)) };
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use crate::memory::{PhysAddr, VirtAddr};

    static CR3: AtomicU32 = AtomicU32::new(0);
    static PAGING: AtomicBool = AtomicBool::new(false);

    pub fn read_cr3() -> PhysAddr {
        PhysAddr::new(CR3.load(Ordering::Acquire))
    }

    pub unsafe fn write_cr3(directory: PhysAddr) {
        CR3.store(directory.as_u32(), Ordering::Release);
    }

    pub unsafe fn enable_paging(directory: PhysAddr) {
        unsafe { write_cr3(directory) };
        PAGING.store(true, Ordering::Release);
    }

    pub fn invalidate_page(_va: VirtAddr) {}

    pub fn halt() {
        core::hint::spin_loop();
    }

    pub fn halt_forever() -> ! {
        panic!("halted");
    }
}

/// Returns the active page directory.
#[inline]
pub fn read_cr3() -> PhysAddr {
    imp::read_cr3()
}

/// Switches to another page directory.
///
/// # Safety
/// `directory` must be a complete directory that maps the running code and
/// stack.
#[inline]
pub unsafe fn write_cr3(directory: PhysAddr) {
    unsafe { imp::write_cr3(directory) }
}

/// Loads `directory` and turns paging on.
///
/// # Safety
/// Same contract as [`write_cr3`]; the running code must be identity mapped.
#[inline]
pub unsafe fn enable_paging(directory: PhysAddr) {
    unsafe { imp::enable_paging(directory) }
}

/// Drops the TLB entry of `va`.
#[inline]
pub fn invalidate_page(va: VirtAddr) {
    imp::invalidate_page(va)
}

/// Waits for the next interrupt.
#[inline]
pub fn halt() {
    imp::halt()
}

/// Stops the CPU for good with interrupts disabled.
pub fn halt_forever() -> ! {
    imp::halt_forever()
}
