//! x86 port I/O.
//!
//! On the freestanding i686 target this is `in`/`out`. Elsewhere writes are
//! dropped and reads see a floating bus (`0xFF`).

#[cfg(all(target_arch = "x86", target_os = "none"))]
use core::arch::asm;

/// Read a byte from the specified I/O port
///
/// # Safety
/// Port I/O is inherently unsafe as it can affect hardware state.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    asm!(
        "in al, dx",
        out("al") value,
        in("dx") port,
        options(nomem, nostack, preserves_flags)
    );
    value
}

/// Write a byte to the specified I/O port
///
/// # Safety
/// Port I/O is inherently unsafe as it can affect hardware state.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
unsafe fn outb(port: u16, value: u8) {
    asm!(
        "out dx, al",
        in("dx") port,
        in("al") value,
        options(nomem, nostack, preserves_flags)
    );
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
unsafe fn inb(_port: u16) -> u8 {
    0xFF
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
unsafe fn outb(_port: u16, _value: u8) {}

/// Typed wrapper for a specific I/O port (byte-sized)
#[derive(Debug, Clone, Copy)]
pub struct PortByte {
    port: u16,
}

impl PortByte {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// Read from this port
    ///
    /// # Safety
    /// Port I/O is inherently unsafe.
    #[inline]
    pub unsafe fn read(&self) -> u8 {
        inb(self.port)
    }

    /// Write to this port
    ///
    /// # Safety
    /// Port I/O is inherently unsafe.
    #[inline]
    pub unsafe fn write(&self, value: u8) {
        outb(self.port, value)
    }
}
