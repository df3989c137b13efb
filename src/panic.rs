//! Panic handler for the freestanding kernel.
//!
//! Prints the message straight to COM1, records it through `log`, then stops
//! the CPU with interrupts disabled.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{cpu, interrupts};
use crate::drivers::serial;

static PANICKING: AtomicBool = AtomicBool::new(false);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    interrupts::disable();

    serial::write_fmt_unlocked(format_args!("\n!!! KERNEL PANIC !!!\n{}\n", info));

    // A panic inside the logger must not recurse into it.
    if !PANICKING.swap(true, Ordering::SeqCst) {
        log::error!(target: "panic", "{}", info);
    }

    cpu::halt_forever()
}
