//! COM1 serial output for kernel logs and panic messages.
//!
//! Under QEMU, `-serial file:debug.log` captures the output on the host.
//! On host builds the port writes are dropped.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::port::PortByte;
use crate::sync::spinlock::SpinLock;

const COM1_PORT: u16 = 0x3F8;

const DATA_REGISTER: u16 = 0;
const INTERRUPT_ENABLE: u16 = 1;
const FIFO_CONTROL: u16 = 2;
const LINE_CONTROL: u16 = 3;
const MODEM_CONTROL: u16 = 4;
const LINE_STATUS: u16 = 5;

/// Transmitter holding register empty.
const LINE_STATUS_THRE: u8 = 0x20;

/// Polled 8N1 serial port.
pub struct Serial {
    base_port: u16,
}

impl Serial {
    pub const fn new(base_port: u16) -> Self {
        Self { base_port }
    }

    pub const fn com1() -> Self {
        Self::new(COM1_PORT)
    }

    fn register(&self, offset: u16) -> PortByte {
        PortByte::new(self.base_port + offset)
    }

    /// 115200 baud, 8 data bits, no parity, 1 stop bit, FIFO on.
    pub fn init(&self) {
        // SAFETY: standard 16550 UART programming sequence on our own port.
        unsafe {
            self.register(INTERRUPT_ENABLE).write(0x00);
            // DLAB on, divisor 1
            self.register(LINE_CONTROL).write(0x80);
            self.register(DATA_REGISTER).write(0x01);
            self.register(INTERRUPT_ENABLE).write(0x00);
            // 8N1, DLAB off
            self.register(LINE_CONTROL).write(0x03);
            self.register(FIFO_CONTROL).write(0xC7);
            self.register(MODEM_CONTROL).write(0x0B);
        }
    }

    fn is_transmit_empty(&self) -> bool {
        // SAFETY: reading the line status register has no side effects.
        unsafe { (self.register(LINE_STATUS).read() & LINE_STATUS_THRE) != 0 }
    }

    pub fn write_byte(&self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        // SAFETY: THRE is set, so the data register accepts a byte.
        unsafe { self.register(DATA_REGISTER).write(byte) };
    }

    /// Writes `s`, expanding LF to CRLF.
    pub fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Serial::write_str(self, s);
        Ok(())
    }
}

static COM1: SpinLock<Serial> = SpinLock::new(Serial::com1());
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Programs COM1; output before this call is discarded.
pub fn init() {
    COM1.lock().init();
    INITIALIZED.store(true, Ordering::Release);
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Writes formatted text to COM1 if it has been initialized.
pub fn write_fmt(args: fmt::Arguments<'_>) {
    use fmt::Write;
    if is_initialized() {
        let _ = COM1.lock().write_fmt(args);
    }
}

/// Panic path: bypasses the lock, which the panicking code may hold.
pub fn write_fmt_unlocked(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let mut serial = Serial::com1();
    let _ = serial.write_fmt(args);
}
