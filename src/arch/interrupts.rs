//! Interrupt flag, IRQ handler registry, PIC/PIT wiring.
//!
//! The registry (`request_irq` / `free_irq` / `dispatch_irq`) and the
//! interrupt-flag helpers are portable; on the host the flag is an atomic.
//! IDT, PIC and PIT programming and the assembly stubs exist only on the
//! freestanding i686 target.

use bitflags::bitflags;

use crate::arch::port::PortByte;
use crate::memory::VirtAddr;
use crate::sync::spinlock::SpinLock;

pub const IRQ_BASE: u8 = 32;
pub const IRQ_LINES: u8 = 16;
pub const TIMER_IRQ: u8 = 0;
pub const KEYBOARD_IRQ: u8 = 1;
pub const PRIMARY_ATA_IRQ: u8 = 14;

/// Software interrupt that enters the scheduler directly.
pub const YIELD_VECTOR: u8 = 0x81;

/// Handlers that can share one line.
pub const MAX_SHARED_ACTIONS: usize = 4;

pub const EXCEPTION_DIVIDE_ERROR: u8 = 0;
pub const EXCEPTION_INVALID_OPCODE: u8 = 6;
pub const EXCEPTION_DOUBLE_FAULT: u8 = 8;
pub const EXCEPTION_GENERAL_PROTECTION: u8 = 13;
pub const EXCEPTION_PAGE_FAULT: u8 = 14;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

const PIC_ICW1_INIT: u8 = 0x10;
const PIC_ICW1_ICW4: u8 = 0x01;
const PIC_ICW4_8086: u8 = 0x01;

const PIT_COMMAND: u16 = 0x43;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_MODE_RATE_GENERATOR: u8 = 0x36;
const PIT_INPUT_HZ: u32 = 1_193_182;

/// IRQ callback: receives the interrupted frame, returns the frame to resume.
pub type IrqHandler = fn(VirtAddr) -> VirtAddr;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqFlags: u32 {
        /// The line may carry further handlers that also set this flag.
        const SHARED = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IrqError {
    #[error("IRQ {0} does not exist")]
    InvalidIrq(u8),
    #[error("IRQ {0} is already taken")]
    Busy(u8),
    #[error("vector {0:#x} cannot carry a software handler")]
    InvalidVector(u8),
    #[error("vector {0:#x} is already taken")]
    VectorBusy(u8),
}

#[derive(Clone, Copy)]
struct IrqAction {
    handler: IrqHandler,
    flags: IrqFlags,
    name: &'static str,
}

type IrqTable = [[Option<IrqAction>; MAX_SHARED_ACTIONS]; IRQ_LINES as usize];

static IRQ_TABLE: SpinLock<IrqTable> = SpinLock::new([[None; MAX_SHARED_ACTIONS]; IRQ_LINES as usize]);

/// Software interrupt vectors that accept a handler.
const SOFT_VECTORS: [u8; SOFT_VECTOR_COUNT] = [YIELD_VECTOR];
const SOFT_VECTOR_COUNT: usize = 1;

static SOFT_TABLE: SpinLock<[Option<IrqAction>; SOFT_VECTOR_COUNT]> =
    SpinLock::new([None; SOFT_VECTOR_COUNT]);

fn soft_slot(vector: u8) -> Option<usize> {
    SOFT_VECTORS.iter().position(|&v| v == vector)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod flag {
    use core::arch::asm;

    pub fn enable() {
        // SAFETY: sets IF; ring 0.
        unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) };
    }

    pub fn disable() {
        // SAFETY: clears IF; ring 0.
        unsafe { asm!("cli", options(nomem, nostack, preserves_flags)) };
    }

    pub fn are_enabled() -> bool {
        let eflags: u32;
        // SAFETY:
        // - Reading EFLAGS via pushfd/pop is safe and does not modify flags.
        // - `eflags` is a plain register output.
        unsafe { asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags)) };
        (eflags & (1 << 9)) != 0
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod flag {
    use core::sync::atomic::{AtomicBool, Ordering};

    static IF: AtomicBool = AtomicBool::new(false);

    pub fn enable() {
        IF.store(true, Ordering::SeqCst);
    }

    pub fn disable() {
        IF.store(false, Ordering::SeqCst);
    }

    pub fn are_enabled() -> bool {
        IF.load(Ordering::SeqCst)
    }
}

/// Enable interrupts globally.
#[inline]
pub fn enable() {
    flag::enable()
}

/// Disable interrupts globally.
#[inline]
pub fn disable() {
    flag::disable()
}

/// Returns whether interrupts are currently enabled (IF flag set).
#[inline]
pub fn are_enabled() -> bool {
    flag::are_enabled()
}

/// Runs `f` with interrupts masked, restoring the previous state afterwards.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let were_enabled = are_enabled();
    disable();
    let result = f();
    if were_enabled {
        enable();
    }
    result
}

/// Registers `handler` for hardware line `irq`.
///
/// A line holds one exclusive handler, or up to [`MAX_SHARED_ACTIONS`]
/// handlers that all pass [`IrqFlags::SHARED`].
pub fn request_irq(
    irq: u8,
    handler: IrqHandler,
    flags: IrqFlags,
    name: &'static str,
) -> Result<(), IrqError> {
    if irq >= IRQ_LINES {
        return Err(IrqError::InvalidIrq(irq));
    }

    {
        let mut table = IRQ_TABLE.lock();
        let line = &mut table[irq as usize];
        let taken = line.iter().flatten().count();
        let all_shared = line
            .iter()
            .flatten()
            .all(|action| action.flags.contains(IrqFlags::SHARED));
        if taken > 0 && !(all_shared && flags.contains(IrqFlags::SHARED)) {
            log::warn!(target: "irq", "IRQ {} busy, rejecting '{}'", irq, name);
            return Err(IrqError::Busy(irq));
        }
        let Some(slot) = line.iter_mut().find(|slot| slot.is_none()) else {
            return Err(IrqError::Busy(irq));
        };
        *slot = Some(IrqAction {
            handler,
            flags,
            name,
        });
    }

    unmask_line(irq);
    log::info!(target: "irq", "IRQ {} -> '{}'", irq, name);
    Ok(())
}

/// Removes every handler of `irq` and masks the line.
pub fn free_irq(irq: u8) -> Result<(), IrqError> {
    if irq >= IRQ_LINES {
        return Err(IrqError::InvalidIrq(irq));
    }
    IRQ_TABLE.lock()[irq as usize] = [None; MAX_SHARED_ACTIONS];
    mask_line(irq);
    log::info!(target: "irq", "IRQ {} released", irq);
    Ok(())
}

/// Number of handlers registered on `irq`.
pub fn handler_count(irq: u8) -> usize {
    if irq >= IRQ_LINES {
        return 0;
    }
    IRQ_TABLE.lock()[irq as usize].iter().flatten().count()
}

/// Names of the handlers registered on `irq`, in registration order.
pub fn handler_names(irq: u8) -> [Option<&'static str>; MAX_SHARED_ACTIONS] {
    let mut names = [None; MAX_SHARED_ACTIONS];
    if irq < IRQ_LINES {
        let table = IRQ_TABLE.lock();
        for (name, action) in names.iter_mut().zip(table[irq as usize].iter()) {
            *name = action.map(|action| action.name);
        }
    }
    names
}

/// Runs the handlers of `irq` in registration order.
///
/// Each handler gets the frame returned by the previous one. The table lock
/// is released before any handler runs, so handlers may register others.
pub fn dispatch_irq(irq: u8, frame: VirtAddr) -> VirtAddr {
    if irq >= IRQ_LINES {
        return frame;
    }
    let actions = IRQ_TABLE.lock()[irq as usize];
    let mut frame = frame;
    let mut handled = false;
    for action in actions.iter().flatten() {
        frame = (action.handler)(frame);
        handled = true;
    }
    if !handled {
        log::trace!(target: "irq", "spurious IRQ {}", irq);
    }
    frame
}

/// Registers the single handler of software vector `vector`.
pub fn request_vector(vector: u8, handler: IrqHandler, name: &'static str) -> Result<(), IrqError> {
    let slot = soft_slot(vector).ok_or(IrqError::InvalidVector(vector))?;
    let mut table = SOFT_TABLE.lock();
    if table[slot].is_some() {
        log::warn!(target: "irq", "vector {:#x} busy, rejecting '{}'", vector, name);
        return Err(IrqError::VectorBusy(vector));
    }
    table[slot] = Some(IrqAction {
        handler,
        flags: IrqFlags::empty(),
        name,
    });
    drop(table);
    log::info!(target: "irq", "vector {:#x} -> '{}'", vector, name);
    Ok(())
}

/// Removes the handler of software vector `vector`.
pub fn free_vector(vector: u8) -> Result<(), IrqError> {
    let slot = soft_slot(vector).ok_or(IrqError::InvalidVector(vector))?;
    SOFT_TABLE.lock()[slot] = None;
    Ok(())
}

/// Routes an interrupt vector to its handlers.
///
/// Hardware vectors go through [`dispatch_irq`], software vectors to their
/// registered handler. Anything else resumes `frame` unchanged.
pub fn dispatch_vector(vector: u8, frame: VirtAddr) -> VirtAddr {
    if (IRQ_BASE..IRQ_BASE + IRQ_LINES).contains(&vector) {
        return dispatch_irq(vector - IRQ_BASE, frame);
    }
    let action = soft_slot(vector).and_then(|slot| SOFT_TABLE.lock()[slot]);
    match action {
        Some(action) => (action.handler)(frame),
        None => {
            log::trace!(target: "irq", "unhandled vector {:#x}", vector);
            frame
        }
    }
}

/// Computes the PIT divisor for the requested interrupt frequency.
///
/// Returns 0 for `hz == 0` so callers can decide how to handle invalid input.
pub const fn pit_divisor_for_hz(hz: u32) -> u16 {
    if hz == 0 {
        return 0;
    }

    let divisor = PIT_INPUT_HZ / hz;
    if divisor == 0 {
        1
    } else if divisor > u16::MAX as u32 {
        u16::MAX
    } else {
        divisor as u16
    }
}

/// Programs PIT channel 0 as periodic timer with the given frequency.
pub fn init_periodic_timer(hz: u32) {
    let divisor = pit_divisor_for_hz(hz);
    if divisor == 0 {
        return;
    }

    // SAFETY:
    // - Writing PIT command/data ports is required to program channel 0.
    // - This routine only performs I/O port writes.
    unsafe {
        let cmd = PortByte::new(PIT_COMMAND);
        let data = PortByte::new(PIT_CHANNEL0);
        cmd.write(PIT_MODE_RATE_GENERATOR);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
    log::info!(target: "irq", "PIT at {} Hz (divisor {})", hz, divisor);
}

fn pic_data_port(irq: u8) -> (PortByte, u8) {
    if irq < 8 {
        (PortByte::new(PIC1_DATA), irq)
    } else {
        (PortByte::new(PIC2_DATA), irq - 8)
    }
}

/// Unmasks one PIC line (and the cascade for slave lines).
pub fn unmask_line(irq: u8) {
    let (port, bit) = pic_data_port(irq);
    // SAFETY: read-modify-write of a PIC mask register.
    unsafe {
        port.write(port.read() & !(1 << bit));
        if irq >= 8 {
            let master = PortByte::new(PIC1_DATA);
            master.write(master.read() & !(1 << 2));
        }
    }
}

/// Masks one PIC line.
pub fn mask_line(irq: u8) {
    let (port, bit) = pic_data_port(irq);
    // SAFETY: read-modify-write of a PIC mask register.
    unsafe { port.write(port.read() | (1 << bit)) };
}

#[cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]
fn end_of_interrupt(irq: u8) {
    // SAFETY: EOI command writes to the PIC command ports.
    unsafe {
        if irq >= 8 {
            PortByte::new(PIC2_COMMAND).write(PIC_EOI);
        }
        PortByte::new(PIC1_COMMAND).write(PIC_EOI);
    }
}

/// Small I/O delay by writing to port 0x80 (POST diagnostic port).
#[inline]
fn io_wait() {
    // SAFETY: port 0x80 is unused after POST.
    unsafe { PortByte::new(0x80).write(0) };
}

fn remap_pic(offset1: u8, offset2: u8) {
    // SAFETY: standard 8259A initialisation sequence.
    unsafe {
        let cmd1 = PortByte::new(PIC1_COMMAND);
        let cmd2 = PortByte::new(PIC2_COMMAND);
        let data1 = PortByte::new(PIC1_DATA);
        let data2 = PortByte::new(PIC2_DATA);

        let icw1 = PIC_ICW1_INIT | PIC_ICW1_ICW4;
        cmd1.write(icw1);
        io_wait();
        cmd2.write(icw1);
        io_wait();

        data1.write(offset1);
        io_wait();
        data2.write(offset2);
        io_wait();

        data1.write(0x04);
        io_wait();
        data2.write(0x02);
        io_wait();

        data1.write(PIC_ICW4_8086);
        io_wait();
        data2.write(PIC_ICW4_8086);
        io_wait();

        // Every line starts masked; request_irq unmasks.
        data1.write(0xFF);
        data2.write(0xFF);
    }
}

/// Initialize IDT and PIC for IRQ handling. Leaves interrupts disabled.
pub fn init() {
    disable();
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    idt::load();
    remap_pic(IRQ_BASE, IRQ_BASE + 8);
    *IRQ_TABLE.lock() = [[None; MAX_SHARED_ACTIONS]; IRQ_LINES as usize];
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[path = "interrupts_stubs.rs"]
mod interrupts_stubs;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod idt {
    use core::arch::asm;
    use core::cell::UnsafeCell;
    use core::mem::size_of;

    use super::interrupts_stubs::*;
    use super::*;

    const IDT_ENTRIES: usize = 256;
    const IDT_PRESENT: u8 = 0x80;
    const IDT_INTERRUPT_GATE_32: u8 = 0x0E;

    #[repr(C, packed)]
    #[derive(Clone, Copy)]
    struct IdtEntry {
        offset_low: u16,
        selector: u16,
        zero: u8,
        type_attr: u8,
        offset_high: u16,
    }

    impl IdtEntry {
        const fn missing() -> Self {
            Self {
                offset_low: 0,
                selector: 0,
                zero: 0,
                type_attr: 0,
                offset_high: 0,
            }
        }

        fn set_handler(&mut self, handler: usize) {
            self.offset_low = handler as u16;
            self.selector = 0x08;
            self.zero = 0;
            self.type_attr = IDT_PRESENT | IDT_INTERRUPT_GATE_32;
            self.offset_high = (handler >> 16) as u16;
        }
    }

    #[repr(C, packed)]
    struct IdtPointer {
        limit: u16,
        base: u32,
    }

    struct Idt(UnsafeCell<[IdtEntry; IDT_ENTRIES]>);

    // SAFETY: written once in `load` before interrupts are enabled.
    unsafe impl Sync for Idt {}

    static IDT: Idt = Idt(UnsafeCell::new([IdtEntry::missing(); IDT_ENTRIES]));

    pub fn load() {
        // SAFETY:
        // - Runs once during boot with interrupts disabled.
        // - The IDT is static, so the pointer loaded by `lidt` stays valid.
        unsafe {
            let idt = &mut *IDT.0.get();
            let irq_stubs: [unsafe extern "C" fn(); IRQ_LINES as usize] = [
                irq0_stub, irq1_stub, irq2_stub, irq3_stub, irq4_stub, irq5_stub, irq6_stub,
                irq7_stub, irq8_stub, irq9_stub, irq10_stub, irq11_stub, irq12_stub, irq13_stub,
                irq14_stub, irq15_stub,
            ];
            for (line, stub) in irq_stubs.iter().enumerate() {
                idt[IRQ_BASE as usize + line].set_handler(*stub as usize);
            }
            idt[YIELD_VECTOR as usize].set_handler(yield_stub as usize);
            idt[EXCEPTION_DIVIDE_ERROR as usize].set_handler(isr0_stub as usize);
            idt[EXCEPTION_INVALID_OPCODE as usize].set_handler(isr6_stub as usize);
            idt[EXCEPTION_DOUBLE_FAULT as usize].set_handler(isr8_stub as usize);
            idt[EXCEPTION_GENERAL_PROTECTION as usize].set_handler(isr13_stub as usize);
            idt[EXCEPTION_PAGE_FAULT as usize].set_handler(isr14_stub as usize);

            let idt_ptr = IdtPointer {
                limit: (size_of::<IdtEntry>() * IDT_ENTRIES - 1) as u16,
                base: IDT.0.get() as u32,
            };
            asm!("lidt [{}]", in(reg) &idt_ptr, options(readonly, nostack, preserves_flags));
        }
    }
}

/// Dispatch entry point called from the IRQ and yield stubs.
///
/// # Safety
/// - Must be called with interrupts disabled, from the assembly stubs only.
/// - `frame` points at the register-save area on the active kernel stack.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[no_mangle]
pub unsafe extern "C" fn irq_rust_dispatch(
    vector: u32,
    frame: *mut crate::arch::context::TrapFrame,
) -> *mut crate::arch::context::TrapFrame {
    let frame = VirtAddr::new(frame as u32);
    let Ok(vector) = u8::try_from(vector) else {
        return frame.as_usize() as *mut crate::arch::context::TrapFrame;
    };
    let next = dispatch_vector(vector, frame);
    if (IRQ_BASE..IRQ_BASE + IRQ_LINES).contains(&vector) {
        end_of_interrupt(vector - IRQ_BASE);
    }
    next.as_usize() as *mut crate::arch::context::TrapFrame
}

/// Fatal exception sink.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[no_mangle]
pub extern "C" fn exception_handler_rust(vector: u32, error_code: u32, eip: u32) -> ! {
    panic!(
        "CPU exception {:#04x} (error {:#x}) at eip {:#010x}",
        vector, error_code, eip
    );
}
