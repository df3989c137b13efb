//! Saved register state and the context-switch capability.
//!
//! A task that is not running is fully described by a [`TrapFrame`] on its
//! kernel stack plus the page directory it runs in. The interrupt stubs push
//! the frame on entry and pop whatever frame the Rust side hands back, so a
//! context switch is "return a different frame address and maybe load CR3".

use static_assertions::const_assert_eq;

use crate::arch::cpu;
use crate::memory::{PhysAddr, VirtAddr};

/// Kernel code selector.
pub const KERNEL_CODE_SELECTOR: u32 = 0x08;

/// Kernel data selector, used for every data segment register.
pub const KERNEL_DATA_SELECTOR: u32 = 0x10;

/// EFLAGS with the reserved bit and IF set.
pub const INITIAL_EFLAGS: u32 = 0x202;

/// Register state as pushed by the interrupt stubs.
///
/// Layout contract:
/// - Segment registers are pushed last, so they come first.
/// - `edi..eax` is the `pushad` image.
/// - `eip, cs, eflags` is the CPU-pushed frame of a same-privilege
///   interrupt, consumed by `iretd`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

const_assert_eq!(core::mem::size_of::<TrapFrame>(), 15 * 4);

/// Number of 32-bit words in a [`TrapFrame`].
pub const TRAP_FRAME_WORDS: usize = 15;

/// Frame + guard return address + argument.
pub const INITIAL_STACK_BYTES: usize = (TRAP_FRAME_WORDS + 2) * 4;

impl TrapFrame {
    fn words(&self) -> [u32; TRAP_FRAME_WORDS] {
        [
            self.gs, self.fs, self.es, self.ds, self.edi, self.esi, self.ebp, self.esp, self.ebx,
            self.edx, self.ecx, self.eax, self.eip, self.cs, self.eflags,
        ]
    }

    /// Little-endian image as it lies on the stack.
    pub fn to_bytes(&self) -> [u8; TRAP_FRAME_WORDS * 4] {
        let mut out = [0u8; TRAP_FRAME_WORDS * 4];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; TRAP_FRAME_WORDS * 4]) -> Self {
        let mut w = [0u32; TRAP_FRAME_WORDS];
        for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            gs: w[0],
            fs: w[1],
            es: w[2],
            ds: w[3],
            edi: w[4],
            esi: w[5],
            ebp: w[6],
            esp: w[7],
            ebx: w[8],
            edx: w[9],
            ecx: w[10],
            eax: w[11],
            eip: w[12],
            cs: w[13],
            eflags: w[14],
        }
    }
}

/// What the scheduler keeps per task for switching; opaque outside `arch`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskContext {
    frame: VirtAddr,
    cr3: PhysAddr,
}

impl TaskContext {
    pub const fn new(frame: VirtAddr, cr3: PhysAddr) -> Self {
        Self { frame, cr3 }
    }

    /// Saved frame address (the task's stack pointer while switched out).
    #[inline]
    pub fn frame(&self) -> VirtAddr {
        self.frame
    }

    #[inline]
    pub fn cr3(&self) -> PhysAddr {
        self.cr3
    }
}

/// Save/restore capability used by the scheduler.
///
/// Both calls run inside the scheduler's critical section with interrupts
/// masked.
pub trait ArchContext {
    /// Records that the outgoing task stopped with its state at `frame`.
    fn save(&mut self, outgoing: &mut TaskContext, frame: VirtAddr);

    /// Activates the incoming task's address space and returns the frame the
    /// interrupt stub must resume.
    fn restore(&mut self, incoming: &TaskContext) -> VirtAddr;
}

/// x86 implementation: frame pointers through the IRQ stubs, CR3 reloads.
#[derive(Debug, Default)]
pub struct X86Context {
    cr3_reloads: u64,
}

impl X86Context {
    pub const fn new() -> Self {
        Self { cr3_reloads: 0 }
    }

    /// How often `restore` had to load a different directory.
    pub fn cr3_reloads(&self) -> u64 {
        self.cr3_reloads
    }
}

impl ArchContext for X86Context {
    fn save(&mut self, outgoing: &mut TaskContext, frame: VirtAddr) {
        outgoing.frame = frame;
    }

    fn restore(&mut self, incoming: &TaskContext) -> VirtAddr {
        if cpu::read_cr3() != incoming.cr3 {
            // SAFETY:
            // - Every task directory shares the kernel identity and double
            //   maps, so the running code and stacks stay mapped.
            unsafe { cpu::write_cr3(incoming.cr3) };
            self.cr3_reloads += 1;
        }
        incoming.frame
    }
}

/// Guard return address below the argument of every new kernel thread.
///
/// Reached only if a thread function returns instead of calling exit.
pub extern "C" fn task_return_trap() -> ! {
    panic!("kernel thread returned without exit");
}

/// First stack image of a new kernel thread.
#[derive(Debug, Clone, Copy)]
pub struct InitialStack {
    /// Where the frame starts; this becomes the task's saved frame.
    pub frame_addr: VirtAddr,
    pub frame: TrapFrame,
    pub bytes: [u8; INITIAL_STACK_BYTES],
}

/// Seeds a stack so that `iretd` enters `entry` as `entry(arg)`.
///
/// ```text
///  stack_top ──► ┌──────────────────┐
///                │ arg              │  first cdecl argument
///                ├──────────────────┤
///                │ task_return_trap │  return address of entry
///                ├──────────────────┤
///                │ eflags = 0x202   │
///                │ cs     = 0x08    │
///                │ eip    = entry   │
///                │ eax .. edi       │  zero
///                │ ds es fs gs=0x10 │
///  frame_addr ─► └──────────────────┘
/// ```
///
/// Code addresses are truncated to 32 bits; they are only meaningful on the
/// i686 target.
pub fn build_initial_frame(stack_top: VirtAddr, entry: usize, arg: usize) -> InitialStack {
    let frame_addr = VirtAddr::new(stack_top.as_u32() - INITIAL_STACK_BYTES as u32);
    let frame = TrapFrame {
        gs: KERNEL_DATA_SELECTOR,
        fs: KERNEL_DATA_SELECTOR,
        es: KERNEL_DATA_SELECTOR,
        ds: KERNEL_DATA_SELECTOR,
        eip: entry as u32,
        cs: KERNEL_CODE_SELECTOR,
        eflags: INITIAL_EFLAGS,
        ..TrapFrame::default()
    };

    let mut bytes = [0u8; INITIAL_STACK_BYTES];
    let frame_len = TRAP_FRAME_WORDS * 4;
    bytes[..frame_len].copy_from_slice(&frame.to_bytes());
    let trap = task_return_trap as usize as u32;
    bytes[frame_len..frame_len + 4].copy_from_slice(&trap.to_le_bytes());
    bytes[frame_len + 4..].copy_from_slice(&(arg as u32).to_le_bytes());

    InitialStack {
        frame_addr,
        frame,
        bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_matches_stub_push_order() {
        assert_eq!(core::mem::offset_of!(TrapFrame, gs), 0);
        assert_eq!(core::mem::offset_of!(TrapFrame, edi), 16);
        assert_eq!(core::mem::offset_of!(TrapFrame, eax), 44);
        assert_eq!(core::mem::offset_of!(TrapFrame, eip), 48);
        assert_eq!(core::mem::offset_of!(TrapFrame, eflags), 56);
    }

    #[test]
    fn initial_stack_has_frame_trap_and_argument() {
        let stack = build_initial_frame(VirtAddr::new(0x4000_2000), 0x0010_1234, 7);
        assert_eq!(stack.frame_addr, VirtAddr::new(0x4000_2000 - 68));
        assert_eq!(stack.frame.eip, 0x0010_1234);
        assert_eq!(stack.frame.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(stack.frame.eflags, 0x202);
        assert_eq!(stack.frame.ds, KERNEL_DATA_SELECTOR);
        assert_eq!(&stack.bytes[64..], &7u32.to_le_bytes());

        let mut raw = [0u8; 60];
        raw.copy_from_slice(&stack.bytes[..60]);
        assert_eq!(TrapFrame::from_bytes(&raw), stack.frame);
    }

    #[test]
    fn restore_reloads_cr3_only_when_it_differs() {
        let mut arch = X86Context::new();
        let dir = cpu::read_cr3();
        let same = TaskContext::new(VirtAddr::new(0x1000), dir);
        assert_eq!(arch.restore(&same), VirtAddr::new(0x1000));
        assert_eq!(arch.cr3_reloads(), 0);

        let mut saved = TaskContext::default();
        arch.save(&mut saved, VirtAddr::new(0x2000));
        assert_eq!(saved.frame(), VirtAddr::new(0x2000));
    }
}
