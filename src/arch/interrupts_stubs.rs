use core::arch::global_asm;

use super::{
    EXCEPTION_DIVIDE_ERROR, EXCEPTION_DOUBLE_FAULT, EXCEPTION_GENERAL_PROTECTION,
    EXCEPTION_INVALID_OPCODE, EXCEPTION_PAGE_FAULT, IRQ_BASE, YIELD_VECTOR,
};
use crate::arch::context::KERNEL_DATA_SELECTOR;

// Every IRQ stub leaves a `TrapFrame` on the stack, hands its address to
// `irq_rust_dispatch` and resumes whatever frame comes back. Returning a
// different frame is a context switch.
macro_rules! irq_stub_asm {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                ".type ",
                stringify!($name),
                ", @function\n",
                stringify!($name),
                ":\n",
                "    cli\n",
                "    pushad\n",
                "    push ds\n",
                "    push es\n",
                "    push fs\n",
                "    push gs\n",
                "    mov ax, {data_selector}\n",
                "    mov ds, ax\n",
                "    mov es, ax\n",
                "    push esp\n",
                "    push {vector}\n",
                "    call irq_rust_dispatch\n",
                "    add esp, 8\n",
                "    mov esp, eax\n",
                "    pop gs\n",
                "    pop fs\n",
                "    pop es\n",
                "    pop ds\n",
                "    popad\n",
                "    iretd\n",
            ),
            vector = const $vector,
            data_selector = const KERNEL_DATA_SELECTOR,
        );
    };
}

// Exceptions are fatal: the stub forwards vector, error code and faulting
// eip to `exception_handler_rust` and never returns.
macro_rules! isr_stub_asm {
    ($name:ident, $vector:expr, $push_dummy_error:literal) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                ".type ",
                stringify!($name),
                ", @function\n",
                stringify!($name),
                ":\n",
                "    cli\n",
                $push_dummy_error,
                "    push dword ptr [esp + 4]\n",
                "    push dword ptr [esp + 4]\n",
                "    push {vector}\n",
                "    call exception_handler_rust\n",
                "1:\n",
                "    cli\n",
                "    hlt\n",
                "    jmp 1b\n",
            ),
            vector = const $vector,
        );
    };
}

irq_stub_asm!(irq0_stub, IRQ_BASE);
irq_stub_asm!(irq1_stub, IRQ_BASE + 1);
irq_stub_asm!(irq2_stub, IRQ_BASE + 2);
irq_stub_asm!(irq3_stub, IRQ_BASE + 3);
irq_stub_asm!(irq4_stub, IRQ_BASE + 4);
irq_stub_asm!(irq5_stub, IRQ_BASE + 5);
irq_stub_asm!(irq6_stub, IRQ_BASE + 6);
irq_stub_asm!(irq7_stub, IRQ_BASE + 7);
irq_stub_asm!(irq8_stub, IRQ_BASE + 8);
irq_stub_asm!(irq9_stub, IRQ_BASE + 9);
irq_stub_asm!(irq10_stub, IRQ_BASE + 10);
irq_stub_asm!(irq11_stub, IRQ_BASE + 11);
irq_stub_asm!(irq12_stub, IRQ_BASE + 12);
irq_stub_asm!(irq13_stub, IRQ_BASE + 13);
irq_stub_asm!(irq14_stub, IRQ_BASE + 14);
irq_stub_asm!(irq15_stub, IRQ_BASE + 15);
irq_stub_asm!(yield_stub, YIELD_VECTOR);

isr_stub_asm!(isr0_stub, EXCEPTION_DIVIDE_ERROR, "    push 0\n");
isr_stub_asm!(isr6_stub, EXCEPTION_INVALID_OPCODE, "    push 0\n");
isr_stub_asm!(isr8_stub, EXCEPTION_DOUBLE_FAULT, "");
isr_stub_asm!(isr13_stub, EXCEPTION_GENERAL_PROTECTION, "");
isr_stub_asm!(isr14_stub, EXCEPTION_PAGE_FAULT, "");

extern "C" {
    pub fn irq0_stub();
    pub fn irq1_stub();
    pub fn irq2_stub();
    pub fn irq3_stub();
    pub fn irq4_stub();
    pub fn irq5_stub();
    pub fn irq6_stub();
    pub fn irq7_stub();
    pub fn irq8_stub();
    pub fn irq9_stub();
    pub fn irq10_stub();
    pub fn irq11_stub();
    pub fn irq12_stub();
    pub fn irq13_stub();
    pub fn irq14_stub();
    pub fn irq15_stub();
    pub fn yield_stub();
    pub fn isr0_stub();
    pub fn isr6_stub();
    pub fn isr8_stub();
    pub fn isr13_stub();
    pub fn isr14_stub();
}
