// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode},
    PrivilegeLevel, VirtAddr,
};

use super::{apic, pit};
use crate::sched;

/// Vector of the scheduler tick (IRQ line 0).
pub const TIMER_VECTOR: u8 = apic::IRQ_VECTOR_BASE;

/// Vector of the syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// One past the last vector that can be delegated to a userland driver.
pub const IRQ_VECTOR_LIMIT: u8 = 56;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        // SAFETY: the double-fault IST slot holds a valid dedicated stack.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt[TIMER_VECTOR].set_handler_fn(timer_interrupt_handler);

        // Delegatable IRQ vectors (lines 1..) go through the shared
        // dispatch path that wakes the owning driver task.
        idt[33].set_handler_fn(irq33_handler);
        idt[34].set_handler_fn(irq34_handler);
        idt[35].set_handler_fn(irq35_handler);
        idt[36].set_handler_fn(irq36_handler);
        idt[37].set_handler_fn(irq37_handler);
        idt[38].set_handler_fn(irq38_handler);
        idt[39].set_handler_fn(irq39_handler);
        idt[40].set_handler_fn(irq40_handler);
        idt[41].set_handler_fn(irq41_handler);
        idt[42].set_handler_fn(irq42_handler);
        idt[43].set_handler_fn(irq43_handler);
        idt[44].set_handler_fn(irq44_handler);
        idt[45].set_handler_fn(irq45_handler);
        idt[46].set_handler_fn(irq46_handler);
        idt[47].set_handler_fn(irq47_handler);
        idt[48].set_handler_fn(irq48_handler);
        idt[49].set_handler_fn(irq49_handler);
        idt[50].set_handler_fn(irq50_handler);
        idt[51].set_handler_fn(irq51_handler);
        idt[52].set_handler_fn(irq52_handler);
        idt[53].set_handler_fn(irq53_handler);
        idt[54].set_handler_fn(irq54_handler);
        idt[55].set_handler_fn(irq55_handler);

        // Syscall gate: a raw stub that snapshots the interrupted registers
        // so the dispatcher can read arguments (and task_assert can print a
        // full register dump). DPL 3 so `int 0x80` is legal from user mode.
        // SAFETY: the stub address is a valid handler with an iretq epilogue.
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(
                    crate::syscall::syscall_entry_stub as usize as u64,
                ))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }

        idt
    };
}

pub fn init() {
    IDT.load();
}

// ---------------------------------------------------------------------------
// CPU fault handlers
// ---------------------------------------------------------------------------

/// Whether the interrupted code was running in Ring 3.
fn from_user_mode(stack_frame: &InterruptStackFrame) -> bool {
    stack_frame.code_segment.rpl() == PrivilegeLevel::Ring3
}

/// Kill the faulting user task (notifying the crash reporter) or panic for
/// a kernel-mode fault.
fn handle_fault(name: &'static str, detail: u64, stack_frame: &InterruptStackFrame) -> ! {
    if from_user_mode(stack_frame) {
        sched::fault_current_task(name, detail, stack_frame.instruction_pointer.as_u64());
    }
    panic!(
        "kernel {name} at {:#x} (detail {detail:#x})\n{stack_frame:#?}",
        stack_frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    handle_fault("divide error", 0, &stack_frame);
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    handle_fault("invalid opcode", 0, &stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let fault_addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
    if from_user_mode(&stack_frame) || error_code.contains(PageFaultErrorCode::USER_MODE) {
        sched::fault_current_task(
            "page fault",
            fault_addr,
            stack_frame.instruction_pointer.as_u64(),
        );
    }
    panic!(
        "kernel page fault at {:#x} (rip {:#x}, {:?})",
        fault_addr,
        stack_frame.instruction_pointer.as_u64(),
        error_code
    );
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    handle_fault("general protection fault", error_code, &stack_frame);
}

// ---------------------------------------------------------------------------
// Timer and delegated IRQs
// ---------------------------------------------------------------------------

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    let now_ms = pit::record_tick();
    apic::send_eoi();
    sched::timer_tick(now_ms);
}

/// Shared tail of every delegatable IRQ vector: wake the owning driver, or
/// EOI and drop the interrupt if no driver has adopted the line.
fn handle_external_irq(vector: u8) {
    if !crate::adi::interrupt_dispatch(vector as u32) {
        apic::send_eoi();
    }
}

macro_rules! irq_handler {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
            handle_external_irq($vector);
        }
    };
}

irq_handler!(irq33_handler, 33);
irq_handler!(irq34_handler, 34);
irq_handler!(irq35_handler, 35);
irq_handler!(irq36_handler, 36);
irq_handler!(irq37_handler, 37);
irq_handler!(irq38_handler, 38);
irq_handler!(irq39_handler, 39);
irq_handler!(irq40_handler, 40);
irq_handler!(irq41_handler, 41);
irq_handler!(irq42_handler, 42);
irq_handler!(irq43_handler, 43);
irq_handler!(irq44_handler, 44);
irq_handler!(irq45_handler, 45);
irq_handler!(irq46_handler, 46);
irq_handler!(irq47_handler, 47);
irq_handler!(irq48_handler, 48);
irq_handler!(irq49_handler, 49);
irq_handler!(irq50_handler, 50);
irq_handler!(irq51_handler, 51);
irq_handler!(irq52_handler, 52);
irq_handler!(irq53_handler, 53);
irq_handler!(irq54_handler, 54);
irq_handler!(irq55_handler, 55);
