//! Ring 0 -> Ring 3 transition.

use core::arch::asm;

use super::gdt;

/// Enter user mode for the first time via iretq.
///
/// The iretq frame is built on the current kernel stack: RIP, CS, RFLAGS,
/// RSP, SS from the top down. RFLAGS is 0x202 (reserved bit + IF), so the
/// task starts with interrupts enabled.
///
/// # Safety
/// - `entry_point` must be mapped user-executable in the active address
///   space and `user_stack` mapped user-writable
/// - The TSS RSP0 must point at this task's kernel stack, or the first
///   interrupt in user mode lands on a stale stack
pub unsafe fn enter_usermode(entry_point: u64, user_stack: u64) -> ! {
    let selectors = gdt::selectors();
    let user_cs = selectors.user_code_selector.0 as u64;
    let user_ss = selectors.user_data_selector.0 as u64;

    // SAFETY: per the function contract; the selectors reference the Ring 3
    // descriptors installed at boot.
    unsafe {
        asm!(
            // Data segments to the user selector
            "mov ds, {ss:r}",
            "mov es, {ss:r}",
            // Clear FS and GS; a dedicated zero operand avoids clobbering
            // registers the compiler picked for other operands.
            "mov fs, {zero:x}",
            "mov gs, {zero:x}",
            // iretq frame
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            ss = in(reg) user_ss,
            rsp = in(reg) user_stack,
            rflags = in(reg) 0x202u64,
            cs = in(reg) user_cs,
            rip = in(reg) entry_point,
            zero = in(reg) 0u64,
            options(noreturn)
        );
    }
}
