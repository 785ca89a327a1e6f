//! Kernel context switching.
//!
//! A task's saved context is its kernel stack pointer: the callee-saved
//! registers live on the stack itself, pushed by `switch_context` on the
//! way out and popped on the way back in. Fresh tasks get a hand-built
//! stack whose "saved" registers route execution into
//! `task_entry_trampoline`.

use core::arch::naked_asm;

/// Saved CPU context of a suspended task.
#[repr(C)]
#[derive(Debug)]
pub struct TaskContext {
    /// Kernel stack pointer at the moment of suspension.
    pub rsp: u64,
}

impl TaskContext {
    /// A context that has never run; `prime_kernel_stack` must fill it in.
    pub const fn empty() -> Self {
        Self { rsp: 0 }
    }

    /// Build the initial stack image for a task that has not run yet.
    ///
    /// The frame mimics what `switch_context` would have pushed: six
    /// callee-saved registers and a return address. The entry function and
    /// its argument ride in the rbx and r12 slots, where the trampoline
    /// finds them after the pops.
    ///
    /// `stack_top` must be 16-byte aligned.
    pub fn prime_kernel_stack(
        &mut self,
        stack_top: u64,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) {
        assert_eq!(stack_top % 16, 0, "kernel stack top must be 16-aligned");

        let rsp = stack_top - 7 * 8;
        let frame = rsp as *mut u64;
        // SAFETY: the seven slots lie within the task's freshly allocated
        // kernel stack, which nothing else references yet.
        unsafe {
            frame.add(0).write(0); // r15
            frame.add(1).write(0); // r14
            frame.add(2).write(0); // r13
            frame.add(3).write(arg as u64); // r12
            frame.add(4).write(entry as usize as u64); // rbx
            frame.add(5).write(0); // rbp
            frame.add(6).write(task_entry_trampoline as usize as u64); // return address
        }
        self.rsp = rsp;
    }
}

/// Suspend the current task into `current` and resume `next`.
///
/// # Safety
/// Must be called with interrupts disabled. Both pointers must reference
/// valid `TaskContext` structs; `next` must hold a stack pointer produced
/// by a previous suspension or by `prime_kernel_stack`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(current: *mut TaskContext, next: *const TaskContext) {
    naked_asm!(
        // Callee-saved registers onto the outgoing stack
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Swap stacks
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        // Callee-saved registers of the incoming task
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First instructions a new task executes.
///
/// `switch_context` pops the primed frame, leaving the entry function in
/// rbx and its argument in r12. Interrupts are re-enabled here: the frame
/// was built with them disabled and entry functions expect a live timer.
#[unsafe(naked)]
extern "C" fn task_entry_trampoline() {
    naked_asm!(
        "sti",
        "mov rdi, r12",
        "call rbx",
        // Entry functions never return (-> !); reaching here is a bug.
        "ud2",
    );
}
