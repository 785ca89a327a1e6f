//! Task control blocks.

use alloc::{boxed::Box, string::String, vec, vec::Vec};
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::{arch::x86_64::context::TaskContext, mm::vmm::AddressSpace};

/// Size of each task's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub u32);

bitflags! {
    /// Why a blocked task is blocked; a bitmask because some waits can be
    /// satisfied by more than one event (a driver waits on its IRQ *or* an
    /// inbound message).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockReason: u32 {
        const AMC_AWAIT     = 1 << 0;
        const IRQ_WAIT      = 1 << 1;
        const SLEEP         = 1 << 2;
        const PIPE_FULL     = 1 << 3;
        const PIPE_EMPTY    = 1 << 4;
        const KEYBOARD_WAIT = 1 << 5;
        const EXITED        = 1 << 6;
    }
}

/// Which event woke a task. Valid only between wake-up and the next block;
/// the woken task consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    AmcMessage,
    Irq,
    SleepElapsed,
    Killed,
}

impl UnblockReason {
    /// The block-reason bit this wake event satisfies. `Killed` overrides
    /// any wait.
    pub fn satisfies(self, mask: BlockReason) -> bool {
        match self {
            UnblockReason::AmcMessage => mask.contains(BlockReason::AMC_AWAIT),
            UnblockReason::Irq => mask.contains(BlockReason::IRQ_WAIT),
            UnblockReason::SleepElapsed => mask.contains(BlockReason::SLEEP),
            UnblockReason::Killed => true,
        }
    }
}

/// Scheduling class. Driver tasks preempt normal tasks; the idle class runs
/// only when nothing else is runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Idle,
    Normal,
    Driver,
}

impl PriorityClass {
    /// Time slice in 1 ms ticks. Drivers run short and latency-sensitive.
    pub fn quantum_ticks(self) -> u32 {
        match self {
            PriorityClass::Driver => 5,
            PriorityClass::Normal => 10,
            PriorityClass::Idle => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Running,
    Blocked(BlockReason),
    Exited,
}

/// Task Control Block.
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Saved kernel stack pointer; callee-saved registers live on the stack.
    pub context: TaskContext,
    kernel_stack: Box<[u8]>,
    pub address_space: AddressSpace,
    /// Kernel tasks borrow the kernel address space; user tasks own theirs
    /// and the reaper destroys it.
    pub owns_address_space: bool,
    pub priority: PriorityClass,
    pub state: TaskState,
    pub unblock_reason: Option<UnblockReason>,
    /// ms-since-boot timestamp a sleeping task becomes runnable at.
    pub sleep_deadline: Option<u64>,
    pub quantum_remaining: u32,
    pub exit_code: Option<i32>,
    /// Shared-memory regions this task participates in, for teardown.
    pub shmem_regions: Vec<u32>,
    /// Next free user-virtual address for shared-memory/device windows.
    pub shmem_next_vaddr: u64,
}

/// Base of the user-virtual window shared-memory regions are mapped into.
const SHMEM_WINDOW_BASE: u64 = 0x7000_0000_0000;

impl Task {
    /// Create a TCB whose first run enters `entry(arg)` in kernel mode on a
    /// fresh kernel stack.
    pub fn new(
        name: &str,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        id: TaskId,
        address_space: AddressSpace,
        owns_address_space: bool,
        priority: PriorityClass,
    ) -> Self {
        let kernel_stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let mut task = Self {
            id,
            name: String::from(name),
            context: TaskContext::empty(),
            kernel_stack,
            address_space,
            owns_address_space,
            priority,
            state: TaskState::Runnable,
            unblock_reason: None,
            sleep_deadline: None,
            quantum_remaining: priority.quantum_ticks(),
            exit_code: None,
            shmem_regions: Vec::new(),
            shmem_next_vaddr: SHMEM_WINDOW_BASE,
        };
        let top = task.kernel_stack_top();
        task.context.prime_kernel_stack(top, entry, arg);
        task
    }

    /// Top of the kernel stack, 16-byte aligned.
    pub fn kernel_stack_top(&self) -> u64 {
        let base = self.kernel_stack.as_ptr() as u64;
        (base + self.kernel_stack.len() as u64) & !0xF
    }

    /// Carve the next `size`-byte window out of the shared-memory area.
    pub fn take_shmem_window(&mut self, size: usize) -> u64 {
        let base = self.shmem_next_vaddr;
        self.shmem_next_vaddr += crate::mm::page_ceil(size as u64);
        base
    }
}

/// Raw pointer to a heap-allocated TCB.
///
/// Tasks are allocated with `Box::into_raw` at spawn and freed by the
/// reaper; every dereference happens with interrupts disabled under the
/// scheduler's lock discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPtr(NonNull<Task>);

// SAFETY: access discipline above; the uniprocessor design means no true
// parallelism, only interleaving at interrupt boundaries.
unsafe impl Send for TaskPtr {}
// SAFETY: see Send impl above; the same access discipline makes shared
// references across threads sound under the uniprocessor design.
unsafe impl Sync for TaskPtr {}

impl TaskPtr {
    pub fn from_boxed(task: Box<Task>) -> Self {
        // Box::into_raw never returns null
        Self(NonNull::new(Box::into_raw(task)).expect("boxed task is non-null"))
    }

    pub fn as_ptr(self) -> *mut Task {
        self.0.as_ptr()
    }

    /// Reclaim the TCB allocation. Reaper only.
    ///
    /// # Safety
    /// No other TaskPtr to this task may be dereferenced afterwards.
    pub unsafe fn into_boxed(self) -> Box<Task> {
        // SAFETY: pointer came from Box::into_raw in from_boxed.
        unsafe { Box::from_raw(self.0.as_ptr()) }
    }

    /// Shared access to the TCB.
    ///
    /// # Safety
    /// Caller must hold the scheduler lock or otherwise exclude concurrent
    /// mutation of this task.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut Task {
        // SAFETY: per the access discipline documented on the type.
        unsafe { &mut *self.0.as_ptr() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_unblock_reason_matching() {
        let mask = BlockReason::IRQ_WAIT | BlockReason::AMC_AWAIT;
        assert!(UnblockReason::Irq.satisfies(mask));
        assert!(UnblockReason::AmcMessage.satisfies(mask));
        assert!(!UnblockReason::SleepElapsed.satisfies(mask));
        // A kill wakes any wait
        assert!(UnblockReason::Killed.satisfies(BlockReason::SLEEP));
    }

    #[test_case]
    fn test_quantum_by_class() {
        assert!(
            PriorityClass::Driver.quantum_ticks() < PriorityClass::Normal.quantum_ticks(),
            "drivers get short slices"
        );
    }
}
