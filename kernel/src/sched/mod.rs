//! Preemptive multitasking: task control blocks, multi-level feedback
//! queues, context switching, blocking primitives.

pub mod queue;
pub mod scheduler;
pub mod task;

pub use scheduler::{
    alloc_task_id, block_current, current_task, exit_current, fault_current_task, init, kill_task,
    ms_since_boot, reaper_entry, sleep_until, sleep_until_or_message, spawn_kernel_task,
    spawn_task, start, task_with_id, timer_tick, unblock_task, yield_now,
};
pub use task::{BlockReason, PriorityClass, Task, TaskId, TaskPtr, TaskState, UnblockReason};
