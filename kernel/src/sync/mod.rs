//! Kernel synchronization primitives.

mod once_lock;
mod spinlock;

pub use once_lock::GlobalState;
pub use spinlock::{held_lock_count, IrqSpinlock, IrqSpinlockGuard};
