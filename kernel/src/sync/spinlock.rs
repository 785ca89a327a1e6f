//! Interrupt-safe spinlock.
//!
//! Run queues, the frame bitmap, the service table, and per-service inboxes
//! are all touched from interrupt context, so their locks must disable
//! interrupts for the critical section and restore the previous interrupt
//! flag on release. Nested acquisition by the same context is fine as long
//! as each acquire is paired with a release; the saved flag travels in the
//! guard, so releases in reverse order restore the right state.

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};
use x86_64::instructions::interrupts;

/// Count of kernel spinlocks currently held on this CPU.
///
/// A task holding any kernel lock must not voluntarily yield; the scheduler
/// asserts on this counter.
static LOCKS_HELD: AtomicUsize = AtomicUsize::new(0);

/// Number of kernel spinlocks currently held.
pub fn held_lock_count() -> usize {
    LOCKS_HELD.load(Ordering::Relaxed)
}

/// A spin::Mutex that disables interrupts while held and restores the
/// previous interrupt flag on release.
pub struct IrqSpinlock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock, saving the interrupt flag.
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let were_enabled = interrupts::are_enabled();
        if were_enabled {
            interrupts::disable();
        }
        let guard = self.inner.lock();
        LOCKS_HELD.fetch_add(1, Ordering::Relaxed);
        IrqSpinlockGuard {
            guard: Some(guard),
            reenable: were_enabled,
        }
    }
}

/// Guard returned by [`IrqSpinlock::lock`]. Dropping it releases the lock
/// and restores the saved interrupt flag.
pub struct IrqSpinlockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    reenable: bool,
}

impl<T> core::ops::Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard taken")
    }
}

impl<T> core::ops::DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard taken")
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the mutex before re-enabling interrupts, otherwise an
        // interrupt arriving in between could spin on a lock we still hold.
        self.guard.take();
        LOCKS_HELD.fetch_sub(1, Ordering::Relaxed);
        if self.reenable {
            interrupts::enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_spinlock_basic() {
        let lock = IrqSpinlock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test_case]
    fn test_spinlock_held_count() {
        let lock = IrqSpinlock::new(());
        let before = held_lock_count();
        let guard = lock.lock();
        assert_eq!(held_lock_count(), before + 1);
        drop(guard);
        assert_eq!(held_lock_count(), before);
    }
}
