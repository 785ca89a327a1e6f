//! Boot-ordered global singletons.
//!
//! Several subsystems keep one process-wide record that comes alive at a
//! fixed point in the boot sequence and is never torn down: the boot-info
//! copy, the kernel address space, the mounted ramdisk. `GlobalState`
//! holds such a record behind a spinlock. `init` stores it exactly once;
//! later callers reach it only through closures, so a lock guard can never
//! escape the critical section. Access before `init` is visible to the
//! caller (`with` yields `None`) instead of being undefined, which makes a
//! wrong boot ordering show up as a clean panic at the call site.

use spin::Mutex;

/// A write-once global slot. Empty until `init`, then immutable ownership
/// of one `T` for the rest of the system's life.
pub struct GlobalState<T> {
    slot: Mutex<Option<T>>,
}

// No manual Send/Sync needed: the spinlock serializes every access, so the
// auto traits derived from `Mutex<Option<T>>` are exactly right.

impl<T> GlobalState<T> {
    /// An empty slot, usable in statics.
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store the singleton.
    ///
    /// A second call is a boot-ordering bug; the value is handed back so
    /// the caller can decide whether to panic.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot.lock();
        match *slot {
            Some(_) => Err(value),
            None => {
                *slot = Some(value);
                Ok(())
            }
        }
    }

    /// Run `f` against the stored value. `None` if `init` has not run.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slot.lock().as_ref().map(f)
    }

    /// As [`with`](Self::with), but with mutable access.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.slot.lock().as_mut().map(f)
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_second_init_is_rejected() {
        let state = GlobalState::new();
        assert_eq!(state.with(|v: &u32| *v), None);

        assert!(state.init(42u32).is_ok());
        // The losing value comes back to the caller
        assert_eq!(state.init(7), Err(7));
        assert_eq!(state.with(|v| *v), Some(42));
    }

    #[test_case]
    fn test_mutation_through_closure() {
        let state = GlobalState::new();
        assert!(state.init(1u64).is_ok());

        assert_eq!(state.with_mut(|v| {
            *v += 10;
            *v
        }), Some(11));
        assert_eq!(state.with(|v| *v), Some(11));
    }
}
