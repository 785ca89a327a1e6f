//! Multi-level feedback queues.
//!
//! One FIFO per priority class. The scheduler always serves the head of
//! the highest non-empty queue; quantum expiry rotates a task to the tail
//! of its own class.

use alloc::collections::VecDeque;

use super::task::{PriorityClass, TaskPtr};

pub struct RunQueues {
    driver: VecDeque<TaskPtr>,
    normal: VecDeque<TaskPtr>,
    idle: VecDeque<TaskPtr>,
}

impl RunQueues {
    pub const fn new() -> Self {
        Self {
            driver: VecDeque::new(),
            normal: VecDeque::new(),
            idle: VecDeque::new(),
        }
    }

    fn queue_mut(&mut self, class: PriorityClass) -> &mut VecDeque<TaskPtr> {
        match class {
            PriorityClass::Driver => &mut self.driver,
            PriorityClass::Normal => &mut self.normal,
            PriorityClass::Idle => &mut self.idle,
        }
    }

    /// Append to the tail of the class's FIFO.
    pub fn enqueue(&mut self, class: PriorityClass, task: TaskPtr) {
        self.queue_mut(class).push_back(task);
    }

    /// Pop the head of the highest-priority non-empty queue.
    pub fn pop_next(&mut self) -> Option<TaskPtr> {
        self.driver
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.idle.pop_front())
    }

    /// Drop a task from whichever queue holds it (used when a queued task
    /// is killed or its priority class changes).
    pub fn remove(&mut self, task: TaskPtr) {
        for queue in [&mut self.driver, &mut self.normal, &mut self.idle] {
            queue.retain(|t| *t != task);
        }
    }

    pub fn runnable_count(&self) -> usize {
        self.driver.len() + self.normal.len() + self.idle.len()
    }
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::{
        mm::vmm::{AddrSpaceId, AddressSpace},
        sched::task::{Task, TaskId},
    };
    use x86_64::PhysAddr;

    extern "C" fn dummy_entry(_arg: usize) -> ! {
        unreachable!("queue test tasks never run");
    }

    fn make_task(id: u32, class: PriorityClass) -> TaskPtr {
        let space = AddressSpace {
            id: AddrSpaceId(0),
            root: PhysAddr::new(0),
        };
        TaskPtr::from_boxed(Box::new(Task::new(
            "queue-test",
            dummy_entry,
            0,
            TaskId(id),
            space,
            false,
            class,
        )))
    }

    fn free_task(ptr: TaskPtr) {
        // SAFETY: test-local task; no other references remain.
        unsafe {
            drop(ptr.into_boxed());
        }
    }

    #[test_case]
    fn test_priority_order() {
        let mut q = RunQueues::new();
        let idle = make_task(1, PriorityClass::Idle);
        let normal = make_task(2, PriorityClass::Normal);
        let driver = make_task(3, PriorityClass::Driver);

        q.enqueue(PriorityClass::Idle, idle);
        q.enqueue(PriorityClass::Normal, normal);
        q.enqueue(PriorityClass::Driver, driver);

        // Driver before normal before idle, regardless of insertion order
        assert_eq!(q.pop_next(), Some(driver));
        assert_eq!(q.pop_next(), Some(normal));
        assert_eq!(q.pop_next(), Some(idle));
        assert_eq!(q.pop_next(), None);

        for t in [idle, normal, driver] {
            free_task(t);
        }
    }

    #[test_case]
    fn test_fifo_within_class() {
        let mut q = RunQueues::new();
        let a = make_task(1, PriorityClass::Normal);
        let b = make_task(2, PriorityClass::Normal);

        q.enqueue(PriorityClass::Normal, a);
        q.enqueue(PriorityClass::Normal, b);
        assert_eq!(q.pop_next(), Some(a));

        // Rotation: a goes to the tail, b now runs first
        q.enqueue(PriorityClass::Normal, a);
        assert_eq!(q.pop_next(), Some(b));
        assert_eq!(q.pop_next(), Some(a));

        for t in [a, b] {
            free_task(t);
        }
    }

    #[test_case]
    fn test_remove() {
        let mut q = RunQueues::new();
        let a = make_task(1, PriorityClass::Normal);
        let b = make_task(2, PriorityClass::Normal);

        q.enqueue(PriorityClass::Normal, a);
        q.enqueue(PriorityClass::Normal, b);
        q.remove(a);
        assert_eq!(q.runnable_count(), 1);
        assert_eq!(q.pop_next(), Some(b));

        for t in [a, b] {
            free_task(t);
        }
    }
}
