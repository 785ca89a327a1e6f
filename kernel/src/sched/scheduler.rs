//! Core scheduler.
//!
//! Uniprocessor, preemptive. The timer tick drives quantum expiry; blocking
//! primitives move tasks between the run queues and the blocked state. The
//! scheduler lock is held only around queue and state manipulation, never
//! across a context switch.

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use x86_64::{instructions::interrupts, registers::control::Cr3};

use super::{
    queue::RunQueues,
    task::{BlockReason, PriorityClass, Task, TaskId, TaskPtr, TaskState, UnblockReason},
};
use crate::{
    arch::x86_64::{context, gdt, pit},
    mm::vmm,
    sync::IrqSpinlock,
};

struct Scheduler {
    current: Option<TaskPtr>,
    queues: RunQueues,
    /// Tasks blocked with a sleep deadline, re-checked every tick.
    sleepers: Vec<TaskPtr>,
}

static SCHEDULER: IrqSpinlock<Scheduler> = IrqSpinlock::new(Scheduler {
    current: None,
    queues: RunQueues::new(),
    sleepers: Vec::new(),
});

/// All live tasks by pid. The reaper removes entries.
static TASK_TABLE: IrqSpinlock<BTreeMap<u32, TaskPtr>> = IrqSpinlock::new(BTreeMap::new());

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Set once `start()` hands control to the first task; the timer ignores
/// ticks that arrive earlier.
static ONLINE: AtomicBool = AtomicBool::new(false);

/// Exited tasks awaiting the reaper.
static REAP_LIST: IrqSpinlock<Vec<TaskPtr>> = IrqSpinlock::new(Vec::new());

/// Monotonic milliseconds since boot.
pub fn ms_since_boot() -> u64 {
    pit::ms_since_boot()
}

/// Allocate a fresh pid.
pub fn alloc_task_id() -> TaskId {
    TaskId(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

/// Create the idle task. Called once, before `start()`.
pub fn init() {
    let idle = Box::new(Task::new(
        "idle",
        idle_entry,
        0,
        alloc_task_id(),
        vmm::kernel_space(),
        false,
        PriorityClass::Idle,
    ));
    let ptr = TaskPtr::from_boxed(idle);
    // SAFETY: freshly created task, no other references yet.
    let id = unsafe { ptr.get() }.id;
    TASK_TABLE.lock().insert(id.0, ptr);
    SCHEDULER.lock().queues.enqueue(PriorityClass::Idle, ptr);
}

extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        interrupts::enable_and_hlt();
    }
}

/// Register an already-built task (the ELF loader uses this for user
/// tasks) and make it runnable.
pub fn spawn_task(task: Box<Task>) -> TaskId {
    let ptr = TaskPtr::from_boxed(task);
    // SAFETY: freshly created task, no other references yet.
    let (id, class) = {
        let t = unsafe { ptr.get() };
        (t.id, t.priority)
    };
    TASK_TABLE.lock().insert(id.0, ptr);
    SCHEDULER.lock().queues.enqueue(class, ptr);
    id
}

/// Spawn a kernel task running `entry(arg)` in the kernel address space.
pub fn spawn_kernel_task(name: &str, entry: extern "C" fn(usize) -> !, arg: usize) -> TaskId {
    let task = Box::new(Task::new(
        name,
        entry,
        arg,
        alloc_task_id(),
        vmm::kernel_space(),
        false,
        PriorityClass::Normal,
    ));
    spawn_task(task)
}

/// Hand the CPU to the highest-priority runnable task, never returning.
/// The boot stack is abandoned; its context is parked in a scratch TCB slot
/// nobody will ever switch back to.
pub fn start() -> ! {
    interrupts::disable();

    let next = {
        let mut s = SCHEDULER.lock();
        let next = s.queues.pop_next().expect("no task to start into");
        // SAFETY: scheduler lock held.
        let next_t = unsafe { next.get() };
        next_t.state = TaskState::Running;
        next_t.quantum_remaining = next_t.priority.quantum_ticks();
        s.current = Some(next);
        next
    };

    ONLINE.store(true, Ordering::Release);

    // SAFETY: scheduler lock released; `next` was just marked current.
    let next_t = unsafe { next.get() };
    gdt::set_kernel_stack(next_t.kernel_stack_top());

    let mut boot_context = context::TaskContext::empty();
    // SAFETY: interrupts are disabled and next's context was primed by
    // Task::new. The boot context is never resumed.
    unsafe {
        context::switch_context(&mut boot_context, &next_t.context);
    }
    panic!("boot context resumed");
}

/// The currently running task.
pub fn current_task() -> TaskPtr {
    SCHEDULER
        .lock()
        .current
        .expect("scheduler has no current task")
}

/// Look up a live task by pid.
pub fn task_with_id(id: TaskId) -> Option<TaskPtr> {
    TASK_TABLE.lock().get(&id.0).copied()
}

/// Pick and switch to the next task. Interrupts must be disabled; the
/// scheduler lock must not be held.
fn schedule_inner() {
    debug_assert!(!interrupts::are_enabled());

    let mut switch_args = None;
    {
        let mut s = SCHEDULER.lock();
        let cur = s.current.expect("schedule with no current task");
        // SAFETY: scheduler lock held.
        let cur_t = unsafe { cur.get() };

        let next = match s.queues.pop_next() {
            Some(n) => n,
            None => {
                // Nothing else runnable. The idle task is always enqueued
                // when not running, so this can only mean current == idle
                // or current is the sole runnable task.
                assert!(
                    cur_t.state == TaskState::Running,
                    "no runnable task and current cannot continue"
                );
                return;
            }
        };

        if cur_t.state == TaskState::Running {
            cur_t.state = TaskState::Runnable;
            s.queues.enqueue(cur_t.priority, cur);
        }

        // SAFETY: scheduler lock held.
        let next_t = unsafe { next.get() };
        next_t.state = TaskState::Running;
        next_t.quantum_remaining = next_t.priority.quantum_ticks();
        s.current = Some(next);

        switch_args = Some((
            &mut cur_t.context as *mut context::TaskContext,
            &next_t.context as *const context::TaskContext,
            next_t.address_space,
            next_t.kernel_stack_top(),
        ));
    }

    if let Some((old, new, space, kernel_stack_top)) = switch_args {
        gdt::set_kernel_stack(kernel_stack_top);
        let (active_root, _) = Cr3::read();
        if active_root.start_address() != space.root {
            vmm::activate(&space);
        }
        // SAFETY: interrupts disabled; both contexts are owned by live TCBs
        // and the outgoing task resumes here when rescheduled.
        unsafe {
            context::switch_context(old, new);
        }
    }
}

/// Cooperatively rotate to the tail of the current class's queue.
pub fn yield_now() {
    debug_assert_eq!(
        crate::sync::held_lock_count(),
        0,
        "voluntary yield while holding a kernel lock"
    );
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    schedule_inner();
    if were_enabled {
        interrupts::enable();
    }
}

/// Block the current task until an event matching `reasons` arrives.
/// Returns the reason the task was woken.
pub fn block_current(reasons: BlockReason) -> UnblockReason {
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    {
        let s = SCHEDULER.lock();
        let cur = s.current.expect("block with no current task");
        // SAFETY: scheduler lock held.
        let cur_t = unsafe { cur.get() };
        cur_t.state = TaskState::Blocked(reasons);
    }
    schedule_inner();

    // Woken: consume the reason recorded by unblock.
    let reason = {
        let s = SCHEDULER.lock();
        let cur = s.current.expect("woken task is not current");
        // SAFETY: scheduler lock held.
        let cur_t = unsafe { cur.get() };
        cur_t
            .unblock_reason
            .take()
            .expect("woken without an unblock reason")
    };
    if were_enabled {
        interrupts::enable();
    }
    reason
}

/// Wake `task` if it is blocked for a reason `reason` satisfies; otherwise
/// a no-op. Returns whether the task was made runnable.
fn unblock_locked(s: &mut Scheduler, task: TaskPtr, reason: UnblockReason) -> bool {
    // SAFETY: scheduler lock held by caller.
    let t = unsafe { task.get() };
    match t.state {
        TaskState::Blocked(mask) if reason.satisfies(mask) => {
            t.state = TaskState::Runnable;
            t.unblock_reason = Some(reason);
            t.sleep_deadline = None;
            s.queues.enqueue(t.priority, task);
            true
        }
        _ => false,
    }
}

/// Wake `task` and preempt the current task if the woken one outranks it.
pub fn unblock_task(task: TaskPtr, reason: UnblockReason) {
    let mut preempt = false;
    {
        let mut s = SCHEDULER.lock();
        if unblock_locked(&mut s, task, reason) {
            // SAFETY: scheduler lock held.
            let woken_class = unsafe { task.get() }.priority;
            if let Some(cur) = s.current {
                // SAFETY: scheduler lock held.
                let cur_class = unsafe { cur.get() }.priority;
                preempt = priority_rank(woken_class) > priority_rank(cur_class);
            }
        }
    }
    if preempt && ONLINE.load(Ordering::Acquire) {
        let were_enabled = interrupts::are_enabled();
        interrupts::disable();
        schedule_inner();
        if were_enabled {
            interrupts::enable();
        }
    }
}

fn priority_rank(class: PriorityClass) -> u8 {
    match class {
        PriorityClass::Idle => 0,
        PriorityClass::Normal => 1,
        PriorityClass::Driver => 2,
    }
}

/// Block until `deadline_ms` (ms since boot). The task is runnable no
/// earlier than the deadline.
///
/// Interrupts stay disabled from the sleeper-list insert until the task is
/// marked blocked, so a tick cannot observe the half-registered sleeper.
pub fn sleep_until(deadline_ms: u64) {
    if deadline_ms <= ms_since_boot() {
        return;
    }
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    {
        let mut s = SCHEDULER.lock();
        let cur = s.current.expect("sleep with no current task");
        // SAFETY: scheduler lock held.
        let cur_t = unsafe { cur.get() };
        cur_t.sleep_deadline = Some(deadline_ms);
        s.sleepers.push(cur);
    }
    let _ = block_current(BlockReason::SLEEP);
    if were_enabled {
        interrupts::enable();
    }
}

/// As `sleep_until`, but an arriving AMC message also wakes the task.
/// Returns the wake reason so the caller can tell which happened.
pub fn sleep_until_or_message(deadline_ms: u64) -> UnblockReason {
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    {
        let mut s = SCHEDULER.lock();
        let cur = s.current.expect("sleep with no current task");
        // SAFETY: scheduler lock held.
        let cur_t = unsafe { cur.get() };
        cur_t.sleep_deadline = Some(deadline_ms);
        s.sleepers.push(cur);
    }
    let reason = block_current(BlockReason::SLEEP | BlockReason::AMC_AWAIT);
    if were_enabled {
        interrupts::enable();
    }
    reason
}

/// Timer-tick hook: wake due sleepers, charge the running task's quantum,
/// and preempt on expiry. Runs in interrupt context.
pub fn timer_tick(now_ms: u64) {
    if !ONLINE.load(Ordering::Acquire) {
        return;
    }

    let mut need_resched = false;
    {
        let mut s = SCHEDULER.lock();

        // Allocation-free sweep: this runs in interrupt context.
        let mut i = 0;
        while i < s.sleepers.len() {
            let t = s.sleepers[i];
            // SAFETY: scheduler lock held.
            let task = unsafe { t.get() };
            match (task.state, task.sleep_deadline) {
                (TaskState::Blocked(mask), Some(deadline))
                    if mask.contains(BlockReason::SLEEP) =>
                {
                    if deadline <= now_ms {
                        s.sleepers.swap_remove(i);
                        unblock_locked(&mut s, t, UnblockReason::SleepElapsed);
                    } else {
                        i += 1;
                    }
                }
                // Woken early (message) or killed; drop the entry
                _ => {
                    s.sleepers.swap_remove(i);
                }
            }
        }

        if let Some(cur) = s.current {
            // SAFETY: scheduler lock held.
            let cur_t = unsafe { cur.get() };
            cur_t.quantum_remaining = cur_t.quantum_remaining.saturating_sub(1);
            need_resched = cur_t.quantum_remaining == 0;
        }
    }

    if need_resched {
        schedule_inner();
    }
}

/// Terminate the calling task. Flushes its message-bus state, hands the
/// corpse to the reaper, and switches away for good.
pub fn exit_current(code: i32) -> ! {
    let cur = current_task();

    crate::amc::teardown_for_task(cur);
    crate::adi::release_for_task(cur);

    {
        // SAFETY: current task mutating its own TCB fields that only the
        // reaper reads after the final switch.
        let t = unsafe { cur.get() };
        t.exit_code = Some(code);
        log::info!("task {} ({}) exited with code {}", t.id.0, t.name, code);
    }

    REAP_LIST.lock().push(cur);
    crate::amc::notify_reaper();

    interrupts::disable();
    {
        let _guard = SCHEDULER.lock();
        // SAFETY: scheduler lock held.
        let t = unsafe { cur.get() };
        t.state = TaskState::Exited;
    }
    schedule_inner();
    unreachable!("exited task was rescheduled");
}

/// Kill another task. It is pulled out of any queues and wait lists before
/// its resources are released.
pub fn kill_task(id: TaskId) -> crate::error::KernelResult<()> {
    use crate::error::SchedError;

    let Some(ptr) = task_with_id(id) else {
        return Err(SchedError::TaskNotFound { pid: id.0 }.into());
    };
    let is_current = {
        let s = SCHEDULER.lock();
        s.current == Some(ptr)
    };
    if is_current {
        exit_current(-1);
    }

    {
        let mut s = SCHEDULER.lock();
        // SAFETY: scheduler lock held.
        let t = unsafe { ptr.get() };
        if t.state == TaskState::Exited {
            // Already on its way to the reaper
            return Err(SchedError::WrongState.into());
        }
        s.queues.remove(ptr);
        s.sleepers.retain(|t| *t != ptr);
        t.state = TaskState::Exited;
        t.exit_code = Some(-1);
    }

    crate::amc::teardown_for_task(ptr);
    crate::adi::release_for_task(ptr);

    REAP_LIST.lock().push(ptr);
    crate::amc::notify_reaper();
    Ok(())
}

/// Terminate the current task after a user-mode CPU fault, notifying the
/// crash reporter service first.
pub fn fault_current_task(fault: &'static str, fault_addr: u64, rip: u64) -> ! {
    {
        let cur = current_task();
        // SAFETY: reading our own TCB name.
        let t = unsafe { cur.get() };
        log::error!(
            "task {} ({}): {} at {:#x}, rip {:#x}",
            t.id.0,
            t.name,
            fault,
            fault_addr,
            rip
        );
    }
    crate::amc::notify_crash_reporter(fault, fault_addr, rip);
    exit_current(-1)
}

/// Reaper: frees TCBs and address spaces of exited tasks. Runs as a kernel
/// task in the kernel address space; the exit path posts it a message per
/// corpse.
pub extern "C" fn reaper_entry(_arg: usize) -> ! {
    crate::amc::register_service_for_current(crate::amc::REAPER_SERVICE_NAME)
        .expect("reaper service registration failed");
    loop {
        let _ = crate::amc::await_any();
        loop {
            let corpse = REAP_LIST.lock().pop();
            match corpse {
                Some(ptr) => reap(ptr),
                None => break,
            }
        }
    }
}

fn reap(ptr: TaskPtr) {
    // SAFETY: the task is Exited and off every queue; the reaper holds the
    // only path to it now.
    let task = unsafe { ptr.into_boxed() };
    TASK_TABLE.lock().remove(&task.id.0);
    if task.owns_address_space {
        vmm::destroy_address_space(task.address_space);
    }
    log::debug!("reaped task {} ({})", task.id.0, task.name);
    drop(task);
}
