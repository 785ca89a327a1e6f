//! Scheduler tests: MLFQ ordering, block-reason matching, TCB setup.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(axle_kernel::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::boxed::Box;

use axle_kernel::{
    mm::vmm::{AddrSpaceId, AddressSpace},
    sched::{
        queue::RunQueues, BlockReason, PriorityClass, Task, TaskId, TaskPtr, UnblockReason,
    },
};
use x86_64::PhysAddr;

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Scheduler");
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    axle_kernel::test_panic_handler(info)
}

extern "C" fn dummy_entry(_arg: usize) -> ! {
    unreachable!("test tasks never run");
}

fn make_task(id: u32, class: PriorityClass) -> TaskPtr {
    let space = AddressSpace {
        id: AddrSpaceId(0),
        root: PhysAddr::new(0),
    };
    TaskPtr::from_boxed(Box::new(Task::new(
        "sched-test",
        dummy_entry,
        0,
        TaskId(id),
        space,
        false,
        class,
    )))
}

fn free_task(ptr: TaskPtr) {
    // SAFETY: test-local task with no other outstanding references.
    unsafe {
        drop(ptr.into_boxed());
    }
}

#[test_case]
fn test_driver_outranks_normal_outranks_idle() {
    let mut q = RunQueues::new();
    let idle = make_task(1, PriorityClass::Idle);
    let normal = make_task(2, PriorityClass::Normal);
    let driver = make_task(3, PriorityClass::Driver);

    // Enqueue lowest first to prove order is by class, not arrival
    q.enqueue(PriorityClass::Idle, idle);
    q.enqueue(PriorityClass::Normal, normal);
    q.enqueue(PriorityClass::Driver, driver);

    assert_eq!(q.pop_next(), Some(driver));
    assert_eq!(q.pop_next(), Some(normal));
    assert_eq!(q.pop_next(), Some(idle));

    for t in [idle, normal, driver] {
        free_task(t);
    }
}

#[test_case]
fn test_quantum_expiry_rotates_within_class() {
    let mut q = RunQueues::new();
    let a = make_task(10, PriorityClass::Normal);
    let b = make_task(11, PriorityClass::Normal);
    let c = make_task(12, PriorityClass::Normal);

    q.enqueue(PriorityClass::Normal, a);
    q.enqueue(PriorityClass::Normal, b);
    q.enqueue(PriorityClass::Normal, c);

    // Simulate three quantum expiries: each runner goes to the tail
    for expected in [a, b, c, a] {
        let picked = q.pop_next().unwrap();
        assert_eq!(picked, expected);
        q.enqueue(PriorityClass::Normal, picked);
    }

    q.remove(a);
    q.remove(b);
    q.remove(c);
    for t in [a, b, c] {
        free_task(t);
    }
}

#[test_case]
fn test_compound_block_reason_wakes_on_either() {
    let mask = BlockReason::IRQ_WAIT | BlockReason::AMC_AWAIT;
    assert!(UnblockReason::Irq.satisfies(mask));
    assert!(UnblockReason::AmcMessage.satisfies(mask));
    assert!(!UnblockReason::SleepElapsed.satisfies(mask));
}

#[test_case]
fn test_sleep_or_message_mask() {
    let mask = BlockReason::SLEEP | BlockReason::AMC_AWAIT;
    assert!(UnblockReason::SleepElapsed.satisfies(mask));
    assert!(UnblockReason::AmcMessage.satisfies(mask));
    assert!(!UnblockReason::Irq.satisfies(mask));
}

#[test_case]
fn test_kernel_stack_is_aligned() {
    let ptr = make_task(20, PriorityClass::Normal);
    // SAFETY: exclusive test-local access.
    let task = unsafe { ptr.get() };
    assert_eq!(task.kernel_stack_top() % 16, 0);
    // The primed context points into the stack, below the top
    assert!(task.context.rsp < task.kernel_stack_top());
    assert!(task.context.rsp > task.kernel_stack_top() - 128);
    free_task(ptr);
}

#[test_case]
fn test_driver_quantum_is_shorter() {
    assert!(PriorityClass::Driver.quantum_ticks() < PriorityClass::Normal.quantum_ticks());
    assert_eq!(PriorityClass::Idle.quantum_ticks(), 1);
}
