//! Boot smoke test: the test image comes up far enough to print and
//! allocate.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(axle_kernel::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use axle_kernel::serial_println;

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Basic Boot");
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    axle_kernel::test_panic_handler(info)
}

#[test_case]
fn test_println_does_not_hang() {
    serial_println!("output reaches the serial port");
}

#[test_case]
fn test_heap_allocation_works() {
    let v: alloc::vec::Vec<u32> = (0..512).collect();
    assert_eq!(v.iter().sum::<u32>(), 511 * 512 / 2);
}

#[test_case]
fn test_boxed_values_survive() {
    let b = alloc::boxed::Box::new(0xC0FFEEu32);
    assert_eq!(*b, 0xC0FFEE);
}
