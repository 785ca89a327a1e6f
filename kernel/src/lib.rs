//! axle kernel library.
//!
//! The kernel proper: physical and virtual memory management, the MLFQ
//! scheduler, AMC message channels, the ADI driver interface, the ELF
//! loader, and the syscall gateway. The binary entry point lives in
//! `main.rs`; this library exports everything it composes, plus the pieces
//! the integration tests exercise.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

// Host builds (unit-test coverage runs) use the system allocator; bare
// metal uses the kernel heap.
#[cfg(not(target_os = "none"))]
extern crate std;

use mm::heap::KernelHeap;

#[cfg_attr(all(target_arch = "x86_64", target_os = "none"), global_allocator)]
static ALLOCATOR: KernelHeap = KernelHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// The kernel heap instance (also reachable when it is not the registered
/// global allocator, e.g. on host test builds).
pub fn allocator() -> &'static KernelHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod adi;
pub mod amc;
pub mod arch;
pub mod boot_info;
pub mod bootstrap;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod initrd;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod test_framework;

// Re-exports for tests and the binary
pub use error::{KernelError, KernelResult};
pub use sched::{BlockReason, PriorityClass, Task, TaskId, UnblockReason};
pub use test_framework::{exit_qemu, test_panic_handler, QemuExitCode, Testable};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_framework::init_test_heap();
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure is unrecoverable by design; there is no demand
/// paging or swap to fall back on.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
