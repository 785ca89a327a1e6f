//! Kernel entry point.
//!
//! The bootloader maps the kernel into the upper half, builds the
//! full-physical-memory window, and jumps here with a pointer to the
//! handoff record in the first argument register. Init composes the
//! subsystems in dependency order and hands control to the scheduler;
//! the bootstrap task takes it from there.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use axle_kernel::{
    arch,
    boot_info::{self, AxleBootInfo},
    bootstrap, logger, mm, println, sched,
};

#[no_mangle]
pub extern "C" fn _start(boot_info_ptr: *const AxleBootInfo) -> ! {
    logger::init();
    println!("axle kernel v{}", env!("CARGO_PKG_VERSION"));

    // SAFETY: the bootloader guarantees a valid handoff record at this
    // address.
    unsafe {
        boot_info::init(boot_info_ptr);
    }

    arch::x86_64::init();
    mm::init();

    // Kernel code, heap range, and the physical window are all mapped; from
    // here every new address space shares the kernel half by reference.
    mm::vmm::notify_shared_kernel_memory_allocated();

    sched::init();
    sched::spawn_kernel_task("bootstrap", bootstrap::bootstrap_entry, 0);

    // Transfers onto the bootstrap task's stack; never returns.
    sched::start()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    arch::halt();
}
