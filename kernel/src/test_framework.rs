//! No-std test framework.
//!
//! Tests run inside QEMU: results go to the serial port and the run ends
//! through the isa-debug-exit device. Both the library's `#[cfg(test)]`
//! modules and the integration test binaries under `tests/` use this
//! runner.

use core::{
    panic::PanicInfo,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{serial_print, serial_println};

/// Backing storage for the test heap; tests allocate without bringing up
/// the PMM/VMM.
const TEST_HEAP_SIZE: usize = 1024 * 1024;

#[repr(align(16))]
struct TestHeapStorage([u8; TEST_HEAP_SIZE]);

static mut TEST_HEAP: TestHeapStorage = TestHeapStorage([0; TEST_HEAP_SIZE]);
static TEST_HEAP_READY: AtomicBool = AtomicBool::new(false);

/// Point the kernel heap at a static region so test code can allocate.
/// Idempotent; called from every test entry point.
pub fn init_test_heap() {
    if TEST_HEAP_READY.swap(true, Ordering::SeqCst) {
        return;
    }
    let base = &raw mut TEST_HEAP;
    // SAFETY: the static region is reserved for the heap and this runs
    // once, before any allocation.
    unsafe {
        crate::allocator().init_raw(base as *mut u8, TEST_HEAP_SIZE);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Trait that all testable functions implement.
pub trait Testable {
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

/// Run every collected test and exit QEMU with the aggregate result.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    serial_println!("\nAll tests passed");
    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for test binaries: report and fail the run.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed);
}

/// Exit QEMU through the isa-debug-exit device.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    // SAFETY: port 0xf4 is QEMU's debug exit device; the write terminates
    // the VM, so nothing after it executes.
    unsafe {
        use x86_64::instructions::port::Port;
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
    // If the exit device is absent (running outside QEMU), hang instead of
    // returning into the test harness.
    crate::arch::halt();
}
