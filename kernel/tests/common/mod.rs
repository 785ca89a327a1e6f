//! Shared setup for integration test binaries.

use axle_kernel::{serial_println, test_framework};

/// Announce the suite and point the kernel heap at the static test region.
pub fn init_test_env(suite: &str) {
    test_framework::init_test_heap();
    serial_println!("\n=== {} Test Suite ===", suite);
}
