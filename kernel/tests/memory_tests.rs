//! Physical-memory and heap tests.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(axle_kernel::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use axle_kernel::mm::{page_ceil, page_floor, pmm::FrameBitmap, PAGE_SIZE};

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Memory");
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    axle_kernel::test_panic_handler(info)
}

// Small instance: 256 words x 64 frames = 64 MiB of coverage.
type TestBitmap = FrameBitmap<256>;

fn bitmap_with_frames(start: u64, count: usize) -> TestBitmap {
    let mut b = TestBitmap::new();
    for i in 0..count {
        b.push_allocatable(start + (i * PAGE_SIZE) as u64);
    }
    b
}

#[test_case]
fn test_frames_start_reserved() {
    let b = TestBitmap::new();
    assert!(b.is_allocated(0x0));
    assert!(b.is_allocated(0x100_0000));
    assert_eq!(b.free_frames(), 0);
}

#[test_case]
fn test_alloc_allocates_and_free_frees() {
    let mut b = bitmap_with_frames(0x100_0000, 16);
    let frame = b.alloc().unwrap();
    assert!(b.is_allocated(frame));
    assert_eq!(b.free_frames(), 15);
    b.free(frame);
    assert!(!b.is_allocated(frame));
    assert_eq!(b.free_frames(), 16);
}

#[test_case]
fn test_accounting_invariant() {
    // allocated bytes + free frames always cover the usable pool
    let mut b = bitmap_with_frames(0x100_0000, 32);
    for _ in 0..5 {
        let _ = b.alloc().unwrap();
    }
    assert_eq!(b.allocated_bytes() as usize / PAGE_SIZE, 5);
    assert_eq!(b.free_frames(), 27);
}

#[test_case]
fn test_contiguous_allocation_is_contiguous() {
    let mut b = bitmap_with_frames(0x200_0000, 64);
    let base = b.alloc_contiguous(8).unwrap();
    for i in 0..8 {
        assert!(b.is_allocated(base + (i * PAGE_SIZE) as u64));
    }
    // And it fails when no run is long enough
    let mut sparse = bitmap_with_frames(0x280_0000, 4);
    assert!(sparse.alloc_contiguous(8).is_none());
}

#[test_case]
fn test_alloc_at_requested_address() {
    let mut b = bitmap_with_frames(0x300_0000, 8);
    assert_eq!(b.alloc_at(0x300_2000), Some(0x300_2000));
    assert_eq!(b.alloc_at(0x300_2000), None);
}

#[test_case]
fn test_page_rounding_helpers() {
    assert_eq!(page_floor(0x1FFF), 0x1000);
    assert_eq!(page_ceil(0x1001), 0x2000);
    assert_eq!(page_ceil(page_floor(0x5000)), 0x5000);
}

#[test_case]
fn test_heap_handles_mixed_sizes() {
    let mut blocks = alloc::vec::Vec::new();
    for size in [8usize, 64, 512, 4096] {
        blocks.push(alloc::vec![0xA5u8; size]);
    }
    for (i, block) in blocks.iter().enumerate() {
        assert!(block.iter().all(|&b| b == 0xA5), "block {} corrupted", i);
    }
}
