//! Ramdisk archive parsing tests.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(axle_kernel::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::vec::Vec;

use axle_kernel::{
    error::InitrdError,
    initrd::{parse, INITRD_HEADER_MAGIC, MAX_INITRD_FILES},
};

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("Initrd");
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    axle_kernel::test_panic_handler(info)
}

const FILE_HEADER_SIZE: usize = 76;
const OFFSET_FIELD: usize = 68;
const LENGTH_FIELD: usize = 72;

/// Build an archive whose files contain their own names as data.
fn build_archive(names: &[&str]) -> Vec<u8> {
    let dir_size = 4 + MAX_INITRD_FILES * FILE_HEADER_SIZE;
    let mut data = alloc::vec![0u8; dir_size];
    data[..4].copy_from_slice(&(names.len() as u32).to_le_bytes());

    for (i, name) in names.iter().enumerate() {
        let base = 4 + i * FILE_HEADER_SIZE;
        data[base] = INITRD_HEADER_MAGIC;
        data[base + 1..base + 1 + name.len()].copy_from_slice(name.as_bytes());
        let offset = data.len() as u32;
        data[base + OFFSET_FIELD..base + OFFSET_FIELD + 4].copy_from_slice(&offset.to_le_bytes());
        data[base + LENGTH_FIELD..base + LENGTH_FIELD + 4]
            .copy_from_slice(&(name.len() as u32).to_le_bytes());
        data.extend_from_slice(name.as_bytes());
    }
    data
}

#[test_case]
fn test_boot_services_archive() {
    // The archive shape the bootstrap task expects to find
    let data = build_archive(&["file_manager", "awm", "kb_driver", "mouse_driver"]);
    let files = parse(&data).unwrap();
    assert_eq!(files.len(), 4);
    for (file, name) in files
        .iter()
        .zip(["file_manager", "awm", "kb_driver", "mouse_driver"])
    {
        assert_eq!(file.name, name);
        assert_eq!(file.length as usize, name.len());
    }
}

#[test_case]
fn test_empty_archive() {
    let data = build_archive(&[]);
    assert!(parse(&data).unwrap().is_empty());
}

#[test_case]
fn test_sixty_four_file_cap() {
    let mut data = build_archive(&[]);
    data[..4].copy_from_slice(&65u32.to_le_bytes());
    assert_eq!(parse(&data), Err(InitrdError::TooManyFiles));
}

#[test_case]
fn test_corrupt_header_magic() {
    let mut data = build_archive(&["awm"]);
    data[4] = 0x00;
    assert_eq!(parse(&data), Err(InitrdError::BadMagic));
}

#[test_case]
fn test_file_data_out_of_bounds() {
    let mut data = build_archive(&["awm"]);
    let base = 4;
    data[base + OFFSET_FIELD..base + OFFSET_FIELD + 4]
        .copy_from_slice(&(data.len() as u32).to_le_bytes());
    data[base + LENGTH_FIELD..base + LENGTH_FIELD + 4].copy_from_slice(&16u32.to_le_bytes());
    assert_eq!(parse(&data), Err(InitrdError::FileOutOfBounds));
}
