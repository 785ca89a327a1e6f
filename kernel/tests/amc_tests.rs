//! AMC message-bus tests: frame layout, filter matching, and per-pair
//! ordering semantics.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(axle_kernel::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::collections::VecDeque;

use axle_kernel::amc::{
    message::{command_body, AmcMessage},
    service::{intern_name, AwaitFilter, QueuedMessage},
    AMC_MESSAGE_PAYLOAD_SIZE, AMC_MESSAGE_SIZE,
};

#[path = "common/mod.rs"]
mod common;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    common::init_test_env("AMC");
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    axle_kernel::test_panic_handler(info)
}

fn queued(source: &'static str, body: &[u8]) -> QueuedMessage {
    QueuedMessage {
        source,
        frame: AmcMessage::new(source.as_ptr() as u64, 0, body),
    }
}

#[test_case]
fn test_every_frame_is_64_bytes() {
    assert_eq!(core::mem::size_of::<AmcMessage>(), AMC_MESSAGE_SIZE);
    let msg = AmcMessage::new(0, 0, &[1, 2, 3]);
    assert_eq!(msg.as_bytes().len(), 64);
}

#[test_case]
fn test_payload_roundtrip() {
    let payload = [0x5Au8; AMC_MESSAGE_PAYLOAD_SIZE];
    let msg = AmcMessage::new(0, 0, &payload);
    assert_eq!(msg.body, payload);
}

#[test_case]
fn test_interning_is_stable_and_deduplicated() {
    let a = intern_name("svc.interning");
    let b = intern_name("svc.interning");
    assert_eq!(a, "svc.interning");
    assert_eq!(a.as_ptr(), b.as_ptr());
}

#[test_case]
fn test_filter_from_service() {
    let a = intern_name("svc.a");
    let b = intern_name("svc.b");
    let msg = queued(a, &[0]);
    assert!(AwaitFilter::FromService("svc.a").matches(&msg));
    assert!(!AwaitFilter::FromService("svc.b").matches(&msg));
    assert!(AwaitFilter::FromServices(&["svc.b", "svc.a"]).matches(&msg));
    assert!(AwaitFilter::Any.matches(&queued(b, &[0])));
}

#[test_case]
fn test_u32_event_filter_selects_without_discarding() {
    // Three command frames with event ids 1, 2, 3; an await for id 2 must
    // take exactly the middle one and leave the others queued.
    let src = intern_name("svc.events");
    let mut inbox: VecDeque<QueuedMessage> = VecDeque::new();
    for event in 1..=3u32 {
        inbox.push_back(queued(src, &command_body(event, &[])));
    }

    let filter = AwaitFilter::U32Event {
        source: "svc.events",
        event: 2,
    };
    let pos = inbox
        .iter()
        .position(|m| filter.matches(m))
        .expect("matching frame queued");
    let taken = inbox.remove(pos).unwrap();

    assert_eq!(taken.frame.event(), 2);
    assert_eq!(inbox.len(), 2);
    assert_eq!(inbox[0].frame.event(), 1);
    assert_eq!(inbox[1].frame.event(), 3);
}

#[test_case]
fn test_per_pair_fifo_order() {
    // Frames from one sender stay in send order even with interleaved
    // traffic from another sender.
    let a = intern_name("svc.first");
    let b = intern_name("svc.second");
    let mut inbox: VecDeque<QueuedMessage> = VecDeque::new();
    inbox.push_back(queued(a, &command_body(10, &[])));
    inbox.push_back(queued(b, &command_body(99, &[])));
    inbox.push_back(queued(a, &command_body(11, &[])));

    let filter = AwaitFilter::FromService("svc.first");
    let mut seen = alloc::vec::Vec::new();
    while let Some(pos) = inbox.iter().position(|m| filter.matches(m)) {
        seen.push(inbox.remove(pos).unwrap().frame.event());
    }
    assert_eq!(seen, alloc::vec![10, 11]);
}

#[test_case]
fn test_charlist_body() {
    let mut body = [0u8; AMC_MESSAGE_PAYLOAD_SIZE];
    body[0] = 5;
    body[1..6].copy_from_slice(b"hello");
    let msg = AmcMessage::new(0, 0, &body);
    assert_eq!(msg.charlist(), b"hello");
}
