//! AMC -- Axle Message Channels.
//!
//! The kernel's IPC layer: named services, fixed 64-byte message frames,
//! per-service inboxes, asynchronous sends, blocking awaits with filters,
//! shared-memory regions, and a core command protocol for the services the
//! kernel itself provides.

pub mod core_commands;
pub mod message;
pub mod service;
pub mod shared_memory;

pub use message::{AmcMessage, AMC_MAX_SERVICE_NAME_LEN, AMC_MESSAGE_PAYLOAD_SIZE, AMC_MESSAGE_SIZE};
pub use service::{
    await_any, await_from, await_from_services, await_matching, await_u32_event,
    broadcast_from_current, core_send, current_service_name, flush_messages_from, has_message,
    has_message_from, notify_crash_reporter, notify_reaper, register_service_for_current,
    send_from_current, service_named, teardown_for_task, AwaitFilter, QueuedMessage,
    CORE_SERVICE_NAME, CRASH_REPORTER_SERVICE_NAME, MAX_INBOX_DEPTH, REAPER_SERVICE_NAME,
};

/// Nothing to construct eagerly: the registry statics are const-built. The
/// init hook exists for boot-ordering symmetry and the log line.
pub fn init() {
    service::intern_name(CORE_SERVICE_NAME);
    log::info!("amc: message bus online");
}
