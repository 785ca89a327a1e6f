//! Service registry, inboxes, and message delivery.

use alloc::{
    collections::{BTreeMap, VecDeque},
    string::String,
    sync::Arc,
    vec::Vec,
};

use super::message::{AmcMessage, AMC_MAX_SERVICE_NAME_LEN, AMC_MESSAGE_PAYLOAD_SIZE};
use crate::{
    error::{AmcError, KernelResult},
    sched::{self, BlockReason, TaskId, TaskPtr, UnblockReason},
    sync::IrqSpinlock,
};

/// The kernel's own service; messages addressed here are interpreted as
/// core commands.
pub const CORE_SERVICE_NAME: &str = "com.axle.core";

/// Kernel reaper; receives a nudge per exited task.
pub const REAPER_SERVICE_NAME: &str = "com.axle.reaper";

/// Userland crash reporter; receives fault records.
pub const CRASH_REPORTER_SERVICE_NAME: &str = "com.axle.crash_reporter";

/// Per-service inbox depth cap. A send to a full inbox is dropped rather
/// than letting a pathological sender exhaust the kernel heap.
pub const MAX_INBOX_DEPTH: usize = 4096;

/// A frame sitting in an inbox, tagged with its interned source name so
/// await filters can match without chasing the header pointer.
pub struct QueuedMessage {
    pub source: &'static str,
    pub frame: AmcMessage,
}

/// A registered named endpoint.
pub struct AmcService {
    pub name: &'static str,
    pub task: TaskPtr,
    pub task_id: TaskId,
    /// FIFO of received frames; its own lock so delivery does not hold the
    /// registry lock.
    pub inbox: IrqSpinlock<VecDeque<QueuedMessage>>,
}

/// Registry of live services by canonical name.
static SERVICES: IrqSpinlock<BTreeMap<&'static str, Arc<AmcService>>> =
    IrqSpinlock::new(BTreeMap::new());

/// Which service each task owns (a task holds at most one registration).
static TASK_SERVICE: IrqSpinlock<BTreeMap<u32, &'static str>> = IrqSpinlock::new(BTreeMap::new());

/// Messages sent by `core` to services that have not registered yet,
/// delivered when the registration arrives. Only core gets this grace.
static UNDELIVERED: IrqSpinlock<Vec<(&'static str, QueuedMessage)>> = IrqSpinlock::new(Vec::new());

/// Death-notification interest: target service -> observer service names.
static DEATH_OBSERVERS: IrqSpinlock<BTreeMap<&'static str, Vec<&'static str>>> =
    IrqSpinlock::new(BTreeMap::new());

/// Interned service names. Names are leaked NUL-terminated copies so frame
/// headers can carry stable pointers for the life of the system.
static INTERNED_NAMES: IrqSpinlock<BTreeMap<String, &'static str>> =
    IrqSpinlock::new(BTreeMap::new());

/// Intern `name`, returning the stable copy. The backing storage is
/// NUL-terminated for the benefit of the C-shaped frame header.
pub fn intern_name(name: &str) -> &'static str {
    let mut table = INTERNED_NAMES.lock();
    if let Some(interned) = table.get(name) {
        return *interned;
    }
    let mut storage = Vec::with_capacity(name.len() + 1);
    storage.extend_from_slice(name.as_bytes());
    storage.push(0);
    let leaked: &'static [u8] = Vec::leak(storage);
    // The prefix is the bytes of `name`, valid UTF-8 by construction.
    let interned = core::str::from_utf8(&leaked[..name.len()]).expect("interned name is utf-8");
    table.insert(String::from(name), interned);
    interned
}

/// The name pointer a frame header carries for `name`.
fn name_ptr(name: &'static str) -> u64 {
    name.as_ptr() as u64
}

fn valid_service_name(name: &str) -> bool {
    !name.is_empty() && name.len() < AMC_MAX_SERVICE_NAME_LEN
}

/// Bind the calling task to `name`.
///
/// Fails if the name is taken, the name is invalid, or the task already
/// owns a registration; the syscall layer kills the offender on failure.
pub fn register_service_for_current(name: &str) -> KernelResult<()> {
    if !valid_service_name(name) {
        return Err(AmcError::InvalidName.into());
    }
    let task = sched::current_task();
    // SAFETY: reading identity fields of our own TCB.
    let task_id = unsafe { task.get() }.id;

    let interned = intern_name(name);
    {
        let mut task_service = TASK_SERVICE.lock();
        if task_service.contains_key(&task_id.0) {
            return Err(AmcError::AlreadyRegistered.into());
        }
        let mut services = SERVICES.lock();
        if services.contains_key(interned) {
            return Err(AmcError::NameInUse.into());
        }
        services.insert(
            interned,
            Arc::new(AmcService {
                name: interned,
                task,
                task_id,
                inbox: IrqSpinlock::new(VecDeque::new()),
            }),
        );
        task_service.insert(task_id.0, interned);
    }

    // Deliver anything core sent before this service existed.
    let pending: Vec<QueuedMessage> = {
        let mut undelivered = UNDELIVERED.lock();
        let mut taken = Vec::new();
        let mut i = 0;
        while i < undelivered.len() {
            if undelivered[i].0 == interned {
                taken.push(undelivered.remove(i).1);
            } else {
                i += 1;
            }
        }
        taken
    };
    if let Some(service) = service_named(interned) {
        let mut inbox = service.inbox.lock();
        for msg in pending {
            inbox.push_back(msg);
        }
    }

    log::info!("amc: task {} registered service {}", task_id.0, name);
    Ok(())
}

/// Look up a live service.
pub fn service_named(name: &str) -> Option<Arc<AmcService>> {
    SERVICES.lock().get(name).cloned()
}

/// The service name owned by the calling task, if any.
pub fn current_service_name() -> Option<&'static str> {
    let task = sched::current_task();
    // SAFETY: reading identity fields of our own TCB.
    let task_id = unsafe { task.get() }.id;
    TASK_SERVICE.lock().get(&task_id.0).copied()
}

/// Deliver one frame from `source` to `dest`. Returns whether the frame
/// was routed.
///
/// Frames addressed to `com.axle.core` are interpreted inline in the
/// sender's context rather than queued.
pub fn deliver(source: &'static str, dest: &str, body: &[u8]) -> bool {
    if body.len() > AMC_MESSAGE_PAYLOAD_SIZE {
        return false;
    }

    if dest == CORE_SERVICE_NAME {
        super::core_commands::handle(source, body);
        return true;
    }

    let Some(service) = service_named(dest) else {
        // Early boot: core may message services that have not come up yet.
        if source == CORE_SERVICE_NAME {
            let interned_dest = intern_name(dest);
            let frame = AmcMessage::new(name_ptr(source), name_ptr(interned_dest), body);
            UNDELIVERED.lock().push((
                interned_dest,
                QueuedMessage {
                    source,
                    frame,
                },
            ));
            return true;
        }
        return false;
    };

    let frame = AmcMessage::new(name_ptr(source), name_ptr(service.name), body);
    {
        let mut inbox = service.inbox.lock();
        if inbox.len() >= MAX_INBOX_DEPTH {
            log::warn!("amc: inbox of {} full, dropping frame from {}", dest, source);
            return false;
        }
        inbox.push_back(QueuedMessage { source, frame });
    }
    sched::unblock_task(service.task, UnblockReason::AmcMessage);
    true
}

/// Send from the calling task's service. Returns false if the caller has
/// not registered, the destination is unknown, or the body is oversized.
pub fn send_from_current(dest: &str, body: &[u8]) -> bool {
    let Some(source) = current_service_name() else {
        return false;
    };
    deliver(source, dest, body)
}

/// Send a frame as `com.axle.core`.
pub fn core_send(dest: &str, body: &[u8]) -> bool {
    deliver(intern_name(CORE_SERVICE_NAME), dest, body)
}

/// Broadcast from the calling task's service: the frame lands in the inbox
/// of every service whose task is currently blocked awaiting a message.
pub fn broadcast_from_current(body: &[u8]) {
    let Some(source) = current_service_name() else {
        return;
    };
    if body.len() > AMC_MESSAGE_PAYLOAD_SIZE {
        return;
    }

    let targets: Vec<Arc<AmcService>> = {
        let services = SERVICES.lock();
        services
            .values()
            .filter(|s| {
                if s.name == source {
                    return false;
                }
                // SAFETY: state reads race benignly with the scheduler; a
                // stale read only means a missed or extra delivery, which
                // broadcast semantics permit.
                let state = unsafe { s.task.get() }.state;
                matches!(
                    state,
                    crate::sched::TaskState::Blocked(mask) if mask.contains(BlockReason::AMC_AWAIT)
                )
            })
            .cloned()
            .collect()
    };

    for service in targets {
        // Broadcast frames carry a null destination pointer.
        let frame = AmcMessage::new(name_ptr(source), 0, body);
        {
            let mut inbox = service.inbox.lock();
            if inbox.len() >= MAX_INBOX_DEPTH {
                continue;
            }
            inbox.push_back(QueuedMessage { source, frame });
        }
        sched::unblock_task(service.task, UnblockReason::AmcMessage);
    }
}

/// What an await is willing to accept.
pub enum AwaitFilter<'a> {
    Any,
    FromService(&'a str),
    FromServices(&'a [&'a str]),
    U32Event { source: &'a str, event: u32 },
}

impl AwaitFilter<'_> {
    /// Whether a queued frame satisfies this filter.
    pub fn matches(&self, msg: &QueuedMessage) -> bool {
        match self {
            AwaitFilter::Any => true,
            AwaitFilter::FromService(name) => msg.source == *name,
            AwaitFilter::FromServices(names) => names.iter().any(|n| msg.source == *n),
            AwaitFilter::U32Event { source, event } => {
                msg.source == *source && msg.frame.event() == *event
            }
        }
    }
}

/// Block the calling task until a matching frame is in its inbox, then
/// remove and return it. Non-matching frames stay queued.
///
/// Interrupts stay disabled across the inbox check and the block so a
/// delivery sliding in between cannot be missed (its unblock would find
/// the task not yet blocked).
pub fn await_matching(filter: AwaitFilter) -> QueuedMessage {
    use x86_64::instructions::interrupts;

    let service = current_service_name()
        .and_then(service_named)
        .expect("await from a task with no registered service");

    let were_enabled = interrupts::are_enabled();
    loop {
        interrupts::disable();
        {
            let mut inbox = service.inbox.lock();
            if let Some(pos) = inbox.iter().position(|m| filter.matches(m)) {
                let msg = inbox.remove(pos).expect("position was just found");
                drop(inbox);
                if were_enabled {
                    interrupts::enable();
                }
                return msg;
            }
        }
        let _ = sched::block_current(BlockReason::AMC_AWAIT);
    }
}

/// Await any frame.
pub fn await_any() -> QueuedMessage {
    await_matching(AwaitFilter::Any)
}

/// Await a frame from a specific service.
pub fn await_from(source: &str) -> QueuedMessage {
    await_matching(AwaitFilter::FromService(source))
}

/// Await a frame from any of the listed services.
pub fn await_from_services(sources: &[&str]) -> QueuedMessage {
    await_matching(AwaitFilter::FromServices(sources))
}

/// Await a frame from `source` whose first u32 equals `event`. Other
/// frames remain queued.
pub fn await_u32_event(source: &str, event: u32) -> QueuedMessage {
    await_matching(AwaitFilter::U32Event { source, event })
}

/// Whether the calling task's inbox holds a frame from `source`.
pub fn has_message_from(source: &str) -> bool {
    current_service_name()
        .and_then(service_named)
        .map(|s| s.inbox.lock().iter().any(|m| m.source == source))
        .unwrap_or(false)
}

/// Whether the calling task's inbox holds any frame.
pub fn has_message() -> bool {
    current_service_name()
        .and_then(service_named)
        .map(|s| !s.inbox.lock().is_empty())
        .unwrap_or(false)
}

/// Record the calling service's interest in `target`'s death.
pub fn register_service_died_notification(target: &str) {
    let Some(observer) = current_service_name() else {
        return;
    };
    let target = intern_name(target);
    DEATH_OBSERVERS
        .lock()
        .entry(target)
        .or_default()
        .push(observer);
}

/// Discard every queued frame from `peer` in the calling service's inbox.
pub fn flush_messages_from(peer: &str) {
    if let Some(service) = current_service_name().and_then(service_named) {
        service.inbox.lock().retain(|m| m.source != peer);
    }
}

/// Event id of the service-died notification frame.
pub const AMC_SERVICE_DIED_NOTIFICATION: u32 = 1 << 9;

/// Tear down the message-bus state of a dying task: flush its inbox,
/// release its shared-memory regions, drop its registration, and notify
/// observers.
pub fn teardown_for_task(task: TaskPtr) {
    // SAFETY: the task is exiting (or being killed with its state frozen);
    // identity fields are stable.
    let task_id = unsafe { task.get() }.id;

    super::shared_memory::release_all_for_task(task);

    let name = {
        let mut task_service = TASK_SERVICE.lock();
        task_service.remove(&task_id.0)
    };
    let Some(name) = name else {
        return;
    };

    if let Some(service) = SERVICES.lock().remove(name) {
        service.inbox.lock().clear();
    }

    let observers = DEATH_OBSERVERS.lock().remove(name).unwrap_or_default();
    if !observers.is_empty() {
        let mut data = [0u8; AMC_MAX_SERVICE_NAME_LEN];
        let len = name.len().min(AMC_MAX_SERVICE_NAME_LEN - 1);
        data[..len].copy_from_slice(&name.as_bytes()[..len]);
        let body = super::message::command_body(
            AMC_SERVICE_DIED_NOTIFICATION,
            &data[..AMC_MESSAGE_PAYLOAD_SIZE - 4],
        );
        for observer in observers {
            let _ = core_send(observer, &body);
        }
    }

    log::info!("amc: service {} died", name);
}

/// Nudge the reaper service; queued by core if the reaper is not up yet.
pub fn notify_reaper() {
    let body = super::message::command_body(0, &[]);
    let _ = core_send(REAPER_SERVICE_NAME, &body);
}

/// Fault record sent to the crash reporter when a user task dies on a CPU
/// fault: event id, fault address, faulting rip, and the fault name as a
/// charlist tail.
pub const AMC_CRASH_REPORT: u32 = 1 << 12;

pub fn notify_crash_reporter(fault: &'static str, fault_addr: u64, rip: u64) {
    let mut data = [0u8; AMC_MESSAGE_PAYLOAD_SIZE - 4];
    data[..8].copy_from_slice(&fault_addr.to_le_bytes());
    data[8..16].copy_from_slice(&rip.to_le_bytes());
    let name_len = fault.len().min(data.len() - 17);
    data[16] = name_len as u8;
    data[17..17 + name_len].copy_from_slice(&fault.as_bytes()[..name_len]);
    let body = super::message::command_body(AMC_CRASH_REPORT, &data);
    let _ = core_send(CRASH_REPORTER_SERVICE_NAME, &body);
}

/// Snapshot of the registry for the copy-services-list response.
pub fn service_snapshot() -> Vec<(&'static str, u32)> {
    SERVICES
        .lock()
        .values()
        .map(|s| (s.name, s.inbox.lock().len() as u32))
        .collect()
}
