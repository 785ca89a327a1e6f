//! Syscall gateway.
//!
//! User code raises `int 0x80` with the call number in RAX and up to five
//! arguments in RDI, RSI, RDX, RCX, R8; the return value comes back in
//! RAX. A naked stub snapshots the interrupted registers so ordinary
//! handlers can read their arguments and `task_assert` can dump the whole
//! register file. Unknown call numbers return -1.

use alloc::string::String;
use core::arch::naked_asm;

use x86_64::instructions::interrupts;

use crate::{
    adi, amc,
    amc::message::AMC_MESSAGE_PAYLOAD_SIZE,
    sched,
};

pub const SYS_AMC_REGISTER_SERVICE: u64 = 0;
pub const SYS_AMC_MESSAGE_SEND: u64 = 1;
pub const SYS_AMC_MESSAGE_AWAIT: u64 = 2;
pub const SYS_AMC_MESSAGE_AWAIT_FROM_SERVICES: u64 = 3;
pub const SYS_AMC_MESSAGE_AWAIT_ANY: u64 = 4;
pub const SYS_AMC_AWAIT_U32_EVENT: u64 = 5;
pub const SYS_AMC_HAS_MESSAGE_FROM: u64 = 6;
pub const SYS_AMC_HAS_MESSAGE: u64 = 7;
pub const SYS_AMC_MESSAGE_BROADCAST: u64 = 8;
pub const SYS_AMC_SHARED_MEMORY_CREATE: u64 = 9;
pub const SYS_ADI_REGISTER_DRIVER: u64 = 10;
pub const SYS_ADI_EVENT_AWAIT: u64 = 11;
pub const SYS_ADI_SEND_EOI: u64 = 12;
pub const SYS_GETPID: u64 = 13;
pub const SYS_MS_SINCE_BOOT: u64 = 14;
pub const SYS_EXIT: u64 = 15;
pub const SYS_YIELD: u64 = 16;
pub const SYS_TASK_ASSERT: u64 = 17;
pub const SYS_KILL: u64 = 18;

/// Register snapshot captured by the entry stub, in push order, followed
/// by the hardware interrupt frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    // Hardware-pushed interrupt frame
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Entry stub installed at vector 0x80 (DPL 3).
///
/// Pushes the general-purpose registers over the hardware frame, hands the
/// resulting `SyscallFrame` to the dispatcher, restores everything, and
/// iretqs back to the caller.
#[unsafe(naked)]
pub extern "C" fn syscall_entry_stub() {
    naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "iretq",
        dispatch = sym syscall_dispatch,
    );
}

/// Kind of handler an entry holds: most see only their arguments; a few
/// (task_assert) also get the full interrupted register snapshot.
enum Handler {
    Plain(fn(u64, u64, u64, u64, u64) -> i64),
    WithFrame(fn(&SyscallFrame, u64, u64, u64, u64, u64) -> i64),
}

struct SyscallEntry {
    name: &'static str,
    handler: Handler,
}

/// The dispatch table, indexed by call number.
static SYSCALL_TABLE: [Option<SyscallEntry>; 19] = [
    Some(SyscallEntry {
        name: "amc_register_service",
        handler: Handler::Plain(sys_amc_register_service),
    }),
    Some(SyscallEntry {
        name: "amc_message_send",
        handler: Handler::Plain(sys_amc_message_send),
    }),
    Some(SyscallEntry {
        name: "amc_message_await",
        handler: Handler::Plain(sys_amc_message_await),
    }),
    Some(SyscallEntry {
        name: "amc_message_await_from_services",
        handler: Handler::Plain(sys_amc_message_await_from_services),
    }),
    Some(SyscallEntry {
        name: "amc_message_await_any",
        handler: Handler::Plain(sys_amc_message_await_any),
    }),
    Some(SyscallEntry {
        name: "amc_await_u32_event",
        handler: Handler::Plain(sys_amc_await_u32_event),
    }),
    Some(SyscallEntry {
        name: "amc_has_message_from",
        handler: Handler::Plain(sys_amc_has_message_from),
    }),
    Some(SyscallEntry {
        name: "amc_has_message",
        handler: Handler::Plain(sys_amc_has_message),
    }),
    Some(SyscallEntry {
        name: "amc_message_broadcast",
        handler: Handler::Plain(sys_amc_message_broadcast),
    }),
    Some(SyscallEntry {
        name: "amc_shared_memory_create",
        handler: Handler::Plain(sys_amc_shared_memory_create),
    }),
    Some(SyscallEntry {
        name: "adi_register_driver",
        handler: Handler::Plain(sys_adi_register_driver),
    }),
    Some(SyscallEntry {
        name: "adi_event_await",
        handler: Handler::Plain(sys_adi_event_await),
    }),
    Some(SyscallEntry {
        name: "adi_send_eoi",
        handler: Handler::Plain(sys_adi_send_eoi),
    }),
    Some(SyscallEntry {
        name: "getpid",
        handler: Handler::Plain(sys_getpid),
    }),
    Some(SyscallEntry {
        name: "ms_since_boot",
        handler: Handler::Plain(sys_ms_since_boot),
    }),
    Some(SyscallEntry {
        name: "exit",
        handler: Handler::Plain(sys_exit),
    }),
    Some(SyscallEntry {
        name: "yield",
        handler: Handler::Plain(sys_yield),
    }),
    Some(SyscallEntry {
        name: "task_assert",
        handler: Handler::WithFrame(sys_task_assert),
    }),
    Some(SyscallEntry {
        name: "kill",
        handler: Handler::Plain(sys_kill),
    }),
];

pub fn init() {
    log::info!("syscall: {} entries at vector 0x80", SYSCALL_TABLE.len());
}

/// Rust side of the entry stub.
extern "C" fn syscall_dispatch(frame: &mut SyscallFrame) {
    // The interrupt gate cleared IF; syscalls may block or run long, so
    // let the timer keep preempting us.
    interrupts::enable();

    let number = frame.rax;
    let (a, b, c, d, e) = (frame.rdi, frame.rsi, frame.rdx, frame.rcx, frame.r8);

    let result = match SYSCALL_TABLE.get(number as usize).and_then(Option::as_ref) {
        Some(entry) => {
            log::trace!("syscall {}({:#x}, {:#x}, ...)", entry.name, a, b);
            match entry.handler {
                Handler::Plain(f) => f(a, b, c, d, e),
                Handler::WithFrame(f) => f(frame, a, b, c, d, e),
            }
        }
        None => {
            log::warn!("syscall: unknown call number {}", number);
            -1
        }
    };

    frame.rax = result as u64;
    interrupts::disable();
}

// ---------------------------------------------------------------------------
// User-pointer access
// ---------------------------------------------------------------------------

const USER_HALF_END: u64 = 0x8000_0000_0000;

fn user_range_ok(ptr: u64, len: u64) -> bool {
    ptr != 0 && ptr.checked_add(len).map(|end| end <= USER_HALF_END) == Some(true)
}

/// Copy a NUL-terminated string out of the caller's address space.
fn copy_user_str(ptr: u64, max_len: usize) -> Option<String> {
    if !user_range_ok(ptr, 1) {
        return None;
    }
    let mut bytes = alloc::vec::Vec::new();
    for i in 0..max_len as u64 {
        if !user_range_ok(ptr + i, 1) {
            return None;
        }
        // SAFETY: the address is within the user half of the active space;
        // a fault here is caught by the page-fault handler, which kills the
        // calling task.
        let byte = unsafe { *((ptr + i) as *const u8) };
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).ok()
}

/// Borrow a byte range of the caller's address space.
fn user_slice<'a>(ptr: u64, len: usize) -> Option<&'a [u8]> {
    if !user_range_ok(ptr, len as u64) {
        return None;
    }
    // SAFETY: range-checked against the user half; valid for the duration
    // of the syscall since the caller is suspended in it.
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len) })
}

/// Write `bytes` into the caller's address space.
fn copy_to_user(ptr: u64, bytes: &[u8]) -> bool {
    if !user_range_ok(ptr, bytes.len() as u64) {
        return false;
    }
    // SAFETY: range-checked; a fault kills the caller.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
    }
    true
}

fn deliver_frame_to_user(out_ptr: u64, msg: &amc::QueuedMessage) -> i64 {
    if copy_to_user(out_ptr, msg.frame.as_bytes()) {
        0
    } else {
        -1
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn sys_amc_register_service(name_ptr: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    let Some(name) = copy_user_str(name_ptr, amc::AMC_MAX_SERVICE_NAME_LEN) else {
        return -1;
    };
    match amc::register_service_for_current(&name) {
        Ok(()) => 0,
        Err(e) => {
            // A conflicting registration is a protocol violation; the
            // offender does not get to continue.
            log::warn!("amc: register_service({}) failed: {}", name, e);
            sched::exit_current(-1);
        }
    }
}

fn sys_amc_message_send(dest_ptr: u64, body_ptr: u64, len: u64, _d: u64, _e: u64) -> i64 {
    let Some(dest) = copy_user_str(dest_ptr, amc::AMC_MAX_SERVICE_NAME_LEN) else {
        return 0;
    };
    if len as usize > AMC_MESSAGE_PAYLOAD_SIZE {
        return 0;
    }
    let Some(body) = user_slice(body_ptr, len as usize) else {
        return 0;
    };
    amc::send_from_current(&dest, body) as i64
}

fn sys_amc_message_await(source_ptr: u64, out_ptr: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    let Some(source) = copy_user_str(source_ptr, amc::AMC_MAX_SERVICE_NAME_LEN) else {
        return -1;
    };
    let msg = amc::await_from(&source);
    deliver_frame_to_user(out_ptr, &msg)
}

fn sys_amc_message_await_from_services(
    count: u64,
    names_ptr: u64,
    out_ptr: u64,
    _d: u64,
    _e: u64,
) -> i64 {
    const MAX_AWAIT_SOURCES: u64 = 16;
    if count == 0 || count > MAX_AWAIT_SOURCES {
        return -1;
    }
    // names_ptr points at an array of `count` user string pointers.
    let mut names = alloc::vec::Vec::with_capacity(count as usize);
    for i in 0..count {
        let slot = names_ptr + i * 8;
        if !user_range_ok(slot, 8) {
            return -1;
        }
        // SAFETY: range-checked read of one user pointer.
        let str_ptr = unsafe { *(slot as *const u64) };
        match copy_user_str(str_ptr, amc::AMC_MAX_SERVICE_NAME_LEN) {
            Some(name) => names.push(name),
            None => return -1,
        }
    }
    let name_refs: alloc::vec::Vec<&str> = names.iter().map(String::as_str).collect();
    let msg = amc::await_from_services(&name_refs);
    deliver_frame_to_user(out_ptr, &msg)
}

fn sys_amc_message_await_any(out_ptr: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    let msg = amc::await_any();
    deliver_frame_to_user(out_ptr, &msg)
}

fn sys_amc_await_u32_event(source_ptr: u64, event: u64, out_ptr: u64, _d: u64, _e: u64) -> i64 {
    let Some(source) = copy_user_str(source_ptr, amc::AMC_MAX_SERVICE_NAME_LEN) else {
        return -1;
    };
    let msg = amc::await_u32_event(&source, event as u32);
    deliver_frame_to_user(out_ptr, &msg)
}

fn sys_amc_has_message_from(source_ptr: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    match copy_user_str(source_ptr, amc::AMC_MAX_SERVICE_NAME_LEN) {
        Some(source) => amc::has_message_from(&source) as i64,
        None => 0,
    }
}

fn sys_amc_has_message(_a: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    amc::has_message() as i64
}

fn sys_amc_message_broadcast(body_ptr: u64, len: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    if len as usize > AMC_MESSAGE_PAYLOAD_SIZE {
        return 0;
    }
    let Some(body) = user_slice(body_ptr, len as usize) else {
        return 0;
    };
    amc::broadcast_from_current(body);
    0
}

fn sys_amc_shared_memory_create(
    remote_ptr: u64,
    size: u64,
    out_local: u64,
    out_remote: u64,
    _e: u64,
) -> i64 {
    let Some(remote) = copy_user_str(remote_ptr, amc::AMC_MAX_SERVICE_NAME_LEN) else {
        return -1;
    };
    match amc::shared_memory::create(&remote, size as usize) {
        Ok((local_virt, remote_virt)) => {
            if copy_to_user(out_local, &local_virt.to_le_bytes())
                && copy_to_user(out_remote, &remote_virt.to_le_bytes())
            {
                0
            } else {
                -1
            }
        }
        Err(e) => {
            log::warn!("amc: shared_memory_create({}) failed: {}", remote, e);
            -1
        }
    }
}

fn sys_adi_register_driver(name_ptr: u64, vector: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    let Some(name) = copy_user_str(name_ptr, amc::AMC_MAX_SERVICE_NAME_LEN) else {
        return -1;
    };
    match adi::register_driver(&name, vector as u32) {
        Ok(()) => 0,
        Err(e) => {
            log::warn!("adi: register_driver({}, {}) failed: {}", name, vector, e);
            -1
        }
    }
}

fn sys_adi_event_await(vector: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    match adi::event_await(vector as u32) {
        Ok(was_irq) => was_irq as i64,
        Err(_) => -1,
    }
}

fn sys_adi_send_eoi(vector: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    match adi::send_eoi(vector as u32) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_kill(pid: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    match sched::kill_task(crate::sched::TaskId(pid as u32)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_getpid(_a: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    let task = sched::current_task();
    // SAFETY: reading our own TCB id.
    unsafe { task.get() }.id.0 as i64
}

fn sys_ms_since_boot(_a: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    sched::ms_since_boot() as i64
}

fn sys_exit(code: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    sched::exit_current(code as i32)
}

fn sys_yield(_a: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    sched::yield_now();
    0
}

/// Failed assertion in user code: print the message and the interrupted
/// register file, then kill the caller.
fn sys_task_assert(frame: &SyscallFrame, msg_ptr: u64, _b: u64, _c: u64, _d: u64, _e: u64) -> i64 {
    let msg = copy_user_str(msg_ptr, 256).unwrap_or_default();
    let task = sched::current_task();
    // SAFETY: reading our own TCB identity.
    let (id, name) = {
        let t = unsafe { task.get() };
        (t.id.0, t.name.clone())
    };
    println!("task {} ({}) assertion failed: {}", id, name, msg);
    println!(
        "rip {:#018x} rsp {:#018x} rflags {:#x}",
        frame.rip, frame.rsp, frame.rflags
    );
    println!(
        "rax {:#018x} rbx {:#018x} rcx {:#018x} rdx {:#018x}",
        frame.rax, frame.rbx, frame.rcx, frame.rdx
    );
    println!(
        "rsi {:#018x} rdi {:#018x} rbp {:#018x} r8  {:#018x}",
        frame.rsi, frame.rdi, frame.rbp, frame.r8
    );
    println!(
        "r9  {:#018x} r10 {:#018x} r11 {:#018x} r12 {:#018x}",
        frame.r9, frame.r10, frame.r11, frame.r12
    );
    println!(
        "r13 {:#018x} r14 {:#018x} r15 {:#018x}",
        frame.r13, frame.r14, frame.r15
    );
    sched::exit_current(-1)
}
