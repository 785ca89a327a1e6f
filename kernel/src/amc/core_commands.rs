//! Commands addressed to `com.axle.core`.
//!
//! The kernel interprets these inline, in the sending task's context. The
//! event ids and field orderings are ABI shared with userland; responses go
//! back as ordinary frames from `com.axle.core`.

use x86_64::VirtAddr;

use super::{
    message::{command_body, AMC_MAX_SERVICE_NAME_LEN},
    service, shared_memory,
};
use crate::{boot_info, mm, sched};

pub const AMC_COPY_SERVICES: u32 = 1 << 0;
pub const AMC_AWM_MAP_FRAMEBUFFER: u32 = 1 << 1;
pub const AMC_SLEEP_UNTIL_TIMESTAMP: u32 = 1 << 2;
pub const AMC_FILE_MANAGER_MAP_INITRD: u32 = 1 << 3;
pub const AMC_FILE_MANAGER_EXEC_BUFFER: u32 = 1 << 4;
pub const AMC_SHARED_MEMORY_DESTROY: u32 = 1 << 5;
pub const AMC_LAUNCH_SERVICE: u32 = 1 << 6;
pub const AMC_SYSTEM_PROFILE_REQUEST: u32 = 1 << 7;
pub const AMC_SLEEP_UNTIL_TIMESTAMP_OR_MESSAGE: u32 = 1 << 8;
pub const AMC_REGISTER_SERVICE_DIED_NOTIFICATIONS: u32 = 1 << 10;
pub const AMC_FLUSH_MESSAGES_TO_SERVICE: u32 = 1 << 11;
pub const AMC_ALLOC_PHYSICAL_RANGE: u32 = 1 << 13;

/// Per-service entry in the copy-services-list buffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AmcServiceDescription {
    pub service_name: [u8; AMC_MAX_SERVICE_NAME_LEN],
    pub unread_message_count: u32,
}

/// Header of the copy-services-list buffer; descriptions follow it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AmcServiceList {
    pub event: u32,
    pub service_count: u32,
}

/// Response frame for map-framebuffer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AmcFramebufferInfo {
    pub event: u32,
    pub typ: u32,
    pub address: u64,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub bytes_per_pixel: u32,
    pub size: u32,
}

/// Response frame for map-initrd.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AmcInitrdInfo {
    pub event: u32,
    pub pad: u32,
    pub initrd_start: u64,
    pub initrd_end: u64,
    pub initrd_size: u64,
}

/// Response frame for system-profile.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AmcSystemProfileResponse {
    pub event: u32,
    pub pmm_allocated: u32,
    pub kheap_allocated: u32,
}

/// View a POD response struct as bytes for the frame body.
fn struct_bytes<T>(value: &T) -> &[u8] {
    // SAFETY: T is a repr(C) plain-old-data response struct with explicit
    // padding; reading its bytes is well-defined.
    unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    }
}

fn body_u32(body: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&body[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn body_u64(body: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&body[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Read a NUL-terminated name embedded in a frame body.
fn body_name(body: &[u8], offset: usize) -> Option<&str> {
    let tail = &body[offset..];
    let len = tail.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&tail[..len]).ok()
}

/// Interpret one core command from `source`. Runs in the sender's context,
/// so user pointers in the request refer to the active address space.
pub fn handle(source: &'static str, body: &[u8]) {
    if body.len() < 4 {
        return;
    }
    let event = body_u32(body, 0);
    match event {
        AMC_COPY_SERVICES => copy_services(source),
        AMC_AWM_MAP_FRAMEBUFFER => map_framebuffer(source),
        AMC_SLEEP_UNTIL_TIMESTAMP => {
            if body.len() >= 16 {
                sched::sleep_until(body_u64(body, 8));
            }
        }
        AMC_FILE_MANAGER_MAP_INITRD => map_initrd(source),
        AMC_FILE_MANAGER_EXEC_BUFFER => exec_buffer(source, body),
        AMC_SHARED_MEMORY_DESTROY => {
            if body.len() >= 16 {
                let local_virt = body_u64(body, 8);
                shared_memory::release_by_addr(sched::current_task(), local_virt);
            }
        }
        AMC_LAUNCH_SERVICE => {
            if let Some(name) = body_name(body, 4) {
                launch_service(source, name);
            }
        }
        AMC_SYSTEM_PROFILE_REQUEST => system_profile(source),
        AMC_SLEEP_UNTIL_TIMESTAMP_OR_MESSAGE => {
            if body.len() >= 16 {
                let _ = sched::sleep_until_or_message(body_u64(body, 8));
            }
        }
        AMC_REGISTER_SERVICE_DIED_NOTIFICATIONS => {
            if let Some(target) = body_name(body, 4) {
                service::register_service_died_notification(target);
            }
        }
        AMC_FLUSH_MESSAGES_TO_SERVICE => {
            if let Some(peer) = body_name(body, 4) {
                service::flush_messages_from(peer);
            }
        }
        AMC_ALLOC_PHYSICAL_RANGE => {
            if body.len() >= 8 {
                alloc_physical_range(source, body_u32(body, 4) as usize);
            }
        }
        _ => {
            log::warn!("amc: unknown core command {:#x} from {}", event, source);
        }
    }
}

/// Copy the service list into a fresh user-mapped buffer and send its
/// location back. The list can exceed a frame, so the response frame
/// carries a pointer: {event, pad, buffer_virt, service_count}.
fn copy_services(source: &'static str) {
    let snapshot = service::service_snapshot();
    let buf_size = core::mem::size_of::<AmcServiceList>()
        + snapshot.len() * core::mem::size_of::<AmcServiceDescription>();
    let (_phys, virt) = shared_memory::create_single_owner(buf_size);

    // SAFETY: `virt` was just mapped writable in the active address space
    // with at least `buf_size` bytes.
    unsafe {
        let header = virt as *mut AmcServiceList;
        header.write(AmcServiceList {
            event: AMC_COPY_SERVICES,
            service_count: snapshot.len() as u32,
        });
        let entries = header.add(1) as *mut AmcServiceDescription;
        for (i, (name, unread)) in snapshot.iter().enumerate() {
            let mut desc = AmcServiceDescription {
                service_name: [0; AMC_MAX_SERVICE_NAME_LEN],
                unread_message_count: *unread,
            };
            let len = name.len().min(AMC_MAX_SERVICE_NAME_LEN - 1);
            desc.service_name[..len].copy_from_slice(&name.as_bytes()[..len]);
            entries.add(i).write(desc);
        }
    }

    let mut data = [0u8; 16];
    data[..4].copy_from_slice(&0u32.to_le_bytes()); // pad to 8-byte field alignment
    data[4..12].copy_from_slice(&virt.to_le_bytes());
    data[12..16].copy_from_slice(&(snapshot.len() as u32).to_le_bytes());
    let _ = service::core_send(source, &command_body(AMC_COPY_SERVICES, &data));
}

/// Map the framebuffer into the requester and describe its geometry.
fn map_framebuffer(source: &'static str) {
    let fb = boot_info::framebuffer();
    let task = sched::current_task();
    // SAFETY: mutating our own TCB (the requester is the current task).
    let (virt, space) = unsafe {
        let t = task.get();
        (t.take_shmem_window(fb.size as usize), t.address_space)
    };
    mm::vmm::map_region_at(
        &space,
        VirtAddr::new(virt),
        x86_64::PhysAddr::new(fb.base),
        fb.size as usize,
        mm::vmm::MappingFlags::UserRw,
    );

    let response = AmcFramebufferInfo {
        event: AMC_AWM_MAP_FRAMEBUFFER,
        typ: 0,
        address: virt,
        width: fb.width,
        height: fb.height,
        bits_per_pixel: fb.bits_per_pixel,
        bytes_per_pixel: fb.bytes_per_pixel,
        size: fb.size,
    };
    let _ = service::core_send(source, struct_bytes(&response));
}

/// Map the initrd read-only into the requester and describe its extent.
fn map_initrd(source: &'static str) {
    let (base, size) = boot_info::with(|b| (b.initrd_base, b.initrd_size));
    let task = sched::current_task();
    // SAFETY: mutating our own TCB.
    let (virt, space) = unsafe {
        let t = task.get();
        (t.take_shmem_window(size as usize), t.address_space)
    };
    mm::vmm::map_region_at(
        &space,
        VirtAddr::new(virt),
        x86_64::PhysAddr::new(base),
        size as usize,
        mm::vmm::MappingFlags::UserRo,
    );

    let response = AmcInitrdInfo {
        event: AMC_FILE_MANAGER_MAP_INITRD,
        pad: 0,
        initrd_start: virt,
        initrd_end: virt + size,
        initrd_size: size,
    };
    let _ = service::core_send(source, struct_bytes(&response));
}

/// Spawn a new program from an in-memory ELF image in the sender's space.
/// Request: {event, pad, program_name_ptr, buffer_ptr, buffer_size}.
fn exec_buffer(source: &'static str, body: &[u8]) {
    if body.len() < 28 {
        return;
    }
    let name_ptr = body_u64(body, 8);
    let buffer_ptr = body_u64(body, 16);
    let buffer_size = body_u32(body, 24) as usize;

    if !user_range_ok(name_ptr, 1) || !user_range_ok(buffer_ptr, buffer_size as u64) {
        log::warn!("amc: exec-buffer from {} with bad pointers", source);
        return;
    }

    // SAFETY: the sender's address space is active and the ranges were
    // bounds-checked against the user half; the name is capped below.
    let (name, image) = unsafe {
        let mut len = 0usize;
        while len < AMC_MAX_SERVICE_NAME_LEN {
            if *(name_ptr as *const u8).add(len) == 0 {
                break;
            }
            len += 1;
        }
        let name_bytes = core::slice::from_raw_parts(name_ptr as *const u8, len);
        let image = core::slice::from_raw_parts(buffer_ptr as *const u8, buffer_size);
        (core::str::from_utf8(name_bytes).unwrap_or("program"), image)
    };

    match crate::elf::spawn_from_buffer(name, image, &[name]) {
        Ok(id) => log::info!("amc: exec-buffer spawned {} as task {}", name, id.0),
        Err(e) => log::warn!("amc: exec-buffer of {} failed: {}", name, e),
    }
}

/// Launch a known program from the ramdisk on behalf of the requester.
/// Response: {event, launched: u32 (0/1)}.
fn launch_service(source: &'static str, name: &str) {
    let launched = match crate::initrd::file_named(name) {
        Some(image) => crate::elf::spawn_from_buffer(name, image, &[name]).is_ok(),
        None => false,
    };
    if !launched {
        log::warn!("amc: launch of {} requested by {} failed", name, source);
    }
    let _ = service::core_send(
        source,
        &command_body(AMC_LAUNCH_SERVICE, &(launched as u32).to_le_bytes()),
    );
}

/// Report memory pressure: bytes the PMM and heap have handed out.
fn system_profile(source: &'static str) {
    let response = AmcSystemProfileResponse {
        event: AMC_SYSTEM_PROFILE_REQUEST,
        pmm_allocated: mm::pmm::allocated_bytes() as u32,
        kheap_allocated: mm::heap::allocated_bytes() as u32,
    };
    let _ = service::core_send(source, struct_bytes(&response));
}

/// Hand the requester a contiguous physical range mapped into its space.
/// Response: {event, pad, phys_base, virt_base}.
fn alloc_physical_range(source: &'static str, size: usize) {
    if size == 0 {
        return;
    }
    let (phys, virt) = shared_memory::create_single_owner(size);
    let mut data = [0u8; 20];
    data[..4].copy_from_slice(&0u32.to_le_bytes());
    data[4..12].copy_from_slice(&phys.to_le_bytes());
    data[12..20].copy_from_slice(&virt.to_le_bytes());
    let _ = service::core_send(source, &command_body(AMC_ALLOC_PHYSICAL_RANGE, &data));
}

/// Whether `[ptr, ptr+len)` lies in the user half.
fn user_range_ok(ptr: u64, len: u64) -> bool {
    const USER_HALF_END: u64 = 0x8000_0000_0000;
    ptr != 0 && ptr.checked_add(len).map(|end| end <= USER_HALF_END) == Some(true)
}
