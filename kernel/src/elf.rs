//! ELF64 program loader.
//!
//! Validates a static x86_64 executable, maps its PT_LOAD segments into a
//! freshly created address space, builds the user stack with argv, and
//! produces a task whose first run drops to Ring 3 at the entry point.

use alloc::boxed::Box;
use core::mem;

use x86_64::VirtAddr;

use crate::{
    arch::x86_64::usermode,
    error::{ElfError, KernelResult},
    mm::{page_ceil, page_floor, phys_to_virt, vmm, PAGE_SIZE},
    sched::{self, PriorityClass, Task, TaskId},
};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub osabi: u8,
    pub abiversion: u8,
    pub pad: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version2: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ELF_VERSION_CURRENT: u8 = 1;
const EM_X86_64: u16 = 0x3E;
const ET_EXEC: u16 = 2;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;

/// Top of the user stack; the single committed stack page sits below it.
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;

/// Validate the image and return its header.
///
/// Only static x86_64 little-endian executables are accepted; dynamic and
/// relocatable objects are rejected.
pub fn validate_header(image: &[u8]) -> Result<Elf64Header, ElfError> {
    if image.len() < mem::size_of::<Elf64Header>() {
        return Err(ElfError::Truncated);
    }

    // SAFETY: length checked; Elf64Header is repr(C) plain old data and
    // read_unaligned tolerates the buffer's arbitrary alignment.
    let header = unsafe { (image.as_ptr() as *const Elf64Header).read_unaligned() };

    if header.magic != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if header.class != ELF_CLASS_64
        || header.data != ELF_DATA_2LSB
        || header.version != ELF_VERSION_CURRENT
    {
        return Err(ElfError::UnsupportedClass);
    }
    if header.machine != EM_X86_64 {
        return Err(ElfError::UnsupportedMachine);
    }
    if header.elf_type != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    Ok(header)
}

/// The program headers of a validated image.
fn program_headers<'a>(
    image: &'a [u8],
    header: &Elf64Header,
) -> Result<impl Iterator<Item = Elf64ProgramHeader> + 'a, ElfError> {
    let ph_start = header.phoff as usize;
    let ph_size = header.phentsize as usize;
    let ph_count = header.phnum as usize;

    if ph_size < mem::size_of::<Elf64ProgramHeader>()
        || ph_start
            .checked_add(ph_size * ph_count)
            .map(|end| end > image.len())
            != Some(false)
    {
        return Err(ElfError::SegmentOutOfBounds);
    }

    Ok((0..ph_count).map(move |i| {
        // SAFETY: the range check above keeps every read inside `image`;
        // read_unaligned tolerates arbitrary file alignment.
        unsafe {
            (image.as_ptr().add(ph_start + i * ph_size) as *const Elf64ProgramHeader)
                .read_unaligned()
        }
    }))
}

/// Copy `bytes` into `space` at `vaddr` through the physical window.
/// Every touched page must already be mapped.
fn write_to_space(space: &vmm::AddressSpace, vaddr: u64, bytes: &[u8]) {
    let mut written = 0usize;
    while written < bytes.len() {
        let addr = vaddr + written as u64;
        let page_off = (addr % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(bytes.len() - written);
        let phys = vmm::phys_of(space, VirtAddr::new(addr))
            .expect("loader writing to an unmapped page");
        // SAFETY: phys resolves to a frame the loader just mapped; the
        // chunk stays within that frame.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(written),
                phys_to_virt(phys).as_mut_ptr::<u8>(),
                chunk,
            );
        }
        written += chunk;
    }
}

/// Map and populate one PT_LOAD segment.
fn load_segment(
    space: &vmm::AddressSpace,
    image: &[u8],
    seg: &Elf64ProgramHeader,
) -> Result<(), ElfError> {
    if seg.filesz > seg.memsz {
        return Err(ElfError::InvalidSegment);
    }
    let file_end = seg
        .offset
        .checked_add(seg.filesz)
        .ok_or(ElfError::SegmentOutOfBounds)?;
    if file_end > image.len() as u64 {
        return Err(ElfError::SegmentOutOfBounds);
    }

    let map_start = page_floor(seg.vaddr);
    let map_end = page_ceil(seg.vaddr + seg.memsz);

    // Writable data is user-RW; code is user-RX; read-only data user-RO.
    // The VMM zeroes the fresh frames, which covers the BSS tail.
    let flags = if seg.flags & PF_W != 0 {
        vmm::MappingFlags::UserRw
    } else if seg.flags & PF_X != 0 {
        vmm::MappingFlags::UserRx
    } else {
        vmm::MappingFlags::UserRo
    };

    // Adjacent segments may share a page after rounding; pages an earlier
    // segment already mapped keep their mapping.
    let mut page = map_start;
    while page < map_end {
        let vaddr = VirtAddr::new(page);
        if vmm::phys_of(space, vaddr).is_none() {
            vmm::map_region(space, vaddr, PAGE_SIZE, flags);
        }
        page += PAGE_SIZE as u64;
    }

    let src = &image[seg.offset as usize..file_end as usize];
    write_to_space(space, seg.vaddr, src);
    Ok(())
}

/// Lay out the user stack: argv strings at the top of the stack page, the
/// NULL-terminated pointer array below them, argc below that. Returns the
/// initial user RSP (16-byte aligned, pointing at argc).
fn build_user_stack(space: &vmm::AddressSpace, argv: &[&str]) -> u64 {
    let stack_page = USER_STACK_TOP - PAGE_SIZE as u64;
    vmm::map_region(
        space,
        VirtAddr::new(stack_page),
        PAGE_SIZE,
        vmm::MappingFlags::UserRw,
    );

    // Copy strings top-down, remembering each one's user address.
    let mut cursor = USER_STACK_TOP;
    let mut string_ptrs = alloc::vec::Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        cursor -= arg.len() as u64 + 1;
        write_to_space(space, cursor, arg.as_bytes());
        write_to_space(space, cursor + arg.len() as u64, &[0]);
        string_ptrs.push(cursor);
    }
    string_ptrs.reverse();

    // Pointer array (argv[argc] = NULL), then argc, with the final RSP
    // 16-byte aligned.
    cursor &= !0xF;
    let words = argv.len() as u64 + 2; // pointers + NULL + argc
    cursor -= words * 8;
    if (cursor / 8) % 2 != 0 {
        cursor -= 8;
    }

    let mut frame = alloc::vec::Vec::with_capacity(words as usize * 8);
    frame.extend_from_slice(&(argv.len() as u64).to_le_bytes());
    for ptr in &string_ptrs {
        frame.extend_from_slice(&ptr.to_le_bytes());
    }
    frame.extend_from_slice(&0u64.to_le_bytes());
    write_to_space(space, cursor, &frame);

    cursor
}

/// Entry descriptor handed from the loader to the ring-3 entry thunk.
struct UserEntry {
    rip: u64,
    rsp: u64,
}

extern "C" fn user_task_entry(arg: usize) -> ! {
    // SAFETY: `arg` is the Box<UserEntry> the loader leaked for this task.
    let entry = unsafe { Box::from_raw(arg as *mut UserEntry) };
    let (rip, rsp) = (entry.rip, entry.rsp);
    drop(entry);
    // SAFETY: the loader mapped `rip` user-executable and `rsp` user-
    // writable in this task's (now active) address space; the scheduler
    // pointed the TSS at this task's kernel stack.
    unsafe { usermode::enter_usermode(rip, rsp) }
}

/// Load `image` into a new address space and spawn it as `name`.
///
/// Returns the new task's id, or an error for a malformed image (in which
/// case no task is created).
pub fn spawn_from_buffer(name: &str, image: &[u8], argv: &[&str]) -> KernelResult<TaskId> {
    let header = validate_header(image)?;
    let entry_point = header.entry;

    let space = vmm::clone_address_space(&vmm::kernel_space());

    let mut loaded = 0;
    for seg in program_headers(image, &header)? {
        if seg.p_type != PT_LOAD {
            continue;
        }
        load_segment(&space, image, &seg)?;
        loaded += 1;
    }
    if loaded == 0 {
        return Err(ElfError::NotExecutable.into());
    }

    let user_rsp = build_user_stack(&space, argv);

    let entry = Box::new(UserEntry {
        rip: entry_point,
        rsp: user_rsp,
    });
    let task = Box::new(Task::new(
        name,
        user_task_entry,
        Box::into_raw(entry) as usize,
        sched::alloc_task_id(),
        space,
        true,
        PriorityClass::Normal,
    ));
    let id = sched::spawn_task(task);
    log::info!("elf: spawned {} as task {} (entry {:#x})", name, id.0, entry_point);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header() -> [u8; 64] {
        let mut h = [0u8; 64];
        h[..4].copy_from_slice(&ELF_MAGIC);
        h[4] = ELF_CLASS_64;
        h[5] = ELF_DATA_2LSB;
        h[6] = ELF_VERSION_CURRENT;
        h[16] = ET_EXEC as u8;
        h[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        h
    }

    #[test_case]
    fn test_accepts_static_x86_64_executable() {
        let h = minimal_header();
        assert!(validate_header(&h).is_ok());
    }

    #[test_case]
    fn test_rejects_bad_magic() {
        let mut h = minimal_header();
        h[0] = 0x7E;
        assert_eq!(validate_header(&h), Err(ElfError::BadMagic));
    }

    #[test_case]
    fn test_rejects_32_bit() {
        let mut h = minimal_header();
        h[4] = 1; // ELFCLASS32
        assert_eq!(validate_header(&h), Err(ElfError::UnsupportedClass));
    }

    #[test_case]
    fn test_rejects_dynamic_and_relocatable() {
        let mut dynamic = minimal_header();
        dynamic[16] = 3; // ET_DYN
        assert_eq!(validate_header(&dynamic), Err(ElfError::NotExecutable));

        let mut relocatable = minimal_header();
        relocatable[16] = 1; // ET_REL
        assert_eq!(validate_header(&relocatable), Err(ElfError::NotExecutable));
    }

    #[test_case]
    fn test_rejects_wrong_machine() {
        let mut h = minimal_header();
        h[18..20].copy_from_slice(&0x28u16.to_le_bytes()); // EM_ARM
        assert_eq!(validate_header(&h), Err(ElfError::UnsupportedMachine));
    }

    #[test_case]
    fn test_rejects_truncated_file() {
        let h = minimal_header();
        assert_eq!(validate_header(&h[..32]), Err(ElfError::Truncated));
    }
}
