//! Virtual memory manager.
//!
//! Builds per-task address spaces on x86_64 4-level paging. Every address
//! space shares the kernel half (PML4 entries 256..512) by reference with
//! the boot-time kernel tables; user mappings live in the lower half and
//! are private.
//!
//! Page tables are edited through the bootloader's physical-map window, so
//! any space can be modified without activating it first.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{PageTable, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use super::{page_ceil, page_floor, phys_to_virt, pmm, PAGE_SIZE};
use crate::sync::{GlobalState, IrqSpinlock};

/// First PML4 slot of the kernel half.
const KERNEL_HALF_FIRST_P4: usize = 256;

/// PTE available bit marking a frame that was allocated by `map_region` and
/// is therefore owned (and freed) by this mapping. Mappings of pre-existing
/// physical ranges (framebuffer, initrd, shared memory) leave it clear.
const OWNED: PageTableFlags = PageTableFlags::BIT_9;

/// The access policy for a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingFlags {
    KernelRo,
    KernelRw,
    UserRo,
    UserRw,
    UserRx,
}

impl MappingFlags {
    fn pte_flags(self) -> PageTableFlags {
        match self {
            MappingFlags::KernelRo => PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE,
            MappingFlags::KernelRw => {
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE
            }
            MappingFlags::UserRo => {
                PageTableFlags::PRESENT
                    | PageTableFlags::USER_ACCESSIBLE
                    | PageTableFlags::NO_EXECUTE
            }
            MappingFlags::UserRw => {
                PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE
                    | PageTableFlags::NO_EXECUTE
            }
            MappingFlags::UserRx => PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE,
        }
    }

    fn is_user(self) -> bool {
        !matches!(self, MappingFlags::KernelRo | MappingFlags::KernelRw)
    }
}

/// Identifier of an address space; tasks refer to their space by id + root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrSpaceId(pub u32);

/// A virtual address space: a PML4 root plus an identity.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpace {
    pub id: AddrSpaceId,
    pub root: PhysAddr,
}

static KERNEL_SPACE: GlobalState<AddressSpace> = GlobalState::new();
static NEXT_ASID: AtomicU32 = AtomicU32::new(1);
static KERNEL_HALF_FROZEN: AtomicBool = AtomicBool::new(false);

/// Serializes all page-table edits. Table walks read through the physical
/// window, so a single lock suffices for every space.
static PAGING_LOCK: IrqSpinlock<()> = IrqSpinlock::new(());

/// Adopt the bootloader's page tables as the kernel address space and
/// pre-create the intermediate tables for the heap's reserved range.
pub fn init() {
    let (frame, _) = Cr3::read();
    let space = AddressSpace {
        id: AddrSpaceId(0),
        root: frame.start_address(),
    };
    KERNEL_SPACE
        .init(space)
        .ok()
        .expect("vmm initialized twice");

    // The heap grows after the kernel half is frozen; creating its
    // intermediate tables now keeps that growth below the shared top-level
    // entries.
    reserve_kernel_range(
        VirtAddr::new(super::KERNEL_HEAP_BASE),
        super::KERNEL_HEAP_MAX_BYTES,
    );

    log::info!("vmm: adopted boot page tables, root {:#x}", space.root);
}

/// The kernel address space.
pub fn kernel_space() -> AddressSpace {
    KERNEL_SPACE.with(|s| *s).expect("vmm not initialized")
}

/// Freeze the kernel half. After this, address-space creation shares the
/// current top-level kernel entries and no new kernel PML4 slots may be
/// populated.
pub fn notify_shared_kernel_memory_allocated() {
    KERNEL_HALF_FROZEN.store(true, Ordering::Release);
    log::info!("vmm: kernel half frozen; new address spaces share it by reference");
}

/// Whether the boot-time kernel-mapping phase has ended.
pub fn is_shared_kernel_memory_allocated() -> bool {
    KERNEL_HALF_FROZEN.load(Ordering::Acquire)
}

/// View a page-table frame through the physical window.
///
/// # Safety
/// `phys` must be a page-table frame owned by this subsystem, and the caller
/// must hold `PAGING_LOCK`.
unsafe fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
    // SAFETY: the physical window maps all of RAM; the caller guarantees the
    // frame holds a page table and edits are serialized.
    unsafe { &mut *(phys_to_virt(phys).as_mut_ptr::<PageTable>()) }
}

/// Allocate and zero a fresh page-table frame.
fn alloc_table() -> PhysAddr {
    let frame = pmm::alloc_frame();
    // SAFETY: the frame was just allocated for exclusive use as a table.
    unsafe {
        core::ptr::write_bytes(phys_to_virt(frame).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
    }
    frame
}

/// Walk one level down from `entry`, creating the next table if absent.
///
/// # Safety
/// Caller must hold `PAGING_LOCK`.
unsafe fn ensure_next_table(
    entry: &mut x86_64::structures::paging::page_table::PageTableEntry,
    user: bool,
) -> PhysAddr {
    if entry.is_unused() {
        let table = alloc_table();
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        entry.set_addr(table, flags);
        table
    } else {
        entry.addr()
    }
}

fn is_kernel_half(virt: VirtAddr) -> bool {
    usize::from(virt.p4_index()) >= KERNEL_HALF_FIRST_P4
}

/// Flush one page from the TLB if `space` is the active address space.
fn flush_if_active(space: &AddressSpace, virt: VirtAddr) {
    let (frame, _) = Cr3::read();
    if frame.start_address() == space.root {
        x86_64::instructions::tlb::flush(virt);
    }
}

/// Walk to the PTE for `virt` in `space`, creating intermediate tables.
///
/// # Safety
/// Caller must hold `PAGING_LOCK`.
unsafe fn pte_for<'a>(
    space: &AddressSpace,
    virt: VirtAddr,
    user: bool,
) -> &'a mut x86_64::structures::paging::page_table::PageTableEntry {
    // SAFETY: lock held per contract; all frames below come from this walk.
    unsafe {
        let p4 = table_mut(space.root);
        let p4e = &mut p4[virt.p4_index()];
        if is_kernel_half(virt) {
            assert!(!user, "user mapping requested in the kernel half");
            assert!(
                !p4e.is_unused() || !is_shared_kernel_memory_allocated(),
                "new kernel-half top-level entry after the kernel half was frozen"
            );
        }
        let p3 = table_mut(ensure_next_table(p4e, user));
        let p2 = table_mut(ensure_next_table(&mut p3[virt.p3_index()], user));
        let p1 = table_mut(ensure_next_table(&mut p2[virt.p2_index()], user));
        &mut p1[virt.p1_index()]
    }
}

/// Map `size` bytes at `virt`, allocating a fresh frame per page.
///
/// The range is rounded out to page boundaries. Mapping an already-mapped
/// page is a kernel bug and asserts.
pub fn map_region(space: &AddressSpace, virt: VirtAddr, size: usize, flags: MappingFlags) {
    let start = page_floor(virt.as_u64());
    let end = page_ceil(virt.as_u64() + size as u64);
    let _guard = PAGING_LOCK.lock();

    let mut addr = start;
    while addr < end {
        let page = VirtAddr::new(addr);
        // SAFETY: PAGING_LOCK held.
        let entry = unsafe { pte_for(space, page, flags.is_user()) };
        assert!(entry.is_unused(), "double map at {addr:#x}");
        let frame = pmm::alloc_frame();
        // Fresh frames may hold stale data from a previous owner.
        // SAFETY: the frame was just allocated and is reachable through the
        // physical window.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(frame).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
        entry.set_addr(frame, flags.pte_flags() | OWNED);
        flush_if_active(space, page);
        addr += PAGE_SIZE as u64;
    }
}

/// Map `size` bytes at `virt` onto the existing physical range at `phys`.
///
/// Used for the framebuffer, the initrd, and shared-memory regions; the
/// frames are not owned by the mapping and are never freed by `unmap_region`.
pub fn map_region_at(
    space: &AddressSpace,
    virt: VirtAddr,
    phys: PhysAddr,
    size: usize,
    flags: MappingFlags,
) {
    let start = page_floor(virt.as_u64());
    let end = page_ceil(virt.as_u64() + size as u64);
    let phys_start = page_floor(phys.as_u64());
    let _guard = PAGING_LOCK.lock();

    let mut offset = 0;
    while start + offset < end {
        let page = VirtAddr::new(start + offset);
        // SAFETY: PAGING_LOCK held.
        let entry = unsafe { pte_for(space, page, flags.is_user()) };
        assert!(entry.is_unused(), "double map at {:#x}", start + offset);
        entry.set_addr(PhysAddr::new(phys_start + offset), flags.pte_flags());
        flush_if_active(space, page);
        offset += PAGE_SIZE as u64;
    }
}

/// Unmap `size` bytes at `virt`. Pages that are not present are skipped.
/// Frames the mapping owns (allocated by `map_region`) are returned to the
/// frame pool.
pub fn unmap_region(space: &AddressSpace, virt: VirtAddr, size: usize) {
    let start = page_floor(virt.as_u64());
    let end = page_ceil(virt.as_u64() + size as u64);
    let _guard = PAGING_LOCK.lock();

    let mut addr = start;
    while addr < end {
        let page = VirtAddr::new(addr);
        if let Some(entry) = walk_existing(space, page) {
            if !entry.is_unused() {
                if entry.flags().contains(OWNED) {
                    pmm::free_frame(entry.addr());
                }
                entry.set_unused();
                flush_if_active(space, page);
            }
        }
        addr += PAGE_SIZE as u64;
    }
}

/// Walk to the PTE for `virt` without creating tables.
fn walk_existing<'a>(
    space: &AddressSpace,
    virt: VirtAddr,
) -> Option<&'a mut x86_64::structures::paging::page_table::PageTableEntry> {
    // SAFETY: callers hold PAGING_LOCK (or run single-threaded during boot);
    // the walk only follows entries this subsystem created.
    unsafe {
        let p4 = table_mut(space.root);
        let p4e = &p4[virt.p4_index()];
        if p4e.is_unused() {
            return None;
        }
        let p3 = table_mut(p4e.addr());
        let p3e = &p3[virt.p3_index()];
        if p3e.is_unused() || p3e.flags().contains(PageTableFlags::HUGE_PAGE) {
            return None;
        }
        let p2 = table_mut(p3e.addr());
        let p2e = &p2[virt.p2_index()];
        if p2e.is_unused() || p2e.flags().contains(PageTableFlags::HUGE_PAGE) {
            return None;
        }
        let p1 = table_mut(p2e.addr());
        Some(&mut p1[virt.p1_index()])
    }
}

/// Translate `virt` in `space` to its physical address, or `None` if the
/// page is not present.
pub fn phys_of(space: &AddressSpace, virt: VirtAddr) -> Option<PhysAddr> {
    let _guard = PAGING_LOCK.lock();
    let entry = walk_existing(space, virt)?;
    if entry.is_unused() {
        return None;
    }
    let offset = virt.as_u64() & (PAGE_SIZE as u64 - 1);
    Some(PhysAddr::new(entry.addr().as_u64() + offset))
}

/// Create a new address space sharing the kernel half by reference.
///
/// The user half starts empty; the ELF loader populates it. Must not be
/// called before the kernel half is frozen.
pub fn clone_address_space(parent: &AddressSpace) -> AddressSpace {
    assert!(
        is_shared_kernel_memory_allocated(),
        "address-space creation before the kernel half was frozen"
    );
    let _guard = PAGING_LOCK.lock();

    let root = alloc_table();
    // SAFETY: PAGING_LOCK held; both frames hold page tables.
    unsafe {
        let src = table_mut(parent.root);
        let dst = table_mut(root);
        for i in KERNEL_HALF_FIRST_P4..512 {
            dst[i] = src[i].clone();
        }
    }

    AddressSpace {
        id: AddrSpaceId(NEXT_ASID.fetch_add(1, Ordering::Relaxed)),
        root,
    }
}

/// Load `space` into the page-table base register.
pub fn activate(space: &AddressSpace) {
    let frame = PhysFrame::containing_address(space.root);
    // SAFETY: the root was built by this subsystem and includes the shared
    // kernel half, so the kernel keeps executing across the switch.
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// Pre-create intermediate tables for a kernel virtual range without
/// mapping any pages. Boot-time only.
pub fn reserve_kernel_range(virt: VirtAddr, size: usize) {
    assert!(
        !is_shared_kernel_memory_allocated(),
        "kernel range reservation after freeze"
    );
    let space = kernel_space();
    let start = page_floor(virt.as_u64());
    let end = page_ceil(virt.as_u64() + size as u64);
    let _guard = PAGING_LOCK.lock();

    let mut addr = start;
    while addr < end {
        let page = VirtAddr::new(addr);
        // SAFETY: PAGING_LOCK held.
        unsafe {
            let _ = pte_for(&space, page, false);
        }
        // One PT covers 2 MiB
        addr += 2 * 1024 * 1024;
    }
}

/// Tear down the user half of `space`: free every owned frame, every
/// intermediate table, and finally the root. The shared kernel-half tables
/// are left untouched.
///
/// Shared-memory regions must be released (unmapped) before this runs so
/// that every remaining owned frame is exclusive to this space.
pub fn destroy_address_space(space: AddressSpace) {
    let _guard = PAGING_LOCK.lock();

    // SAFETY: PAGING_LOCK held; the walk only follows tables this subsystem
    // allocated for the user half.
    unsafe {
        let p4 = table_mut(space.root);
        for p4i in 0..KERNEL_HALF_FIRST_P4 {
            let p4e = &mut p4[p4i];
            if p4e.is_unused() {
                continue;
            }
            let p3 = table_mut(p4e.addr());
            for p3i in 0..512 {
                let p3e = &mut p3[p3i];
                if p3e.is_unused() {
                    continue;
                }
                let p2 = table_mut(p3e.addr());
                for p2i in 0..512 {
                    let p2e = &mut p2[p2i];
                    if p2e.is_unused() {
                        continue;
                    }
                    let p1 = table_mut(p2e.addr());
                    for p1i in 0..512 {
                        let p1e = &mut p1[p1i];
                        if !p1e.is_unused() && p1e.flags().contains(OWNED) {
                            pmm::free_frame(p1e.addr());
                        }
                    }
                    pmm::free_frame(p2e.addr());
                }
                pmm::free_frame(p3e.addr());
            }
            pmm::free_frame(p4e.addr());
        }
    }
    pmm::free_frame(space.root);
}
