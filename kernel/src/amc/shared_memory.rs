//! Shared-memory regions between services.
//!
//! A region is a run of physically contiguous frames mapped user-RW into
//! both participants' address spaces. Regions are reference-counted by
//! participant: the frames are returned to the pool only once both sides
//! have released (explicitly or by dying).

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use x86_64::{PhysAddr, VirtAddr};

use crate::{
    error::{AmcError, KernelResult},
    mm::{page_ceil, pmm, vmm, PAGE_SIZE},
    sched::TaskPtr,
    sync::IrqSpinlock,
};

/// One participant's view of a region.
struct Peer {
    task: TaskPtr,
    virt: u64,
    released: bool,
}

/// A shared (or single-owner contiguous) physical region.
struct SharedRegion {
    phys_base: PhysAddr,
    size: usize,
    peers: Vec<Peer>,
}

static REGIONS: IrqSpinlock<BTreeMap<u32, SharedRegion>> = IrqSpinlock::new(BTreeMap::new());
static NEXT_REGION_ID: AtomicU32 = AtomicU32::new(1);

/// Map `size` bytes of fresh contiguous physical memory user-RW into both
/// the calling task's and the peer service's address spaces.
///
/// Returns (local_virt, remote_virt).
pub fn create(remote_service: &str, size: usize) -> KernelResult<(u64, u64)> {
    let remote = super::service::service_named(remote_service)
        .ok_or(AmcError::ServiceNotFound)?;
    let local_task = crate::sched::current_task();

    let size = page_ceil(size as u64) as usize;
    let phys_base = pmm::alloc_contiguous(size / PAGE_SIZE);

    let (local_virt, remote_virt) = {
        // SAFETY: both TCBs are live; the remote's window counter is only
        // advanced here and in its own syscalls, serialized by this module's
        // region lock discipline.
        let local_t = unsafe { local_task.get() };
        let remote_t = unsafe { remote.task.get() };
        (
            local_t.take_shmem_window(size),
            remote_t.take_shmem_window(size),
        )
    };

    // SAFETY-free mapping: the VMM edits either space through the physical
    // window, no activation needed.
    {
        // SAFETY: reading address-space fields of live TCBs.
        let (local_space, remote_space) = unsafe {
            (
                local_task.get().address_space,
                remote.task.get().address_space,
            )
        };
        vmm::map_region_at(
            &local_space,
            VirtAddr::new(local_virt),
            phys_base,
            size,
            vmm::MappingFlags::UserRw,
        );
        vmm::map_region_at(
            &remote_space,
            VirtAddr::new(remote_virt),
            phys_base,
            size,
            vmm::MappingFlags::UserRw,
        );
    }

    let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
    REGIONS.lock().insert(
        id,
        SharedRegion {
            phys_base,
            size,
            peers: alloc::vec![
                Peer {
                    task: local_task,
                    virt: local_virt,
                    released: false,
                },
                Peer {
                    task: remote.task,
                    virt: remote_virt,
                    released: false,
                },
            ],
        },
    );

    // SAFETY: recording the region id for teardown in live TCBs.
    unsafe {
        local_task.get().shmem_regions.push(id);
        remote.task.get().shmem_regions.push(id);
    }

    Ok((local_virt, remote_virt))
}

/// Allocate a single-owner contiguous physical range mapped user-RW into
/// the calling task (the alloc-physical-range core command). Freed through
/// the same teardown path as shared regions.
pub fn create_single_owner(size: usize) -> (u64, u64) {
    let task = crate::sched::current_task();
    let size = page_ceil(size as u64) as usize;
    let phys_base = pmm::alloc_contiguous(size / PAGE_SIZE);

    // SAFETY: mutating our own TCB.
    let (virt, space) = unsafe {
        let t = task.get();
        (t.take_shmem_window(size), t.address_space)
    };
    vmm::map_region_at(
        &space,
        VirtAddr::new(virt),
        phys_base,
        size,
        vmm::MappingFlags::UserRw,
    );

    let id = NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed);
    REGIONS.lock().insert(
        id,
        SharedRegion {
            phys_base,
            size,
            peers: alloc::vec![Peer {
                task,
                virt,
                released: false,
            }],
        },
    );
    // SAFETY: recording the region id in our own TCB.
    unsafe {
        task.get().shmem_regions.push(id);
    }

    (phys_base.as_u64(), virt)
}

/// Release `task`'s side of the region containing `local_virt`.
pub fn release_by_addr(task: TaskPtr, local_virt: u64) {
    let id = {
        let regions = REGIONS.lock();
        regions
            .iter()
            .find(|(_, r)| {
                r.peers
                    .iter()
                    .any(|p| p.task == task && p.virt == local_virt && !p.released)
            })
            .map(|(id, _)| *id)
    };
    if let Some(id) = id {
        release_peer(id, task);
    }
}

/// Release every region `task` participates in (task teardown).
pub fn release_all_for_task(task: TaskPtr) {
    // SAFETY: the exiting task's region list is stable during teardown.
    let ids: Vec<u32> = unsafe { task.get() }.shmem_regions.clone();
    for id in ids {
        release_peer(id, task);
    }
}

/// Mark one peer released, unmapping its view. Frees the frames when the
/// last peer lets go.
fn release_peer(id: u32, task: TaskPtr) {
    let mut regions = REGIONS.lock();
    let Some(region) = regions.get_mut(&id) else {
        return;
    };

    for peer in region.peers.iter_mut() {
        if peer.task == task && !peer.released {
            peer.released = true;
            // SAFETY: reading the address space of a live (possibly
            // exiting, not yet reaped) TCB.
            let space = unsafe { peer.task.get() }.address_space;
            vmm::unmap_region(&space, VirtAddr::new(peer.virt), region.size);
        }
    }

    if region.peers.iter().all(|p| p.released) {
        let pages = region.size / PAGE_SIZE;
        for i in 0..pages {
            pmm::free_frame(PhysAddr::new(
                region.phys_base.as_u64() + (i * PAGE_SIZE) as u64,
            ));
        }
        regions.remove(&id);
        log::debug!("amc: shared region {} freed", id);
    }
}
