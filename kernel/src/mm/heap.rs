//! Kernel heap.
//!
//! A byte-granular free-list allocator (`linked_list_allocator`) over a
//! fixed kernel virtual range. The initial window is mapped at boot; when
//! an allocation does not fit, the heap maps further pages into its
//! reserved range through the VMM and retries. Growth past the reserved
//! ceiling is fatal.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use linked_list_allocator::Heap;
use spin::Mutex;
use x86_64::VirtAddr;

use super::{vmm, KERNEL_HEAP_BASE, KERNEL_HEAP_INITIAL_BYTES, KERNEL_HEAP_MAX_BYTES, PAGE_SIZE};

/// Bytes the heap grows by when exhausted.
const GROWTH_STEP: usize = 1024 * 1024;

/// The kernel's global allocator: a locked free-list heap that grows into
/// its reserved virtual range on demand.
pub struct KernelHeap {
    inner: Mutex<Heap>,
    /// Bytes of the reserved range currently mapped.
    mapped: AtomicUsize,
    /// Bytes currently handed out, for the system-profile response.
    in_use: AtomicUsize,
}

impl KernelHeap {
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(Heap::empty()),
            mapped: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated from the heap.
    pub fn allocated_bytes(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Hand the heap a pre-mapped region directly and disable growth.
    /// Test binaries use this to run before (or without) the VMM.
    ///
    /// # Safety
    /// The region must be unused, writable, and live for the program's
    /// lifetime. Must be called at most once, before any allocation.
    pub unsafe fn init_raw(&self, bottom: *mut u8, size: usize) {
        // SAFETY: forwarded contract.
        unsafe {
            self.inner.lock().init(bottom, size);
        }
        // Report the range fully mapped so alloc() never tries to grow.
        self.mapped.store(KERNEL_HEAP_MAX_BYTES, Ordering::Relaxed);
    }

    /// Map `bytes` more of the reserved range and hand them to the free
    /// list. Returns false once the ceiling is reached.
    fn grow(&self, bytes: usize) -> bool {
        let mapped = self.mapped.load(Ordering::Relaxed);
        if mapped + bytes > KERNEL_HEAP_MAX_BYTES {
            return false;
        }
        vmm::map_region(
            &vmm::kernel_space(),
            VirtAddr::new(KERNEL_HEAP_BASE + mapped as u64),
            bytes,
            vmm::MappingFlags::KernelRw,
        );
        // SAFETY: the pages were just mapped and nothing else references
        // this slice of the reserved range.
        unsafe {
            self.inner.lock().extend(bytes);
        }
        self.mapped.store(mapped + bytes, Ordering::Relaxed);
        true
    }
}

// SAFETY: the inner Heap is protected by a spin::Mutex taken with
// interrupts disabled, so interrupt-context allocations can never spin on
// a lock the interrupted task holds. Growth only appends freshly mapped
// pages; allocations are valid until deallocated.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        x86_64::instructions::interrupts::without_interrupts(|| loop {
            if let Ok(ptr) = self.inner.lock().allocate_first_fit(layout) {
                self.in_use.fetch_add(layout.size(), Ordering::Relaxed);
                return ptr.as_ptr();
            }
            // Map at least a full growth step so small allocations do not
            // thrash the VMM.
            let needed = layout.size().max(GROWTH_STEP).next_multiple_of(PAGE_SIZE);
            if !self.grow(needed) {
                return ptr::null_mut();
            }
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(nn) = ptr::NonNull::new(ptr) {
            self.in_use.fetch_sub(layout.size(), Ordering::Relaxed);
            x86_64::instructions::interrupts::without_interrupts(|| {
                // SAFETY: `ptr` came from alloc() with this layout.
                unsafe {
                    self.inner.lock().deallocate(nn, layout);
                }
            });
        }
    }
}

/// Map the initial heap window and initialize the free list.
pub fn init() {
    let heap = crate::allocator();

    vmm::map_region(
        &vmm::kernel_space(),
        VirtAddr::new(KERNEL_HEAP_BASE),
        KERNEL_HEAP_INITIAL_BYTES,
        vmm::MappingFlags::KernelRw,
    );
    // SAFETY: the range was just mapped and is used for nothing else.
    unsafe {
        heap.inner
            .lock()
            .init(KERNEL_HEAP_BASE as *mut u8, KERNEL_HEAP_INITIAL_BYTES);
    }
    heap.mapped
        .store(KERNEL_HEAP_INITIAL_BYTES, Ordering::Relaxed);

    log::info!(
        "heap: {} KiB online at {:#x}",
        KERNEL_HEAP_INITIAL_BYTES / 1024,
        KERNEL_HEAP_BASE
    );
}

/// Bytes currently allocated, for the system-profile response.
pub fn allocated_bytes() -> usize {
    crate::allocator().allocated_bytes()
}
