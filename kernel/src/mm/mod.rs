//! Memory management: physical frames, virtual address spaces, kernel heap.

pub mod heap;
pub mod pmm;
pub mod vmm;

use x86_64::{PhysAddr, VirtAddr};

/// Size of a physical frame and of a virtual page (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Base of the bootloader's full-physical-memory window in the kernel half.
/// Physical address P is readable at PHYS_MAP_BASE + P once paging is up.
pub const PHYS_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Virtual base of the kernel heap's reserved range.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_A000_0000_0000;

/// Bytes of heap mapped at boot.
pub const KERNEL_HEAP_INITIAL_BYTES: usize = 4 * 1024 * 1024;

/// Ceiling the heap may grow to. Intermediate page tables for this whole
/// range are created at boot so growth never touches the shared top-level
/// entries.
pub const KERNEL_HEAP_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Translate a physical address through the kernel's physical-map window.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(PHYS_MAP_BASE + phys.as_u64())
}

/// Round an address down to its page base.
pub const fn page_floor(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round an address up to the next page boundary.
pub const fn page_ceil(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Initialize physical memory, virtual memory, and the kernel heap, in that
/// order. Called once from the kernel entry point after boot info is read.
pub fn init() {
    pmm::init();
    vmm::init();
    heap::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_page_rounding() {
        assert_eq!(page_floor(0x1234), 0x1000);
        assert_eq!(page_ceil(0x1234), 0x2000);
        assert_eq!(page_floor(0x2000), 0x2000);
        assert_eq!(page_ceil(0x2000), 0x2000);
        assert_eq!(page_ceil(0), 0);
    }
}
