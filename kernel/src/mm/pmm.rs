//! Physical frame allocator.
//!
//! One bit per 4 KiB frame across the low 4 GiB of the physical address
//! space; a set bit means the frame is allocated. The bitmap starts fully
//! reserved and the boot memory map punches out the usable ranges, keeping
//! the kernel image, initrd, boot info, and framebuffer reserved.
//!
//! Allocation failure is fatal by design: there is no demand paging or swap
//! to fall back on.

use x86_64::PhysAddr;

use super::{page_floor, PAGE_SIZE};
use crate::{boot_info, sync::IrqSpinlock};

/// Highest physical address the kernel's bitmap covers.
const MAX_PHYS_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Words in the kernel's bitmap (64 frames per word).
pub const BITMAP_WORDS: usize = (MAX_PHYS_BYTES / PAGE_SIZE as u64 / 64) as usize;

/// The frame bitmap plus its allocation cursor.
///
/// The cursor remembers the word the last allocation came from so repeated
/// allocations do not rescan the low gigabytes of reserved space. The word
/// count is a parameter so tests can exercise small instances; the kernel
/// uses the default, which spans 4 GiB.
pub struct FrameBitmap<const WORDS: usize = BITMAP_WORDS> {
    words: [u64; WORDS],
    cursor: usize,
    free_frames: usize,
    total_usable: usize,
}

impl<const WORDS: usize> FrameBitmap<WORDS> {
    pub const fn new() -> Self {
        Self {
            // Fully reserved until the memory map is walked
            words: [u64::MAX; WORDS],
            cursor: 0,
            free_frames: 0,
            total_usable: 0,
        }
    }

    /// One past the highest address this bitmap covers.
    const fn coverage_end() -> u64 {
        (WORDS * 64 * PAGE_SIZE) as u64
    }

    fn index_of(addr: u64) -> (usize, u64) {
        let frame = (addr / PAGE_SIZE as u64) as usize;
        (frame / 64, 1u64 << (frame % 64))
    }

    /// Whether the frame containing `addr` is currently allocated.
    /// Addresses beyond the bitmap's reach report as allocated.
    pub fn is_allocated(&self, addr: u64) -> bool {
        if addr >= Self::coverage_end() {
            return true;
        }
        let (word, bit) = Self::index_of(addr);
        self.words[word] & bit != 0
    }

    /// Make a frame allocatable. Boot-time only.
    pub fn push_allocatable(&mut self, addr: u64) {
        if addr >= Self::coverage_end() {
            return;
        }
        let (word, bit) = Self::index_of(addr);
        if self.words[word] & bit != 0 {
            self.words[word] &= !bit;
            self.free_frames += 1;
            self.total_usable += 1;
        }
    }

    /// Mark every frame intersecting `[start, start+len)` as allocated.
    pub fn reserve_range(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut addr = page_floor(start);
        let end = start.saturating_add(len);
        while addr < end && addr < Self::coverage_end() {
            let (word, bit) = Self::index_of(addr);
            if self.words[word] & bit == 0 {
                self.words[word] |= bit;
                self.free_frames -= 1;
            }
            addr += PAGE_SIZE as u64;
        }
    }

    /// Allocate one frame, scanning from the cursor.
    pub fn alloc(&mut self) -> Option<u64> {
        if self.free_frames == 0 {
            return None;
        }
        for i in 0..WORDS {
            let word_idx = (self.cursor + i) % WORDS;
            let word = self.words[word_idx];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                self.words[word_idx] |= 1 << bit;
                self.cursor = word_idx;
                self.free_frames -= 1;
                return Some(((word_idx * 64 + bit) * PAGE_SIZE) as u64);
            }
        }
        None
    }

    /// Allocate the specific frame containing `addr`.
    pub fn alloc_at(&mut self, addr: u64) -> Option<u64> {
        if addr >= Self::coverage_end() {
            return None;
        }
        let (word, bit) = Self::index_of(addr);
        if self.words[word] & bit != 0 {
            return None;
        }
        self.words[word] |= bit;
        self.free_frames -= 1;
        Some(page_floor(addr))
    }

    /// Allocate `count` physically contiguous frames; returns the base.
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<u64> {
        if count == 0 || count > self.free_frames {
            return None;
        }
        let mut run = 0usize;
        let mut run_start = 0usize;
        for frame in 0..WORDS * 64 {
            let (word, bit) = (frame / 64, 1u64 << (frame % 64));
            if self.words[word] & bit == 0 {
                if run == 0 {
                    run_start = frame;
                }
                run += 1;
                if run == count {
                    for f in run_start..run_start + count {
                        self.words[f / 64] |= 1 << (f % 64);
                    }
                    self.free_frames -= count;
                    return Some((run_start * PAGE_SIZE) as u64);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Return a frame to the pool.
    pub fn free(&mut self, addr: u64) {
        assert!(addr < Self::coverage_end(), "freed frame beyond bitmap");
        let (word, bit) = Self::index_of(addr);
        assert!(
            self.words[word] & bit != 0,
            "double free of frame {addr:#x}"
        );
        self.words[word] &= !bit;
        self.free_frames += 1;
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn allocated_bytes(&self) -> u64 {
        ((self.total_usable - self.free_frames) * PAGE_SIZE) as u64
    }
}

impl<const WORDS: usize> Default for FrameBitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

static FRAME_BITMAP: IrqSpinlock<FrameBitmap> = IrqSpinlock::new(FrameBitmap::new());

/// Populate the bitmap from the boot memory map.
///
/// Usable (type 7) descriptors become allocatable; the initrd and
/// framebuffer ranges are re-reserved afterwards in case the firmware
/// reported them inside a usable region. The kernel image and boot record
/// arrive in loader-data descriptors, which are never type 7.
pub fn init() {
    let mut bitmap = FRAME_BITMAP.lock();

    boot_info::with(|info| {
        for desc in info.memory_descriptors() {
            if !desc.is_usable() {
                continue;
            }
            let mut addr = desc.physical_start;
            let end = desc.physical_start + desc.len_bytes();
            while addr < end {
                bitmap.push_allocatable(addr);
                addr += PAGE_SIZE as u64;
            }
        }

        bitmap.reserve_range(info.initrd_base, info.initrd_size);
        let fb = info.framebuffer;
        bitmap.reserve_range(fb.base, fb.size as u64);
    });

    log::info!(
        "pmm: {} MiB usable ({} frames free)",
        bitmap.free_frames() * PAGE_SIZE / (1024 * 1024),
        bitmap.free_frames()
    );
}

/// Hand one frame to the allocator's pool. Boot-time initialization only;
/// after boot the only way frames re-enter the pool is `free_frame`.
pub fn push_allocatable(addr: PhysAddr) {
    FRAME_BITMAP.lock().push_allocatable(addr.as_u64());
}

/// Allocate one 4 KiB frame. Exhaustion halts the kernel.
pub fn alloc_frame() -> PhysAddr {
    let addr = FRAME_BITMAP
        .lock()
        .alloc()
        .expect("pmm: out of physical frames");
    PhysAddr::new(addr)
}

/// Allocate the frame containing `addr`, or panic if it is already taken.
pub fn alloc_frame_at(addr: PhysAddr) -> PhysAddr {
    let base = FRAME_BITMAP
        .lock()
        .alloc_at(addr.as_u64())
        .expect("pmm: requested frame unavailable");
    PhysAddr::new(base)
}

/// Allocate `count` contiguous frames. Exhaustion halts the kernel.
pub fn alloc_contiguous(count: usize) -> PhysAddr {
    let addr = FRAME_BITMAP
        .lock()
        .alloc_contiguous(count)
        .expect("pmm: no contiguous run of requested length");
    PhysAddr::new(addr)
}

/// Return a frame to the pool.
pub fn free_frame(addr: PhysAddr) {
    FRAME_BITMAP.lock().free(addr.as_u64());
}

/// Whether the frame containing `addr` is allocated.
pub fn is_allocated(addr: PhysAddr) -> bool {
    FRAME_BITMAP.lock().is_allocated(addr.as_u64())
}

/// Bytes currently handed out, for the system-profile response.
pub fn allocated_bytes() -> u64 {
    FRAME_BITMAP.lock().allocated_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small instance: 64 words x 64 frames = 16 MiB of coverage.
    type TestBitmap = FrameBitmap<64>;

    fn bitmap_with_frames(start: u64, count: usize) -> TestBitmap {
        let mut b = TestBitmap::new();
        for i in 0..count {
            b.push_allocatable(start + (i * PAGE_SIZE) as u64);
        }
        b
    }

    #[test_case]
    fn test_alloc_and_free_roundtrip() {
        let mut b = bitmap_with_frames(0x10_0000, 8);
        assert_eq!(b.free_frames(), 8);

        let a = b.alloc().unwrap();
        assert!(b.is_allocated(a));
        assert_eq!(b.free_frames(), 7);

        b.free(a);
        assert!(!b.is_allocated(a));
        assert_eq!(b.free_frames(), 8);
    }

    #[test_case]
    fn test_everything_starts_reserved() {
        let b = TestBitmap::new();
        assert!(b.is_allocated(0));
        assert!(b.is_allocated(0x1000));
        // Beyond the bitmap counts as reserved too
        assert!(b.is_allocated(64 * 64 * PAGE_SIZE as u64 + 0x1000));
        assert_eq!(b.free_frames(), 0);
    }

    #[test_case]
    fn test_cursor_resumes_after_last_allocation() {
        let mut b = bitmap_with_frames(0x40_0000, 128);
        let first = b.alloc().unwrap();
        let second = b.alloc().unwrap();
        // Sequential allocations walk forward instead of rescanning
        assert!(second > first);
    }

    #[test_case]
    fn test_alloc_at_conflict() {
        let mut b = bitmap_with_frames(0x10_0000, 4);
        assert_eq!(b.alloc_at(0x10_0000), Some(0x10_0000));
        // Same frame twice must fail
        assert_eq!(b.alloc_at(0x10_0000), None);
        // Reserved-from-boot frames are not claimable
        assert_eq!(b.alloc_at(0x50_0000), None);
    }

    #[test_case]
    fn test_contiguous_run_skips_holes() {
        let mut b = bitmap_with_frames(0x10_0000, 8);
        // Punch a hole in the middle
        assert!(b.alloc_at(0x10_2000).is_some());

        let base = b.alloc_contiguous(4).unwrap();
        // The 4-frame run must start past the hole
        assert_eq!(base, 0x10_3000);
        for i in 0..4 {
            assert!(b.is_allocated(base + (i * PAGE_SIZE) as u64));
        }
    }

    #[test_case]
    fn test_reserve_range_is_idempotent() {
        let mut b = bitmap_with_frames(0x10_0000, 8);
        b.reserve_range(0x10_0000, 2 * PAGE_SIZE as u64);
        assert_eq!(b.free_frames(), 6);
        b.reserve_range(0x10_0000, 2 * PAGE_SIZE as u64);
        assert_eq!(b.free_frames(), 6);
    }

    #[test_case]
    fn test_accounting_matches_pool() {
        let mut b = bitmap_with_frames(0x20_0000, 16);
        let _ = b.alloc().unwrap();
        let _ = b.alloc().unwrap();
        // allocated + free == total usable
        assert_eq!(b.allocated_bytes(), 2 * PAGE_SIZE as u64);
        assert_eq!(b.free_frames(), 14);
    }
}
