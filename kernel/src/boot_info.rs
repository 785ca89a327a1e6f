//! Bootloader handoff record.
//!
//! The UEFI bootloader leaves an `AxleBootInfo` record in memory and passes
//! its address to the kernel entry point. The layouts here are ABI: they
//! must match the bootloader side field for field.

use core::slice;

use crate::sync::GlobalState;

/// EFI memory type for conventional (usable) memory.
pub const EFI_CONVENTIONAL_MEMORY: u32 = 7;

/// One entry of the firmware memory map.
///
/// Matches the EFI_MEMORY_DESCRIPTOR layout the bootloader hands over.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EfiMemoryDescriptor {
    pub typ: u32,
    pub pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

impl EfiMemoryDescriptor {
    /// Whether the described region may be handed to the frame allocator.
    pub fn is_usable(&self) -> bool {
        self.typ == EFI_CONVENTIONAL_MEMORY
    }

    /// Byte length of the region.
    pub fn len_bytes(&self) -> u64 {
        self.number_of_pages * 4096
    }
}

/// The handoff record, as written by the bootloader.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AxleBootInfo {
    // Graphics info
    pub framebuffer_base: u64,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_bytes_per_pixel: u8,

    // Memory map info
    pub memory_map_size: u64,
    pub memory_descriptor_size: u64,
    pub memory_descriptors: *const EfiMemoryDescriptor,

    // initrd info
    pub initrd_base: u64,
    pub initrd_size: u64,
}

/// Framebuffer description derived from the handoff record, in the shape
/// the window manager's map-framebuffer response uses.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub bytes_per_pixel: u32,
    pub size: u32,
}

/// Kernel-owned copy of the handoff data.
///
/// The raw descriptor array stays where the bootloader left it (that memory
/// is marked reserved in the frame allocator); we keep the pointer and
/// iterate with the firmware-provided stride.
pub struct BootInfo {
    pub framebuffer: FramebufferInfo,
    memory_map_size: u64,
    memory_descriptor_size: u64,
    memory_descriptors: *const u8,
    pub initrd_base: u64,
    pub initrd_size: u64,
}

// SAFETY: BootInfo's pointer refers to firmware memory that is never written
// after boot; concurrent reads are harmless.
unsafe impl Send for BootInfo {}

impl BootInfo {
    /// Iterate the firmware memory map.
    ///
    /// The descriptor stride comes from the firmware and may exceed
    /// `size_of::<EfiMemoryDescriptor>()`, so this walks raw bytes.
    pub fn memory_descriptors(&self) -> impl Iterator<Item = EfiMemoryDescriptor> + '_ {
        let count = if self.memory_descriptor_size == 0 {
            0
        } else {
            (self.memory_map_size / self.memory_descriptor_size) as usize
        };
        let stride = self.memory_descriptor_size as usize;
        let base = self.memory_descriptors;
        (0..count).map(move |i| {
            // SAFETY: i < count keeps the read within the memory_map_size
            // bytes the bootloader described; every descriptor within that
            // range is a valid EfiMemoryDescriptor.
            unsafe {
                let ptr = base.add(i * stride) as *const EfiMemoryDescriptor;
                ptr.read_unaligned()
            }
        })
    }

    /// Total bytes of usable memory reported by the firmware.
    pub fn usable_bytes(&self) -> u64 {
        self.memory_descriptors()
            .filter(|d| d.is_usable())
            .map(|d| d.len_bytes())
            .sum()
    }

    /// The initrd contents.
    ///
    /// # Safety
    /// Callers must only use this after the VMM has mapped the initrd's
    /// physical range into the kernel half.
    pub unsafe fn initrd_bytes(&self, virt_base: u64) -> &'static [u8] {
        // SAFETY: caller guarantees virt_base maps initrd_size bytes.
        unsafe { slice::from_raw_parts(virt_base as *const u8, self.initrd_size as usize) }
    }
}

static BOOT_INFO: GlobalState<BootInfo> = GlobalState::new();

/// Read the bootloader's record into the kernel-owned singleton.
///
/// # Safety
/// `raw` must point to a valid `AxleBootInfo` written by the bootloader.
pub unsafe fn init(raw: *const AxleBootInfo) {
    // SAFETY: per contract, raw points to the handoff record.
    let info = unsafe { &*raw };

    let bpp = info.framebuffer_bytes_per_pixel as u32;
    let fb = FramebufferInfo {
        base: info.framebuffer_base,
        width: info.framebuffer_width,
        height: info.framebuffer_height,
        bits_per_pixel: bpp * 8,
        bytes_per_pixel: bpp,
        size: info.framebuffer_width * info.framebuffer_height * bpp,
    };

    BOOT_INFO
        .init(BootInfo {
            framebuffer: fb,
            memory_map_size: info.memory_map_size,
            memory_descriptor_size: info.memory_descriptor_size,
            memory_descriptors: info.memory_descriptors as *const u8,
            initrd_base: info.initrd_base,
            initrd_size: info.initrd_size,
        })
        .ok()
        .expect("boot info initialized twice");

    log::info!(
        "boot info: framebuffer {}x{}x{} @ {:#x}, initrd {} bytes @ {:#x}",
        fb.width,
        fb.height,
        fb.bits_per_pixel,
        fb.base,
        info.initrd_size,
        info.initrd_base
    );
}

/// Access the boot info singleton.
pub fn with<R>(f: impl FnOnce(&BootInfo) -> R) -> R {
    BOOT_INFO.with(f).expect("boot info not initialized")
}

/// The framebuffer descriptor (available once `init` has run).
pub fn framebuffer() -> FramebufferInfo {
    with(|b| b.framebuffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(typ: u32, start: u64, pages: u64) -> EfiMemoryDescriptor {
        EfiMemoryDescriptor {
            typ,
            pad: 0,
            physical_start: start,
            virtual_start: 0,
            number_of_pages: pages,
            attribute: 0,
        }
    }

    #[test_case]
    fn test_memory_map_walk_respects_stride() {
        // Firmware strides are often larger than the struct; pad each entry
        // out to 56 bytes and make sure the walk still lands on the starts.
        const STRIDE: usize = 56;
        let descs = [
            descriptor(EFI_CONVENTIONAL_MEMORY, 0x1000, 4),
            descriptor(0, 0x10_0000, 16),
            descriptor(EFI_CONVENTIONAL_MEMORY, 0x20_0000, 8),
        ];
        let mut raw = [0u8; STRIDE * 3];
        for (i, d) in descs.iter().enumerate() {
            // SAFETY: the destination range lies inside `raw` and the source
            // is a plain-old-data struct smaller than the stride.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    d as *const EfiMemoryDescriptor as *const u8,
                    raw.as_mut_ptr().add(i * STRIDE),
                    core::mem::size_of::<EfiMemoryDescriptor>(),
                );
            }
        }

        let info = BootInfo {
            framebuffer: FramebufferInfo {
                base: 0,
                width: 0,
                height: 0,
                bits_per_pixel: 0,
                bytes_per_pixel: 0,
                size: 0,
            },
            memory_map_size: (STRIDE * 3) as u64,
            memory_descriptor_size: STRIDE as u64,
            memory_descriptors: raw.as_ptr(),
            initrd_base: 0,
            initrd_size: 0,
        };

        let walked: alloc::vec::Vec<_> = info.memory_descriptors().collect();
        assert_eq!(walked.len(), 3);
        assert_eq!(walked[0].physical_start, 0x1000);
        assert_eq!(walked[2].physical_start, 0x20_0000);
        assert_eq!(info.usable_bytes(), (4 + 8) * 4096);
    }
}
