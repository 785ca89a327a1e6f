//! Boot-time ramdisk.
//!
//! The initrd is a flat read-only archive the bootloader loads next to the
//! kernel: a `u32` file count, a fixed table of 64 file headers, then raw
//! file data. Each header is `{ magic: u8 = 0xBF, name: [u8; 64]
//! NUL-terminated, offset: u32, length: u32 }` with C struct padding
//! (76-byte stride); offsets are absolute from the start of the archive.
//! The 64-entry cap is baked into the header layout and cannot be raised
//! without a format change.

use alloc::{string::String, vec::Vec};

use crate::{
    boot_info,
    error::{InitrdError, KernelResult},
    mm::{phys_to_virt, PHYS_MAP_BASE},
    sync::GlobalState,
};
use x86_64::PhysAddr;

/// Hard cap baked into the on-disk header table.
pub const MAX_INITRD_FILES: usize = 64;

/// Magic byte opening every file header.
pub const INITRD_HEADER_MAGIC: u8 = 0xBF;

/// On-disk stride of one file header (C layout: 1 + 64 bytes, then two
/// u32 fields at offsets 68 and 72).
const FILE_HEADER_SIZE: usize = 76;
const NAME_OFFSET: usize = 1;
const NAME_LEN: usize = 64;
const OFFSET_FIELD: usize = 68;
const LENGTH_FIELD: usize = 72;

/// One parsed directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitrdFile {
    pub name: String,
    pub offset: u32,
    pub length: u32,
}

/// Parse the archive's directory. Pure over the byte image.
pub fn parse(data: &[u8]) -> Result<Vec<InitrdFile>, InitrdError> {
    if data.len() < 4 + MAX_INITRD_FILES * FILE_HEADER_SIZE {
        return Err(InitrdError::Truncated);
    }
    let nfiles = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if nfiles > MAX_INITRD_FILES {
        return Err(InitrdError::TooManyFiles);
    }

    let mut files = Vec::with_capacity(nfiles);
    for i in 0..nfiles {
        let base = 4 + i * FILE_HEADER_SIZE;
        let header = &data[base..base + FILE_HEADER_SIZE];
        if header[0] != INITRD_HEADER_MAGIC {
            return Err(InitrdError::BadMagic);
        }

        let name_bytes = &header[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

        let offset = u32::from_le_bytes([
            header[OFFSET_FIELD],
            header[OFFSET_FIELD + 1],
            header[OFFSET_FIELD + 2],
            header[OFFSET_FIELD + 3],
        ]);
        let length = u32::from_le_bytes([
            header[LENGTH_FIELD],
            header[LENGTH_FIELD + 1],
            header[LENGTH_FIELD + 2],
            header[LENGTH_FIELD + 3],
        ]);

        let end = offset as usize + length as usize;
        if end > data.len() {
            return Err(InitrdError::FileOutOfBounds);
        }
        files.push(InitrdFile {
            name,
            offset,
            length,
        });
    }
    Ok(files)
}

/// The mounted ramdisk: the raw image (reachable through the physical
/// window) plus its parsed directory.
pub struct Initrd {
    data: &'static [u8],
    files: Vec<InitrdFile>,
}

impl Initrd {
    pub fn file_named(&self, name: &str) -> Option<&'static [u8]> {
        let file = self.files.iter().find(|f| f.name == name)?;
        Some(&self.data[file.offset as usize..(file.offset + file.length) as usize])
    }

    pub fn files(&self) -> &[InitrdFile] {
        &self.files
    }
}

static INITRD: GlobalState<Initrd> = GlobalState::new();

/// Mount the ramdisk the bootloader handed over.
pub fn init() -> KernelResult<()> {
    let (base, size) = boot_info::with(|b| (b.initrd_base, b.initrd_size));
    assert!(base >= 0x1000 && size > 0, "bootloader provided no initrd");

    let virt = phys_to_virt(PhysAddr::new(base));
    debug_assert!(virt.as_u64() >= PHYS_MAP_BASE);
    // SAFETY: the initrd's physical range is reserved in the PMM and lies
    // inside the physical window; it is never written after boot.
    let data: &'static [u8] =
        unsafe { core::slice::from_raw_parts(virt.as_ptr::<u8>(), size as usize) };

    let files = parse(data)?;
    log::info!("initrd: {} files, {} bytes", files.len(), size);
    for f in &files {
        log::debug!("initrd:   {} ({} bytes)", f.name, f.length);
    }

    INITRD
        .init(Initrd { data, files })
        .ok()
        .expect("initrd mounted twice");
    Ok(())
}

/// Read a file from the mounted ramdisk.
pub fn file_named(name: &str) -> Option<&'static [u8]> {
    INITRD
        .with(|i| i.file_named(name))
        .expect("initrd not mounted")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal archive: `names` become sequential files holding
    /// their own name bytes as content.
    fn build_archive(names: &[&str]) -> Vec<u8> {
        let dir_size = 4 + MAX_INITRD_FILES * FILE_HEADER_SIZE;
        let mut data = alloc::vec![0u8; dir_size];
        data[..4].copy_from_slice(&(names.len() as u32).to_le_bytes());

        for (i, name) in names.iter().enumerate() {
            let base = 4 + i * FILE_HEADER_SIZE;
            data[base] = INITRD_HEADER_MAGIC;
            data[base + NAME_OFFSET..base + NAME_OFFSET + name.len()]
                .copy_from_slice(name.as_bytes());
            let offset = data.len() as u32;
            let length = name.len() as u32;
            data[base + OFFSET_FIELD..base + OFFSET_FIELD + 4]
                .copy_from_slice(&offset.to_le_bytes());
            data[base + LENGTH_FIELD..base + LENGTH_FIELD + 4]
                .copy_from_slice(&length.to_le_bytes());
            data.extend_from_slice(name.as_bytes());
        }
        data
    }

    #[test_case]
    fn test_parse_roundtrip() {
        let data = build_archive(&["awm", "file_manager"]);
        let files = parse(&data).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "awm");
        assert_eq!(files[1].name, "file_manager");
        assert_eq!(files[0].length, 3);
    }

    #[test_case]
    fn test_file_lookup() {
        let data = build_archive(&["kb_driver"]);
        let files = parse(&data).unwrap();
        let initrd = Initrd {
            // SAFETY-free: tests only; leak to satisfy the 'static bound.
            data: Vec::leak(data.clone()),
            files,
        };
        assert_eq!(initrd.file_named("kb_driver"), Some(&b"kb_driver"[..]));
        assert!(initrd.file_named("missing").is_none());
    }

    #[test_case]
    fn test_rejects_bad_magic() {
        let mut data = build_archive(&["awm"]);
        data[4] = 0xAA;
        assert_eq!(parse(&data), Err(InitrdError::BadMagic));
    }

    #[test_case]
    fn test_rejects_too_many_files() {
        let mut data = build_archive(&[]);
        data[..4].copy_from_slice(&(MAX_INITRD_FILES as u32 + 1).to_le_bytes());
        assert_eq!(parse(&data), Err(InitrdError::TooManyFiles));
    }

    #[test_case]
    fn test_rejects_out_of_bounds_file() {
        let mut data = build_archive(&["awm"]);
        let base = 4;
        data[base + LENGTH_FIELD..base + LENGTH_FIELD + 4]
            .copy_from_slice(&0xFFFF_FFu32.to_le_bytes());
        assert_eq!(parse(&data), Err(InitrdError::FileOutOfBounds));
    }

    #[test_case]
    fn test_rejects_truncated_archive() {
        let data = alloc::vec![0u8; 16];
        assert_eq!(parse(&data), Err(InitrdError::Truncated));
    }
}
