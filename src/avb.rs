//! Verified-boot (AVB) footer and vbmeta header handling.

use anyhow::{bail, Context, Result};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::buffer::{BufferKind, FastbootBuffer};

pub const AVB_FOOTER_MAGIC: &[u8; 4] = b"AVBf";
pub const AVB_FOOTER_SIZE: u64 = 64;
pub const AVB_MAGIC: &[u8; 4] = b"AVB0";
/// Smallest buffer that can hold a vbmeta header.
pub const VBMETA_MIN_SIZE: u64 = 256;

/// Offset of `vbmeta_offset` inside the footer: magic, two u32 version
/// fields and the u64 original image size come first.
const FOOTER_VBMETA_OFFSET: usize = 20;
/// Byte holding the low bits of the big-endian `flags` word of the vbmeta
/// header.
const VBMETA_FLAGS_LOW_BYTE: u64 = 123;

pub const AVB_VBMETA_IMAGE_FLAGS_HASHTREE_DISABLED: u8 = 1 << 0;
pub const AVB_VBMETA_IMAGE_FLAGS_VERIFICATION_DISABLED: u8 = 1 << 1;

pub fn has_footer_magic(data: &[u8]) -> bool {
    data.len() as u64 >= AVB_FOOTER_SIZE
        && &data[data.len() - AVB_FOOTER_SIZE as usize..][..4] == AVB_FOOTER_MAGIC
}

/// Reads `vbmeta_offset` from the footer at the end of `data`.
pub fn footer_vbmeta_offset(data: &[u8]) -> Result<u64> {
    if !has_footer_magic(data) {
        bail!("Failed to find AVB_FOOTER in a {} byte image", data.len());
    }
    let footer = &data[data.len() - AVB_FOOTER_SIZE as usize..];
    let mut offset = [0u8; 8];
    offset.copy_from_slice(&footer[FOOTER_VBMETA_OFFSET..FOOTER_VBMETA_OFFSET + 8]);
    Ok(u64::from_be_bytes(offset))
}

pub fn is_vbmeta_partition(partition: &str) -> bool {
    partition.ends_with("vbmeta") || partition.ends_with("vbmeta_a") || partition.ends_with("vbmeta_b")
}

/// Sets the disable-verity and/or disable-verification bits of the vbmeta
/// header in `data`.
///
/// With `vbmeta_in_boot` the header is located through the AVB footer at
/// the end of a boot image; otherwise it starts at offset 0.
pub fn set_vbmeta_flags(
    data: &mut [u8],
    vbmeta_in_boot: bool,
    disable_verity: bool,
    disable_verification: bool,
) -> Result<()> {
    let vbmeta_offset = if vbmeta_in_boot {
        footer_vbmeta_offset(data)?
    } else {
        0
    };
    let magic_end = vbmeta_offset.checked_add(AVB_MAGIC.len() as u64);
    if magic_end.is_none_or(|end| end > data.len() as u64)
        || &data[vbmeta_offset as usize..vbmeta_offset as usize + AVB_MAGIC.len()] != AVB_MAGIC
    {
        bail!("Vbmeta image should start with AVB_MAGIC");
    }
    let flags_offset = vbmeta_offset + VBMETA_FLAGS_LOW_BYTE;
    if flags_offset >= data.len() as u64 {
        bail!("vbmeta header at offset {vbmeta_offset} is truncated");
    }
    let mut flags = 0u8;
    if disable_verity {
        flags |= AVB_VBMETA_IMAGE_FLAGS_HASHTREE_DISABLED;
    }
    if disable_verification {
        flags |= AVB_VBMETA_IMAGE_FLAGS_VERIFICATION_DISABLED;
    }
    data[flags_offset as usize] |= flags;
    Ok(())
}

/// Rewrites the vbmeta flags of `buf` into a fresh temporary file.
pub fn rewrite_vbmeta_buffer(
    buf: &mut FastbootBuffer,
    vbmeta_in_boot: bool,
    disable_verity: bool,
    disable_verification: bool,
) -> Result<()> {
    if !matches!(buf.kind, BufferKind::Fd) || buf.size < VBMETA_MIN_SIZE {
        return Ok(());
    }
    let mut data = Vec::with_capacity(buf.size as usize);
    buf.file.seek(SeekFrom::Start(0))?;
    (&mut buf.file)
        .take(buf.size)
        .read_to_end(&mut data)
        .context("Failed to read vbmeta image")?;
    set_vbmeta_flags(&mut data, vbmeta_in_boot, disable_verity, disable_verification)?;

    let mut tmp = tempfile::tempfile().context("Failed to create temp file")?;
    tmp.write_all(&data).context("Failed to write rewritten vbmeta")?;
    tmp.seek(SeekFrom::Start(0))?;
    buf.file = tmp;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FileType;

    fn vbmeta(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        data[..4].copy_from_slice(AVB_MAGIC);
        data[200] = 0x5a;
        data
    }

    fn changed_bytes(before: &[u8], after: &[u8]) -> Vec<usize> {
        assert_eq!(before.len(), after.len());
        (0..before.len()).filter(|&i| before[i] != after[i]).collect()
    }

    fn fd_buffer(data: &[u8]) -> FastbootBuffer {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        FastbootBuffer {
            file,
            size: data.len() as u64,
            image_size: data.len() as u64,
            file_type: FileType::Raw,
            kind: BufferKind::Fd,
        }
    }

    fn contents(buf: &mut FastbootBuffer) -> Vec<u8> {
        let mut data = Vec::new();
        buf.file.seek(SeekFrom::Start(0)).unwrap();
        buf.file.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn flags_are_set_in_a_vbmeta_image() {
        let original = vbmeta(512);

        let mut data = original.clone();
        set_vbmeta_flags(&mut data, false, true, true).unwrap();
        assert_eq!(data[123], 0x03);
        assert_eq!(changed_bytes(&original, &data), [123]);

        let mut data = original.clone();
        set_vbmeta_flags(&mut data, false, true, false).unwrap();
        assert_eq!(data[123], AVB_VBMETA_IMAGE_FLAGS_HASHTREE_DISABLED);

        let mut data = original.clone();
        set_vbmeta_flags(&mut data, false, false, true).unwrap();
        assert_eq!(data[123], AVB_VBMETA_IMAGE_FLAGS_VERIFICATION_DISABLED);
    }

    #[test]
    fn boot_images_are_patched_through_their_footer() {
        let mut original = vec![0x11u8; 8192];
        original[4096..4100].copy_from_slice(AVB_MAGIC);
        let footer = original.len() - AVB_FOOTER_SIZE as usize;
        original[footer..footer + 4].copy_from_slice(AVB_FOOTER_MAGIC);
        original[footer + 20..footer + 28].copy_from_slice(&4096u64.to_be_bytes());
        assert_eq!(footer_vbmeta_offset(&original).unwrap(), 4096);

        let mut data = original.clone();
        set_vbmeta_flags(&mut data, true, true, true).unwrap();
        assert_eq!(data[4096 + 123], 0x11 | 0x03);
        assert_eq!(changed_bytes(&original, &data), [4096 + 123]);
    }

    #[test]
    fn buffers_too_short_for_a_header_are_left_alone() {
        // no magic: rewriting would fail if the buffer were looked at
        let short = vec![0u8; VBMETA_MIN_SIZE as usize - 1];
        let mut buf = fd_buffer(&short);
        rewrite_vbmeta_buffer(&mut buf, false, true, true).unwrap();
        assert_eq!(contents(&mut buf), short);

        let mut buf = fd_buffer(&vbmeta(VBMETA_MIN_SIZE as usize));
        rewrite_vbmeta_buffer(&mut buf, false, true, true).unwrap();
        assert_eq!(contents(&mut buf)[123], 0x03);
    }

    #[test]
    fn vbmeta_partition_names() {
        assert!(is_vbmeta_partition("vbmeta"));
        assert!(is_vbmeta_partition("vbmeta_system_a"));
        assert!(!is_vbmeta_partition("boot"));
        assert!(!is_vbmeta_partition("vbmeta_c"));
    }

    #[test]
    fn missing_magic_is_fatal() {
        let mut data = vec![0u8; 512];
        assert!(set_vbmeta_flags(&mut data, false, true, false).is_err());
        assert!(set_vbmeta_flags(&mut data, true, true, false).is_err());
    }
}
