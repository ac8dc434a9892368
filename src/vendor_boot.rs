//! Replacing one ramdisk inside a vendor_boot image (header v3 and v4).

use anyhow::{bail, Result};

use crate::utils::align_up;

const VENDOR_BOOT_MAGIC: &[u8; 8] = b"VNDRBOOT";
const V3_HEADER_SIZE: usize = 2112;
const V4_HEADER_SIZE: usize = 2128;
const TABLE_ENTRY_V4_SIZE: usize = 108;
const RAMDISK_NAME_OFFSET: usize = 12;
const RAMDISK_NAME_LEN: usize = 32;

struct Header {
    version: u32,
    page_size: u64,
    ramdisk_size: u64,
    header_size: u64,
    dtb_size: u64,
    table_size: u64,
    table_entries: u32,
    table_entry_size: u64,
    bootconfig_size: u64,
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn parse_header(image: &[u8]) -> Result<Header> {
    if image.len() < V3_HEADER_SIZE || &image[..8] != VENDOR_BOOT_MAGIC {
        bail!("not a vendor_boot image");
    }
    let version = get_u32(image, 8);
    if version < 3 {
        bail!("unsupported vendor_boot header version {version}");
    }
    if version >= 4 && image.len() < V4_HEADER_SIZE {
        bail!("truncated vendor_boot v4 header");
    }
    let v4 = version >= 4;
    let header = Header {
        version,
        page_size: get_u32(image, 12) as u64,
        ramdisk_size: get_u32(image, 24) as u64,
        header_size: get_u32(image, 2096) as u64,
        dtb_size: get_u32(image, 2100) as u64,
        table_size: if v4 { get_u32(image, 2112) as u64 } else { 0 },
        table_entries: if v4 { get_u32(image, 2116) } else { 0 },
        table_entry_size: if v4 { get_u32(image, 2120) as u64 } else { 0 },
        bootconfig_size: if v4 { get_u32(image, 2124) as u64 } else { 0 },
    };
    if header.page_size == 0 {
        bail!("vendor_boot image has page size 0");
    }
    Ok(header)
}

fn section(image: &[u8], offset: u64, len: u64) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= image.len() as u64)
        .ok_or_else(|| anyhow::anyhow!("vendor_boot image is truncated"))?;
    Ok(&image[offset as usize..end as usize])
}

fn push_padded(out: &mut Vec<u8>, data: &[u8], page_size: u64) {
    out.extend_from_slice(data);
    out.resize(align_up(out.len() as u64, page_size) as usize, 0);
}

/// Returns a copy of `image` with the ramdisk named `ramdisk_name` replaced
/// by `new_ramdisk`. Header v3 images carry a single ramdisk that can only
/// be addressed as `default`.
pub fn replace_vendor_ramdisk(image: &[u8], ramdisk_name: &str, new_ramdisk: &[u8]) -> Result<Vec<u8>> {
    let hdr = parse_header(image)?;
    let page = hdr.page_size;
    let header_pages = align_up(hdr.header_size, page);
    let ramdisk_off = header_pages;
    let dtb_off = ramdisk_off + align_up(hdr.ramdisk_size, page);
    let table_off = dtb_off + align_up(hdr.dtb_size, page);
    let bootconfig_off = table_off + align_up(hdr.table_size, page);

    let ramdisks = section(image, ramdisk_off, hdr.ramdisk_size)?;
    let dtb = section(image, dtb_off, hdr.dtb_size)?;

    let mut out = Vec::with_capacity(image.len() + new_ramdisk.len());
    let header_bytes = section(image, 0, header_pages)?;

    if hdr.version < 4 {
        if ramdisk_name != "default" {
            bail!("vendor_boot v3 only has a default ramdisk, cannot replace '{ramdisk_name}'");
        }
        push_padded(&mut out, header_bytes, page);
        put_u32(&mut out, 24, new_ramdisk.len() as u32);
        push_padded(&mut out, new_ramdisk, page);
        push_padded(&mut out, dtb, page);
        return Ok(out);
    }

    if hdr.table_entry_size as usize != TABLE_ENTRY_V4_SIZE {
        bail!("unsupported vendor ramdisk table entry size {}", hdr.table_entry_size);
    }
    let mut table = section(image, table_off, hdr.table_size)?.to_vec();
    let bootconfig = section(image, bootconfig_off, hdr.bootconfig_size)?;
    if table.len() < hdr.table_entries as usize * TABLE_ENTRY_V4_SIZE {
        bail!("vendor ramdisk table is truncated");
    }

    let names: Vec<String> = (0..hdr.table_entries as usize)
        .map(|i| {
            let start = i * TABLE_ENTRY_V4_SIZE + RAMDISK_NAME_OFFSET;
            let raw = &table[start..start + RAMDISK_NAME_LEN];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).into_owned()
        })
        .collect();
    let target = match names.iter().position(|n| n == ramdisk_name) {
        Some(i) => i,
        None if ramdisk_name == "default" && names.len() == 1 => 0,
        None => bail!("Vendor ramdisk '{ramdisk_name}' not found"),
    };

    let mut new_ramdisks = Vec::with_capacity(ramdisks.len() + new_ramdisk.len());
    for i in 0..hdr.table_entries as usize {
        let entry = i * TABLE_ENTRY_V4_SIZE;
        let size = get_u32(&table, entry) as u64;
        let offset = get_u32(&table, entry + 4) as u64;
        let data = if i == target {
            new_ramdisk
        } else {
            section(ramdisks, offset, size)?
        };
        put_u32(&mut table, entry, data.len() as u32);
        put_u32(&mut table, entry + 4, new_ramdisks.len() as u32);
        new_ramdisks.extend_from_slice(data);
    }

    push_padded(&mut out, header_bytes, page);
    put_u32(&mut out, 24, new_ramdisks.len() as u32);
    push_padded(&mut out, &new_ramdisks, page);
    push_padded(&mut out, dtb, page);
    push_padded(&mut out, &table, page);
    push_padded(&mut out, bootconfig, page);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_image(ramdisks: &[(&str, &[u8])]) -> Vec<u8> {
        let page = 4096u64;
        let mut header = vec![0u8; V4_HEADER_SIZE];
        header[..8].copy_from_slice(VENDOR_BOOT_MAGIC);
        put_u32(&mut header, 8, 4);
        put_u32(&mut header, 12, page as u32);
        let total: usize = ramdisks.iter().map(|(_, d)| d.len()).sum();
        put_u32(&mut header, 24, total as u32);
        put_u32(&mut header, 2096, V4_HEADER_SIZE as u32);
        put_u32(&mut header, 2112, (ramdisks.len() * TABLE_ENTRY_V4_SIZE) as u32);
        put_u32(&mut header, 2116, ramdisks.len() as u32);
        put_u32(&mut header, 2120, TABLE_ENTRY_V4_SIZE as u32);

        let mut table = Vec::new();
        let mut data = Vec::new();
        for (name, bytes) in ramdisks {
            let mut entry = vec![0u8; TABLE_ENTRY_V4_SIZE];
            put_u32(&mut entry, 0, bytes.len() as u32);
            put_u32(&mut entry, 4, data.len() as u32);
            entry[12..12 + name.len()].copy_from_slice(name.as_bytes());
            table.extend_from_slice(&entry);
            data.extend_from_slice(bytes);
        }
        let mut out = Vec::new();
        push_padded(&mut out, &header, page);
        push_padded(&mut out, &data, page);
        push_padded(&mut out, &table, page);
        out
    }

    #[test]
    fn replaces_named_ramdisk() {
        let image = v4_image(&[("first", b"AAAA"), ("second", b"BBBBBBBB")]);
        let out = replace_vendor_ramdisk(&image, "first", b"CCCCCCCCCCCC").unwrap();
        assert_eq!(get_u32(&out, 24), 20);
        assert_eq!(&out[4096..4116], b"CCCCCCCCCCCCBBBBBBBB");
        let table = &out[8192..];
        assert_eq!(get_u32(table, 0), 12);
        assert_eq!(get_u32(table, TABLE_ENTRY_V4_SIZE + 4), 12);
        assert!(replace_vendor_ramdisk(&image, "third", b"x").is_err());
    }
}
