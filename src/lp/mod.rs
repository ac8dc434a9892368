//! Logical partition ("super") metadata.
//!
//! Enough of the on-disk format to read `super_empty.img`, answer which
//! partitions live inside super, and write the metadata back out with new
//! extents.

pub mod layout;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

pub const LP_METADATA_GEOMETRY_MAGIC: u32 = 0x616c_4467;
pub const LP_METADATA_GEOMETRY_SIZE: usize = 4096;
pub const LP_METADATA_HEADER_MAGIC: u32 = 0x414c_5030;
pub const LP_METADATA_MAJOR_VERSION: u16 = 10;
pub const LP_METADATA_MINOR_VERSION_MAX: u16 = 2;
pub const LP_SECTOR_SIZE: u64 = 512;
/// Bytes at the start of the super device left for a boot loader.
pub const LP_PARTITION_RESERVED_BYTES: u64 = 4096;

pub const LP_PARTITION_ATTR_READONLY: u32 = 1 << 0;
pub const LP_PARTITION_ATTR_SLOT_SUFFIXED: u32 = 1 << 1;
pub const LP_BLOCK_DEVICE_SLOT_SUFFIXED: u32 = 1 << 0;
pub const LP_TARGET_TYPE_LINEAR: u32 = 0;

const GEOMETRY_STRUCT_SIZE: usize = 52;
const HEADER_V1_0_SIZE: usize = 128;
const HEADER_V1_2_SIZE: usize = 256;
const PARTITION_ENTRY_SIZE: usize = 52;
const EXTENT_ENTRY_SIZE: usize = 24;
const GROUP_ENTRY_SIZE: usize = 48;
const BLOCK_DEVICE_ENTRY_SIZE: usize = 64;
const NAME_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub metadata_max_size: u32,
    pub metadata_slot_count: u32,
    pub logical_block_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub attributes: u32,
    pub first_extent_index: u32,
    pub num_extents: u32,
    pub group_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub num_sectors: u64,
    pub target_type: u32,
    pub target_data: u64,
    pub target_source: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionGroup {
    pub name: String,
    pub flags: u32,
    pub maximum_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub first_logical_sector: u64,
    pub alignment: u32,
    pub alignment_offset: u32,
    pub size: u64,
    pub partition_name: String,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LpMetadata {
    pub geometry: Geometry,
    pub minor_version: u16,
    pub header_flags: u32,
    pub partitions: Vec<Partition>,
    pub extents: Vec<Extent>,
    pub groups: Vec<PartitionGroup>,
    pub block_devices: Vec<BlockDevice>,
}

impl LpMetadata {
    /// Parses an image blob: the geometry block followed by one metadata
    /// copy, as found in `super_empty.img`.
    pub fn from_image_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() < LP_METADATA_GEOMETRY_SIZE {
            bail!("metadata image is too small ({} bytes)", blob.len());
        }
        let geometry = parse_geometry(&blob[..LP_METADATA_GEOMETRY_SIZE])?;
        parse_metadata(geometry, &blob[LP_METADATA_GEOMETRY_SIZE..])
    }

    pub fn to_image_blob(&self) -> Result<Vec<u8>> {
        let mut blob = self.serialize_geometry();
        blob.extend_from_slice(&self.serialize_metadata()?);
        Ok(blob)
    }

    /// The block device holding the metadata.
    pub fn super_device(&self) -> Result<&BlockDevice> {
        self.block_devices
            .first()
            .context("metadata does not list any block device")
    }

    /// Whether `partition` is a logical partition described by this
    /// metadata and therefore has to be flashed by userspace fastboot.
    ///
    /// Slot-suffixed entries match both `_a` and `_b` names, since which
    /// slot a retrofit device has populated is unknown.
    pub fn should_flash_in_userspace(&self, partition: &str) -> bool {
        self.partitions.iter().any(|p| {
            if p.attributes & LP_PARTITION_ATTR_SLOT_SUFFIXED != 0 {
                partition == format!("{}_a", p.name) || partition == format!("{}_b", p.name)
            } else {
                p.name == partition
            }
        })
    }

    pub fn serialize_geometry(&self) -> Vec<u8> {
        let mut out = vec![0u8; LP_METADATA_GEOMETRY_SIZE];
        put_u32(&mut out, 0, LP_METADATA_GEOMETRY_MAGIC);
        put_u32(&mut out, 4, GEOMETRY_STRUCT_SIZE as u32);
        put_u32(&mut out, 40, self.geometry.metadata_max_size);
        put_u32(&mut out, 44, self.geometry.metadata_slot_count);
        put_u32(&mut out, 48, self.geometry.logical_block_size);
        let checksum = Sha256::digest(&out[..GEOMETRY_STRUCT_SIZE]);
        out[8..40].copy_from_slice(&checksum);
        out
    }

    /// Header plus tables, with checksums filled in.
    pub fn serialize_metadata(&self) -> Result<Vec<u8>> {
        if self.minor_version > LP_METADATA_MINOR_VERSION_MAX {
            bail!("unsupported metadata minor version {}", self.minor_version);
        }
        let header_size = header_size_for(self.minor_version);

        let mut tables = Vec::new();
        let partitions_offset = tables.len();
        for p in &self.partitions {
            let mut e = [0u8; PARTITION_ENTRY_SIZE];
            put_name(&mut e[..NAME_LEN], &p.name)?;
            put_u32(&mut e, 36, p.attributes);
            put_u32(&mut e, 40, p.first_extent_index);
            put_u32(&mut e, 44, p.num_extents);
            put_u32(&mut e, 48, p.group_index);
            tables.extend_from_slice(&e);
        }
        let extents_offset = tables.len();
        for x in &self.extents {
            let mut e = [0u8; EXTENT_ENTRY_SIZE];
            put_u64(&mut e, 0, x.num_sectors);
            put_u32(&mut e, 8, x.target_type);
            put_u64(&mut e, 12, x.target_data);
            put_u32(&mut e, 20, x.target_source);
            tables.extend_from_slice(&e);
        }
        let groups_offset = tables.len();
        for g in &self.groups {
            let mut e = [0u8; GROUP_ENTRY_SIZE];
            put_name(&mut e[..NAME_LEN], &g.name)?;
            put_u32(&mut e, 36, g.flags);
            put_u64(&mut e, 40, g.maximum_size);
            tables.extend_from_slice(&e);
        }
        let block_devices_offset = tables.len();
        for b in &self.block_devices {
            let mut e = [0u8; BLOCK_DEVICE_ENTRY_SIZE];
            put_u64(&mut e, 0, b.first_logical_sector);
            put_u32(&mut e, 8, b.alignment);
            put_u32(&mut e, 12, b.alignment_offset);
            put_u64(&mut e, 16, b.size);
            put_name(&mut e[24..24 + NAME_LEN], &b.partition_name)?;
            put_u32(&mut e, 60, b.flags);
            tables.extend_from_slice(&e);
        }

        let mut header = vec![0u8; header_size];
        put_u32(&mut header, 0, LP_METADATA_HEADER_MAGIC);
        put_u16(&mut header, 4, LP_METADATA_MAJOR_VERSION);
        put_u16(&mut header, 6, self.minor_version);
        put_u32(&mut header, 8, header_size as u32);
        put_u32(&mut header, 44, tables.len() as u32);
        header[48..80].copy_from_slice(&Sha256::digest(&tables));
        let descriptors = [
            (partitions_offset, self.partitions.len(), PARTITION_ENTRY_SIZE),
            (extents_offset, self.extents.len(), EXTENT_ENTRY_SIZE),
            (groups_offset, self.groups.len(), GROUP_ENTRY_SIZE),
            (block_devices_offset, self.block_devices.len(), BLOCK_DEVICE_ENTRY_SIZE),
        ];
        for (i, (offset, count, size)) in descriptors.into_iter().enumerate() {
            let base = 80 + i * 12;
            put_u32(&mut header, base, offset as u32);
            put_u32(&mut header, base + 4, count as u32);
            put_u32(&mut header, base + 8, size as u32);
        }
        if header_size >= HEADER_V1_2_SIZE {
            put_u32(&mut header, 128, self.header_flags);
        }
        let checksum = Sha256::digest(&header);
        header[12..44].copy_from_slice(&checksum);

        header.extend_from_slice(&tables);
        if header.len() > self.geometry.metadata_max_size as usize {
            bail!(
                "metadata needs {} bytes but only {} are reserved",
                header.len(),
                self.geometry.metadata_max_size
            );
        }
        Ok(header)
    }
}

fn header_size_for(minor: u16) -> usize {
    if minor >= 2 {
        HEADER_V1_2_SIZE
    } else {
        HEADER_V1_0_SIZE
    }
}

fn parse_geometry(buf: &[u8]) -> Result<Geometry> {
    if get_u32(buf, 0) != LP_METADATA_GEOMETRY_MAGIC {
        bail!("logical partition metadata has invalid geometry magic signature");
    }
    let struct_size = get_u32(buf, 4) as usize;
    if !(GEOMETRY_STRUCT_SIZE..=LP_METADATA_GEOMETRY_SIZE).contains(&struct_size) {
        bail!("logical partition metadata has unrecognized geometry size {struct_size}");
    }
    let mut copy = buf[..struct_size].to_vec();
    copy[8..40].fill(0);
    if Sha256::digest(&copy).as_slice() != &buf[8..40] {
        bail!("logical partition metadata has invalid geometry checksum");
    }
    let geometry = Geometry {
        metadata_max_size: get_u32(buf, 40),
        metadata_slot_count: get_u32(buf, 44),
        logical_block_size: get_u32(buf, 48),
    };
    if geometry.metadata_slot_count == 0 {
        bail!("logical partition metadata has no slots");
    }
    if geometry.metadata_max_size as u64 % LP_SECTOR_SIZE != 0 {
        bail!("metadata max size is not sector-aligned");
    }
    if geometry.logical_block_size == 0 || geometry.logical_block_size as u64 % LP_SECTOR_SIZE != 0 {
        bail!("logical block size {} is not sector-aligned", geometry.logical_block_size);
    }
    Ok(geometry)
}

fn parse_metadata(geometry: Geometry, buf: &[u8]) -> Result<LpMetadata> {
    if buf.len() < HEADER_V1_0_SIZE {
        bail!("metadata header is truncated");
    }
    if get_u32(buf, 0) != LP_METADATA_HEADER_MAGIC {
        bail!("logical partition metadata has invalid magic value");
    }
    let major = get_u16(buf, 4);
    let minor = get_u16(buf, 6);
    if major != LP_METADATA_MAJOR_VERSION || minor > LP_METADATA_MINOR_VERSION_MAX {
        bail!("logical partition metadata has incompatible version {major}.{minor}");
    }
    let header_size = get_u32(buf, 8) as usize;
    if header_size != header_size_for(minor) || buf.len() < header_size {
        bail!("logical partition metadata has invalid header size {header_size}");
    }
    let mut header = buf[..header_size].to_vec();
    header[12..44].fill(0);
    if Sha256::digest(&header).as_slice() != &buf[12..44] {
        bail!("logical partition metadata has invalid header checksum");
    }

    let tables_size = get_u32(buf, 44) as usize;
    if header_size + tables_size > buf.len() || header_size + tables_size > geometry.metadata_max_size as usize {
        bail!("logical partition metadata tables are truncated");
    }
    let tables = &buf[header_size..header_size + tables_size];
    if Sha256::digest(tables).as_slice() != &buf[48..80] {
        bail!("logical partition metadata has invalid table checksum");
    }

    let partitions = table(buf, tables, 0, PARTITION_ENTRY_SIZE)?
        .into_iter()
        .map(|e| Partition {
            name: get_name(&e[..NAME_LEN]),
            attributes: get_u32(e, 36),
            first_extent_index: get_u32(e, 40),
            num_extents: get_u32(e, 44),
            group_index: get_u32(e, 48),
        })
        .collect::<Vec<_>>();
    let extents = table(buf, tables, 1, EXTENT_ENTRY_SIZE)?
        .into_iter()
        .map(|e| Extent {
            num_sectors: get_u64(e, 0),
            target_type: get_u32(e, 8),
            target_data: get_u64(e, 12),
            target_source: get_u32(e, 20),
        })
        .collect::<Vec<_>>();
    let groups = table(buf, tables, 2, GROUP_ENTRY_SIZE)?
        .into_iter()
        .map(|e| PartitionGroup {
            name: get_name(&e[..NAME_LEN]),
            flags: get_u32(e, 36),
            maximum_size: get_u64(e, 40),
        })
        .collect::<Vec<_>>();
    let block_devices = table(buf, tables, 3, BLOCK_DEVICE_ENTRY_SIZE)?
        .into_iter()
        .map(|e| BlockDevice {
            first_logical_sector: get_u64(e, 0),
            alignment: get_u32(e, 8),
            alignment_offset: get_u32(e, 12),
            size: get_u64(e, 16),
            partition_name: get_name(&e[24..24 + NAME_LEN]),
            flags: get_u32(e, 60),
        })
        .collect::<Vec<_>>();

    if block_devices.is_empty() {
        bail!("logical partition metadata has no block devices");
    }
    for p in &partitions {
        if p.group_index as usize >= groups.len() {
            bail!("partition {} has invalid group index {}", p.name, p.group_index);
        }
        let end = p.first_extent_index as u64 + p.num_extents as u64;
        if end > extents.len() as u64 {
            bail!("partition {} has invalid extent list", p.name);
        }
    }

    Ok(LpMetadata {
        geometry,
        minor_version: minor,
        header_flags: if header_size >= HEADER_V1_2_SIZE { get_u32(buf, 128) } else { 0 },
        partitions,
        extents,
        groups,
        block_devices,
    })
}

fn table<'a>(header: &[u8], tables: &'a [u8], index: usize, entry_size: usize) -> Result<Vec<&'a [u8]>> {
    let base = 80 + index * 12;
    let offset = get_u32(header, base) as usize;
    let count = get_u32(header, base + 4) as usize;
    let size = get_u32(header, base + 8) as usize;
    if size != entry_size {
        bail!("logical partition metadata table {index} has entry size {size}");
    }
    let end = count
        .checked_mul(size)
        .and_then(|len| len.checked_add(offset))
        .filter(|end| *end <= tables.len())
        .context("logical partition metadata table out of bounds")?;
    Ok(tables[offset..end].chunks_exact(size).collect())
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn get_name(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_name(buf: &mut [u8], name: &str) -> Result<()> {
    if name.len() > buf.len() {
        bail!("name '{name}' is longer than {} bytes", buf.len());
    }
    buf[..name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}
