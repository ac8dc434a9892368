use anyhow::{bail, Result};

use super::{
    Extent, LpMetadata, LP_METADATA_GEOMETRY_SIZE, LP_PARTITION_RESERVED_BYTES, LP_SECTOR_SIZE,
    LP_TARGET_TYPE_LINEAR,
};
use crate::sparse::SparseFile;
use crate::utils::align_up;

/// Geometry twice, then every metadata slot, primary copies first.
pub fn metadata_region(metadata: &LpMetadata) -> Result<Vec<u8>> {
    let geometry = metadata.serialize_geometry();
    let mut blob = metadata.serialize_metadata()?;
    blob.resize(metadata.geometry.metadata_max_size as usize, 0);

    let slots = metadata.geometry.metadata_slot_count as usize * 2;
    let mut region = Vec::with_capacity(LP_METADATA_GEOMETRY_SIZE * 2 + blob.len() * slots);
    region.extend_from_slice(&geometry);
    region.extend_from_slice(&geometry);
    for _ in 0..slots {
        region.extend_from_slice(&blob);
    }
    Ok(region)
}

/// Adds the metadata region at its fixed offset on the super device.
fn add_metadata(image: &mut SparseFile, metadata: &LpMetadata) -> Result<()> {
    let block_size = image.block_size() as u64;
    let first_block = LP_PARTITION_RESERVED_BYTES / block_size;
    let pad = (LP_PARTITION_RESERVED_BYTES - first_block * block_size) as usize;
    let mut data = vec![0u8; pad];
    data.extend_from_slice(&metadata_region(metadata)?);
    image.add_data(data, first_block as u32)
}

/// One sparse image per block device describing an empty dynamic partition
/// layout: only the metadata is written, everything else is don't care.
pub fn empty_images(metadata: &LpMetadata) -> Result<Vec<(String, SparseFile)>> {
    let block_size = metadata.geometry.logical_block_size;
    let mut images = Vec::with_capacity(metadata.block_devices.len());
    for (index, device) in metadata.block_devices.iter().enumerate() {
        if device.size % block_size as u64 != 0 {
            bail!(
                "block device {} size {} is not a multiple of the block size {}",
                device.partition_name,
                device.size,
                block_size
            );
        }
        let mut image = SparseFile::new(block_size, device.size)?;
        if index == 0 {
            add_metadata(&mut image, metadata)?;
        }
        images.push((device.partition_name.clone(), image));
    }
    Ok(images)
}

/// A piece of the laid out super image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutExtent {
    /// Metadata bytes placed at `offset`.
    Metadata { offset: u64 },
    /// The contents of `image_name` placed at `offset`.
    Partition {
        offset: u64,
        size: u64,
        image_name: String,
    },
}

/// Allocates space for partition images inside super and rewrites the
/// metadata to match, so the whole super partition can be flashed at once.
pub struct SuperLayoutBuilder {
    metadata: LpMetadata,
    images: Vec<(String, String, u64)>,
}

impl SuperLayoutBuilder {
    /// Returns `None` for layouts spanning several block devices, which
    /// cannot be flashed as a single image.
    pub fn open(metadata: LpMetadata) -> Option<Self> {
        if metadata.block_devices.len() != 1 {
            debug!("super layout spans {} block devices", metadata.block_devices.len());
            return None;
        }
        Some(Self {
            metadata,
            images: Vec::new(),
        })
    }

    pub fn metadata(&self) -> &LpMetadata {
        &self.metadata
    }

    pub fn add_partition(&mut self, partition: &str, image_name: &str, size: u64) -> Result<()> {
        if !self.metadata.partitions.iter().any(|p| p.name == partition) {
            bail!("partition {partition} is not in the super layout");
        }
        if self.images.iter().any(|(p, _, _)| p == partition) {
            bail!("partition {partition} added twice");
        }
        self.images
            .push((partition.to_string(), image_name.to_string(), size));
        Ok(())
    }

    /// Assigns one linear extent per added partition, in metadata order,
    /// and returns the updated metadata with the image layout.
    pub fn build(&self) -> Result<(LpMetadata, Vec<LayoutExtent>)> {
        let mut metadata = self.metadata.clone();
        let device = metadata.super_device()?.clone();
        let block_size = metadata.geometry.logical_block_size as u64;
        let alignment = (device.alignment as u64).max(block_size);

        let metadata_end = LP_PARTITION_RESERVED_BYTES
            + 2 * LP_METADATA_GEOMETRY_SIZE as u64
            + 2 * metadata.geometry.metadata_slot_count as u64
                * metadata.geometry.metadata_max_size as u64;
        let first = (device.first_logical_sector * LP_SECTOR_SIZE).max(metadata_end);
        let mut cursor = align_up(first, alignment);

        let mut extents = Vec::new();
        let mut layout = vec![LayoutExtent::Metadata {
            offset: LP_PARTITION_RESERVED_BYTES,
        }];
        let mut group_usage = vec![0u64; metadata.groups.len()];

        for partition in metadata.partitions.iter_mut() {
            partition.first_extent_index = extents.len() as u32;
            partition.num_extents = 0;
            let Some((_, image_name, size)) = self.images.iter().find(|(p, _, _)| *p == partition.name)
            else {
                continue;
            };
            let allocated = align_up(*size, block_size);
            if allocated == 0 {
                continue;
            }
            let group = partition.group_index as usize;
            group_usage[group] += allocated;
            let max = metadata.groups[group].maximum_size;
            if max > 0 && group_usage[group] > max {
                bail!(
                    "partition {} does not fit in group {} ({} > {})",
                    partition.name,
                    metadata.groups[group].name,
                    group_usage[group],
                    max
                );
            }
            let end = cursor + allocated;
            if end > device.size {
                bail!(
                    "not enough space in {} for {} ({} bytes needed)",
                    device.partition_name,
                    partition.name,
                    allocated
                );
            }
            extents.push(Extent {
                num_sectors: allocated / LP_SECTOR_SIZE,
                target_type: LP_TARGET_TYPE_LINEAR,
                target_data: cursor / LP_SECTOR_SIZE,
                target_source: 0,
            });
            partition.num_extents = 1;
            layout.push(LayoutExtent::Partition {
                offset: cursor,
                size: *size,
                image_name: image_name.clone(),
            });
            cursor = align_up(end, alignment);
        }
        metadata.extents = extents;
        Ok((metadata, layout))
    }

    /// The super image with the metadata written in; partition contents are
    /// added by the caller at the offsets from [`Self::build`].
    pub fn base_image(&self, metadata: &LpMetadata) -> Result<SparseFile> {
        let device = metadata.super_device()?;
        let mut image = SparseFile::new(metadata.geometry.logical_block_size, device.size)?;
        add_metadata(&mut image, metadata)?;
        Ok(image)
    }
}
