use anyhow::{anyhow, bail, Context, Result};
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
};

use rsext4::error::{BlockDevError, BlockDevResult};
use rsext4::{mkfs, BlockDevice, Jbd2Dev, BLOCK_SIZE};

use crate::avb::is_vbmeta_partition;
use crate::buffer::load_buf_fd;
use crate::flash::flash_buf;
use crate::plan::{FlashingPlan, FsOptions};
use crate::utils::{parse_numeric_var, parse_u64_any};

/// A temporary image file seen as a block device by the ext4 writer.
struct ImageBlockDev {
    file: File,
    total_blocks: u64,
    block_size: u32,
    opened: bool,
}

impl ImageBlockDev {
    fn new(file: File, total_blocks: u64, block_size: u32) -> Self {
        Self {
            file,
            total_blocks,
            block_size,
            opened: true,
        }
    }

    fn locate(&mut self, block_id: u32, count: u32, len: usize) -> BlockDevResult<usize> {
        if !self.opened {
            return Err(BlockDevError::DeviceClosed);
        }
        if block_id as u64 + count as u64 > self.total_blocks {
            return Err(BlockDevError::BlockOutOfRange {
                block_id,
                max_blocks: self.total_blocks,
            });
        }
        let required = self.block_size as usize * count as usize;
        if len < required {
            return Err(BlockDevError::BufferTooSmall {
                provided: len,
                required,
            });
        }
        self.file
            .seek(SeekFrom::Start(block_id as u64 * self.block_size as u64))
            .map_err(|_| BlockDevError::IoError)?;
        Ok(required)
    }
}

impl BlockDevice for ImageBlockDev {
    fn write(&mut self, buffer: &[u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        let len = self.locate(block_id, count, buffer.len())?;
        self.file
            .write_all(&buffer[..len])
            .map_err(|_| BlockDevError::WriteError)
    }

    fn read(&mut self, buffer: &mut [u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        let len = self.locate(block_id, count, buffer.len())?;
        self.file
            .read_exact(&mut buffer[..len])
            .map_err(|_| BlockDevError::ReadError)
    }

    fn open(&mut self) -> BlockDevResult<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> BlockDevResult<()> {
        self.opened = false;
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn flush(&mut self) -> BlockDevResult<()> {
        self.file.flush().map_err(|_| BlockDevError::IoError)
    }

    fn is_open(&self) -> bool {
        self.opened
    }
}

/// Filesystems this tool can build images for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsGenerator {
    Ext4,
}

impl FsGenerator {
    pub fn for_type(fs_type: &str) -> Option<Self> {
        match fs_type {
            "ext4" => Some(FsGenerator::Ext4),
            _ => None,
        }
    }

    /// Writes an empty filesystem of `size` bytes into `file`.
    pub fn generate(
        self,
        file: &File,
        size: u64,
        erase_block_size: u32,
        logical_block_size: u32,
        options: FsOptions,
    ) -> Result<()> {
        match self {
            FsGenerator::Ext4 => {
                if !options.is_empty() {
                    warn!("ext4 generator ignores fs options {options:?}");
                }
                if logical_block_size != 0 && logical_block_size != BLOCK_SIZE as u32 {
                    debug!("device logical block size {logical_block_size}, ext4 uses {BLOCK_SIZE}");
                }
                debug!("erase block size {erase_block_size}");
                let block_size = BLOCK_SIZE as u64;
                let usable = size - size % block_size;
                if usable < block_size * 16 {
                    bail!("partition too small for ext4");
                }
                file.set_len(size).context("Failed to size filesystem image")?;
                let dev = ImageBlockDev::new(file.try_clone()?, usable / block_size, BLOCK_SIZE as u32);
                let mut jbd = Jbd2Dev::initial_jbd2dev(0, dev, false);
                mkfs(&mut jbd).map_err(|e| anyhow!("mkfs ext4 failed: {e:?}"))?;
                jbd.cantflush().map_err(|e| anyhow!("flush failed: {e:?}"))?;
                Ok(())
            }
        }
    }
}

/// Reads a power-of-two block size variable; 0 when absent or invalid.
fn get_flash_block_size(plan: &mut FlashingPlan, name: &str) -> u32 {
    let Ok(value) = plan.driver.get_var(name) else {
        return 0;
    };
    if value.trim().is_empty() {
        return 0;
    }
    let size = match parse_numeric_var(&value).ok().and_then(|v| u32::try_from(v).ok()) {
        Some(size) => size,
        None => {
            warn!("Couldn't parse {name} '{value}'.");
            return 0;
        }
    };
    if !size.is_power_of_two() {
        warn!("Invalid {name} {size}: must be a power of 2.");
        return 0;
    }
    size
}

/// Builds an empty filesystem image for `partition` and flashes it.
///
/// With `skip_if_not_supported` a partition whose type or size cannot be
/// determined, or whose filesystem cannot be generated, is left erased
/// with a warning instead of failing.
pub fn fb_perform_format(
    plan: &mut FlashingPlan,
    partition: &str,
    skip_if_not_supported: bool,
    type_override: &str,
    size_override: &str,
) -> Result<()> {
    let partition_type = match plan.driver.get_var(&format!("partition-type:{partition}")) {
        Ok(t) => t,
        Err(_) => return format_failed(plan, skip_if_not_supported, "Can't determine partition type."),
    };
    let partition_type = if type_override.is_empty() {
        partition_type
    } else {
        if partition_type != type_override {
            warn!(
                "{partition} type is {partition_type}, but {type_override} was requested for formatting."
            );
        }
        type_override.to_string()
    };

    let partition_size = match plan.driver.get_var(&format!("partition-size:{partition}")) {
        Ok(s) => s,
        Err(_) => return format_failed(plan, skip_if_not_supported, "Unable to get partition size"),
    };
    let partition_size = if size_override.is_empty() {
        partition_size
    } else {
        if partition_size != size_override {
            warn!(
                "{partition} size is {partition_size}, but {size_override} was requested for formatting."
            );
        }
        size_override.to_string()
    };

    let Some(generator) = FsGenerator::for_type(&partition_type) else {
        if skip_if_not_supported {
            warn!("Erase successful, but not automatically formatting.");
            warn!("File system type {partition_type} not supported.");
            return Ok(());
        }
        bail!("Formatting is not supported for file system with type '{partition_type}'.");
    };

    let size = parse_u64_any(partition_size.trim())
        .map_err(|_| anyhow!("Couldn't parse partition size '{partition_size}'."))?;
    let erase_block_size = get_flash_block_size(plan, "erase-block-size");
    let logical_block_size = get_flash_block_size(plan, "logical-block-size");

    let output = tempfile::tempfile().context("Failed to create temp file")?;
    generator
        .generate(&output, size, erase_block_size, logical_block_size, plan.fs_options)
        .with_context(|| format!("Cannot generate image for {partition}"))?;

    let mut buf = load_buf_fd(output, plan)
        .with_context(|| format!("Cannot read image for {partition}"))?;
    flash_buf(plan, partition, &mut buf, is_vbmeta_partition(partition))
}

fn format_failed(plan: &FlashingPlan, skip_if_not_supported: bool, message: &str) -> Result<()> {
    if skip_if_not_supported {
        warn!("Erase successful, but not automatically formatting.");
        warn!("{message}");
        warn!("FAILED ({})", plan.driver.last_error());
        return Ok(());
    }
    bail!("{message} FAILED ({})", plan.driver.last_error());
}
