use anyhow::{bail, Context, Result};
use std::{fs::File, io::Seek, io::SeekFrom};

use crate::flash::flash_local_file;
use crate::lp::{layout, LpMetadata, LP_BLOCK_DEVICE_SLOT_SUFFIXED};
use crate::plan::FlashingPlan;
use crate::slot::do_for_partitions;
use crate::utils::{parse_numeric_var, parse_u64_any};

pub fn is_logical(plan: &mut FlashingPlan, partition: &str) -> bool {
    matches!(
        plan.driver.get_var(&format!("is-logical:{partition}")).as_deref(),
        Ok("yes")
    )
}

pub fn is_userspace_fastboot(plan: &mut FlashingPlan) -> bool {
    matches!(plan.driver.get_var("is-userspace").as_deref(), Ok("yes"))
}

/// Size of a physical partition, or 0 when the device will not say. Not
/// knowing the size of a logical partition is an error.
pub fn get_partition_size(plan: &mut FlashingPlan, partition: &str) -> Result<u64> {
    let size = plan
        .driver
        .get_var(&format!("partition-size:{partition}"))
        .ok()
        .and_then(|v| parse_numeric_var(&v).ok());
    match size {
        Some(size) => Ok(size),
        None if is_logical(plan, partition) => {
            bail!("Could not get size of partition {partition}")
        }
        None => Ok(0),
    }
}

/// The dynamic partition metadata shipped with the images, if any.
pub fn super_empty_metadata(plan: &FlashingPlan) -> Result<Option<LpMetadata>> {
    let Some(blob) = plan.read_image_file("super_empty.img")? else {
        return Ok(None);
    };
    LpMetadata::from_image_blob(&blob)
        .map(Some)
        .context("failed to parse super_empty.img")
}

/// Whether `partition` lives in super and must be written by userspace
/// fastboot.
pub fn should_flash_in_userspace(plan: &FlashingPlan, partition: &str) -> bool {
    match super_empty_metadata(plan) {
        Ok(Some(metadata)) => metadata.should_flash_in_userspace(partition),
        Ok(None) => false,
        Err(e) => {
            debug!("{e:#}");
            false
        }
    }
}

pub fn reboot_to_userspace_fastboot(plan: &mut FlashingPlan) -> Result<()> {
    plan.driver.reboot_to("fastboot")?;
    plan.driver
        .reconnect()
        .context("failed to reconnect after rebooting to fastbootd")?;
    if !is_userspace_fastboot(plan) {
        bail!("Failed to boot into userspace fastboot; one or more components might be unbootable.");
    }
    // download limits differ between the bootloader and fastbootd
    plan.reset_target_limits();
    Ok(())
}

/// Reads `partition` back into `file` in `max-fetch-size` pieces.
pub fn fetch_partition(plan: &mut FlashingPlan, partition: &str, file: &mut File) -> Result<u64> {
    let fetch_size = plan
        .driver
        .get_var("max-fetch-size")
        .ok()
        .and_then(|v| parse_u64_any(&v).ok())
        .unwrap_or(0);
    if fetch_size == 0 {
        bail!("Unable to get max-fetch-size. Device does not support fetch command.");
    }
    let partition_size = get_partition_size(plan, partition)?;
    if partition_size == 0 {
        bail!("Invalid partition size for partition {partition}");
    }

    file.seek(SeekFrom::Start(0))?;
    let mut offset = 0u64;
    while offset < partition_size {
        let chunk = fetch_size.min(partition_size - offset);
        plan.driver
            .fetch_to_file(partition, file, offset, chunk)
            .with_context(|| format!("Unable to fetch {partition}"))?;
        offset += chunk;
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(partition_size)
}

/// Writes an empty dynamic partition layout to every super block device.
pub fn wipe_super(plan: &mut FlashingPlan, metadata: &LpMetadata, slot: &str) -> Result<()> {
    let super_device = metadata.super_device()?;
    if super_device.partition_name != "super" {
        // retrofit bootloaders may reject this; flashing is attempted anyway
        if let Err(e) = plan.driver.raw_command("oem allow-flash-super", "") {
            warn!("could not enable flashing of {}: {e:#}", super_device.partition_name);
        }
    }

    let images = layout::empty_images(metadata)?;
    let dir = tempfile::Builder::new()
        .prefix("fbtool_wipe_super_")
        .tempdir()
        .context("Failed to create temporary directory")?;
    let split = images.len() > 1;

    for ((name, image), device) in images.into_iter().zip(&metadata.block_devices) {
        let file_name = if split {
            format!("super_{name}.img")
        } else {
            format!("{name}.img")
        };
        let path = dir.path().join(file_name);
        {
            let mut out = std::io::BufWriter::new(
                File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?,
            );
            image.write_sparse(&mut out)?;
            std::io::Write::flush(&mut out)?;
        }
        let force_slot = device.flags & LP_BLOCK_DEVICE_SLOT_SUFFIXED != 0;
        do_for_partitions(plan, &name, slot, force_slot, |plan, partition| {
            flash_local_file(plan, partition, &path)
        })?;
        std::fs::remove_file(&path).ok();
    }
    Ok(())
}
