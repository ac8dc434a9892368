use anyhow::{bail, Context, Result};
use std::{
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::avb::{self, AVB_FOOTER_SIZE};
use crate::buffer::{load_buf, load_buf_fd, BufferKind, FastbootBuffer, FileType};
use crate::partition::{fetch_partition, get_partition_size, is_logical, should_flash_in_userspace};
use crate::plan::FlashingPlan;
use crate::sparse::SparseFile;
use crate::vendor_boot::replace_vendor_ramdisk;

fn has_vbmeta_partition(plan: &mut FlashingPlan) -> bool {
    ["vbmeta", "vbmeta_a", "vbmeta_b"]
        .iter()
        .any(|p| plan.driver.get_var(&format!("partition-type:{p}")).is_ok())
}

/// Moves the AVB footer of a short image to the end of its physical
/// partition, where the bootloader looks for it.
pub fn copy_avb_footer(plan: &mut FlashingPlan, partition: &str, buf: &mut FastbootBuffer) -> Result<()> {
    if !matches!(buf.kind, BufferKind::Fd) || buf.size < AVB_FOOTER_SIZE {
        return Ok(());
    }
    if is_logical(plan, partition) || should_flash_in_userspace(plan, partition) {
        return Ok(());
    }
    // sparse images are expanded on the device; their footer cannot be moved here
    if buf.file_type == FileType::Sparse {
        warn!("skip copying {partition} image avb footer due to sparse image");
        return Ok(());
    }

    let partition_size = get_partition_size(plan, partition)?;
    if partition_size == buf.size {
        return Ok(());
    }
    if partition_size < buf.size {
        warn!("skip copying {partition} image avb footer, image is larger than the partition");
        return Ok(());
    }

    let mut data = Vec::with_capacity(buf.size as usize);
    buf.file.seek(SeekFrom::Start(0))?;
    (&mut buf.file)
        .take(buf.size)
        .read_to_end(&mut data)
        .with_context(|| format!("Failed to read {partition} image"))?;
    if !avb::has_footer_magic(&data) {
        buf.file.seek(SeekFrom::Start(0))?;
        return Ok(());
    }

    let footer = data[data.len() - AVB_FOOTER_SIZE as usize..].to_vec();
    let mut tmp = tempfile::tempfile().context("Failed to create temp file")?;
    tmp.write_all(&data)?;
    tmp.seek(SeekFrom::Start(partition_size - AVB_FOOTER_SIZE))?;
    tmp.write_all(&footer)?;
    tmp.set_len(partition_size)?;
    tmp.seek(SeekFrom::Start(0))?;
    buf.file = tmp;
    buf.size = partition_size;
    Ok(())
}

/// Sends every chunk of a resparsed image.
pub fn flash_partition_files(plan: &mut FlashingPlan, partition: &str, files: &[SparseFile]) -> Result<()> {
    for (i, sparse) in files.iter().enumerate() {
        let size = sparse.encoded_len();
        plan.driver
            .flash_sparse(partition, sparse, size, i + 1, files.len())?;
    }
    Ok(())
}

pub fn flash_buf(
    plan: &mut FlashingPlan,
    partition: &str,
    buf: &mut FastbootBuffer,
    apply_vbmeta: bool,
) -> Result<()> {
    if !plan.is_capturing() {
        copy_avb_footer(plan, partition, buf)?;
    }

    if plan.disable_verity || plan.disable_verification {
        let (verity, verification) = (plan.disable_verity, plan.disable_verification);
        if apply_vbmeta {
            avb::rewrite_vbmeta_buffer(buf, false, verity, verification)?;
        } else if matches!(partition, "boot" | "boot_a" | "boot_b") && !has_vbmeta_partition(plan) {
            avb::rewrite_vbmeta_buffer(buf, true, verity, verification)?;
        }
    }

    match &buf.kind {
        BufferKind::Sparse(files) => flash_partition_files(plan, partition, files),
        BufferKind::Fd => {
            buf.file.seek(SeekFrom::Start(0))?;
            plan.driver.flash_partition(partition, &mut buf.file, buf.size)
        }
    }
}

/// For `vendor_boot[_a|_b]:<ramdisk>` targets, splices the image into the
/// vendor_boot currently on the device and returns the partition to flash.
fn repack_ramdisk(plan: &mut FlashingPlan, partition: &str, buf: &mut FastbootBuffer) -> Result<String> {
    let is_overlay = ["vendor_boot:", "vendor_boot_a:", "vendor_boot_b:"]
        .iter()
        .any(|prefix| partition.starts_with(prefix));
    if !is_overlay {
        return Ok(partition.to_string());
    }
    if !matches!(buf.kind, BufferKind::Fd) {
        bail!("Flashing sparse vendor ramdisk image is not supported.");
    }
    if buf.size == 0 {
        bail!("repack_ramdisk() sees an empty image");
    }
    let (base, ramdisk) = partition
        .split_once(':')
        .context("vendor ramdisk target without a ramdisk name")?;

    let mut fetched = tempfile::tempfile().context("Failed to create temp file")?;
    let vendor_boot_size = fetch_partition(plan, base, &mut fetched)?;
    let mut vendor_boot = Vec::with_capacity(vendor_boot_size as usize);
    fetched.read_to_end(&mut vendor_boot)?;

    let mut new_ramdisk = Vec::with_capacity(buf.size as usize);
    buf.file.seek(SeekFrom::Start(0))?;
    (&mut buf.file).take(buf.size).read_to_end(&mut new_ramdisk)?;

    let mut repacked = replace_vendor_ramdisk(&vendor_boot, ramdisk, &new_ramdisk)?;
    if repacked.len() as u64 > vendor_boot_size {
        bail!("repacked {base} does not fit in the partition");
    }
    repacked.resize(vendor_boot_size as usize, 0);

    let mut tmp = tempfile::tempfile().context("Failed to create temp file")?;
    tmp.write_all(&repacked)?;
    tmp.seek(SeekFrom::Start(0))?;
    buf.file = tmp;
    buf.size = vendor_boot_size;
    buf.image_size = vendor_boot_size;
    Ok(base.to_string())
}

/// Flashes an image named `file_name`, read from the plan's image source
/// if one is bound, else from the local filesystem.
pub fn do_flash(plan: &mut FlashingPlan, partition: &str, file_name: &str, apply_vbmeta: bool) -> Result<()> {
    debug!("Do flash {partition} {file_name}");
    let from_source = match &plan.source {
        Some(source) => {
            let file = source
                .open_file(file_name)?
                .with_context(|| format!("could not load '{file_name}'"))?;
            let signature_name = format!("{}.sig", file_name.split('.').next().unwrap_or(file_name));
            Some((file, source.read_file(&signature_name)?))
        }
        None => None,
    };
    let mut buf = match from_source {
        Some((file, signature)) => {
            let buf = load_buf_fd(file, plan)
                .with_context(|| format!("could not load '{file_name}'"))?;
            if let Some(signature) = signature {
                if plan.is_capturing() {
                    bail!("unexpected signature {file_name}");
                }
                plan.driver.download("signature", &signature)?;
                plan.driver.raw_command("signature", "installing signature")?;
            }
            buf
        }
        None => load_buf(Path::new(file_name), plan)?,
    };
    flash_loaded(plan, partition, &mut buf, apply_vbmeta)
}

/// Flashes a file from the local filesystem, ignoring any image source.
pub fn flash_local_file(plan: &mut FlashingPlan, partition: &str, path: &Path) -> Result<()> {
    let mut buf = load_buf(path, plan)?;
    flash_loaded(plan, partition, &mut buf, false)
}

fn flash_loaded(
    plan: &mut FlashingPlan,
    partition: &str,
    buf: &mut FastbootBuffer,
    apply_vbmeta: bool,
) -> Result<()> {
    if is_logical(plan, partition) {
        plan.driver
            .resize_partition(partition, &buf.image_size.to_string())?;
    }
    let target = if plan.is_capturing() {
        partition.to_string()
    } else {
        repack_ramdisk(plan, partition, buf)?
    };
    flash_buf(plan, &target, buf, apply_vbmeta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::SimulatedDevice;

    const IMAGE_LEN: usize = 8192;

    fn footed_image() -> Vec<u8> {
        let mut data: Vec<u8> = (0..IMAGE_LEN).map(|i| (i % 241) as u8).collect();
        let footer = IMAGE_LEN - AVB_FOOTER_SIZE as usize;
        data[footer..footer + 4].copy_from_slice(avb::AVB_FOOTER_MAGIC);
        data
    }

    fn buffer(data: &[u8], file_type: FileType) -> FastbootBuffer {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        FastbootBuffer {
            file,
            size: data.len() as u64,
            image_size: data.len() as u64,
            file_type,
            kind: BufferKind::Fd,
        }
    }

    fn plan_with(vars: &[(&str, &str)]) -> FlashingPlan {
        let device = SimulatedDevice::with_vars(vars.iter().copied());
        FlashingPlan::new(Box::new(device))
    }

    fn contents(buf: &mut FastbootBuffer) -> Vec<u8> {
        let mut data = Vec::new();
        buf.file.seek(SeekFrom::Start(0)).unwrap();
        buf.file.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn footer_moves_to_the_end_of_the_partition() {
        let image = footed_image();
        let mut plan = plan_with(&[("partition-size:boot", "0x4000")]);
        let mut buf = buffer(&image, FileType::Raw);
        copy_avb_footer(&mut plan, "boot", &mut buf).unwrap();

        assert_eq!(buf.size, 0x4000);
        let data = contents(&mut buf);
        assert_eq!(data.len(), 0x4000);
        assert_eq!(&data[..IMAGE_LEN], &image[..]);
        assert!(data[IMAGE_LEN..0x4000 - 64].iter().all(|&b| b == 0));
        assert_eq!(&data[0x4000 - 64..], &image[IMAGE_LEN - 64..]);
    }

    #[test]
    fn images_that_need_no_move_are_untouched() {
        let image = footed_image();
        let mut no_footer = image.clone();
        no_footer[IMAGE_LEN - 64] = 0;

        let cases: [(&[(&str, &str)], &[u8], FileType); 4] = [
            (&[("partition-size:boot", "0x4000")], &image[..], FileType::Sparse),
            (&[("partition-size:boot", "0x2000")], &image[..], FileType::Raw),
            (
                &[("partition-size:boot", "0x4000"), ("is-logical:boot", "yes")],
                &image[..],
                FileType::Raw,
            ),
            (&[("partition-size:boot", "0x4000")], &no_footer[..], FileType::Raw),
        ];
        for (vars, data, file_type) in cases {
            let mut plan = plan_with(vars);
            let mut buf = buffer(data, file_type);
            copy_avb_footer(&mut plan, "boot", &mut buf).unwrap();
            assert_eq!(buf.size, IMAGE_LEN as u64);
            assert_eq!(contents(&mut buf), data);
        }
    }
}
