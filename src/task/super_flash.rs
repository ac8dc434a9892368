use anyhow::{Context, Result};

use super::{RebootTarget, Task};
use crate::buffer::{get_sparse_limit, resparse_file};
use crate::flash::flash_partition_files;
use crate::lp::layout::{LayoutExtent, SuperLayoutBuilder};
use crate::lp::LpMetadata;
use crate::partition::should_flash_in_userspace;
use crate::plan::FlashingPlan;
use crate::slot::supports_ab;
use crate::sparse::SparseFile;
use crate::utils::parse_numeric_var;

/// Flashes every dynamic partition image as one pre-laid-out super image
/// from the bootloader, instead of rebooting to fastbootd and flashing
/// them one by one.
pub struct OptimizedFlashSuperTask {
    super_name: String,
    image: SparseFile,
    partition_size: u64,
}

impl OptimizedFlashSuperTask {
    pub fn super_name(&self) -> &str {
        &self.super_name
    }

    /// Decoded length of the assembled super image.
    pub fn image_len(&self) -> u64 {
        self.image.len()
    }

    /// Tries to fold the dynamic partition flashes of `tasks` into a single
    /// super image. On success the folded tasks are removed from `tasks`
    /// and the new task is returned for the caller to append.
    pub fn initialize(plan: &mut FlashingPlan, tasks: &mut Vec<Task>) -> Result<Option<Task>> {
        if !plan.should_optimize_flash_super {
            info!("super optimization is disabled");
            return Ok(None);
        }
        if !supports_ab(plan.driver.as_mut()) {
            debug!("Cannot optimize flashing super on non-AB device");
            return Ok(None);
        }
        if plan.slot_override == "all" {
            debug!("Cannot optimize flashing super for all slots");
            return Ok(None);
        }
        if !can_optimize(tasks) {
            return Ok(None);
        }
        let Some(source) = plan.source.as_ref() else {
            debug!("super optimization needs an image archive");
            return Ok(None);
        };
        let Some(blob) = source.read_file("super_empty.img")? else {
            debug!("could not open super_empty.img");
            return Ok(None);
        };

        let super_name = plan
            .driver
            .get_var("super-partition-name")
            .unwrap_or_else(|_| "super".to_string());
        let Ok(size_var) = plan.driver.get_var(&format!("partition-size:{super_name}")) else {
            debug!("Cannot optimize super flashing: could not determine super partition");
            return Ok(None);
        };
        let Ok(partition_size) = parse_numeric_var(&size_var) else {
            debug!("Could not parse {super_name} size: {size_var}");
            return Ok(None);
        };

        let metadata = LpMetadata::from_image_blob(&blob).context("failed to parse super_empty.img")?;
        let Some(mut builder) = SuperLayoutBuilder::open(metadata) else {
            return Ok(None);
        };

        let mut images: Vec<(String, SparseFile)> = Vec::new();
        let mut folded = Vec::new();
        for task in tasks.iter() {
            let Some(flash) = task.as_flash() else {
                continue;
            };
            let partition = flash.partition_and_slot(plan)?;
            if !builder.metadata().should_flash_in_userspace(&partition) {
                continue;
            }
            let source = plan.source.as_ref().context("image source went away")?;
            let Some(file) = source.open_file(flash.image_name())? else {
                debug!("could not open {} for super optimization", flash.image_name());
                return Ok(None);
            };
            let image = SparseFile::import_auto(&file)
                .with_context(|| format!("cannot read {}", flash.image_name()))?;
            if let Err(e) = builder.add_partition(&partition, flash.image_name(), image.len()) {
                debug!("Cannot optimize super flashing: {e:#}");
                return Ok(None);
            }
            images.push((flash.image_name().to_string(), image));
            folded.push(partition);
        }
        if folded.is_empty() {
            return Ok(None);
        }

        let (metadata, layout) = match builder.build() {
            Ok(built) => built,
            Err(e) => {
                debug!("Cannot optimize super flashing: {e:#}");
                return Ok(None);
            }
        };
        let mut image = builder.base_image(&metadata)?;
        let block_size = image.block_size() as u64;
        for extent in &layout {
            let LayoutExtent::Partition { offset, image_name, .. } = extent else {
                continue;
            };
            let (_, partition_image) = images
                .iter()
                .find(|(name, _)| name == image_name)
                .context("laid out an image that was never added")?;
            image
                .place(partition_image, (offset / block_size) as u32)
                .with_context(|| format!("cannot place {image_name} in {super_name}"))?;
        }

        // retain() cannot ask the device for slots, so resolve names first
        let mut remove = Vec::with_capacity(tasks.len());
        for task in tasks.iter() {
            let drop = match task {
                Task::Flash(flash) => folded.contains(&flash.partition_and_slot(plan)?),
                Task::UpdateSuper(_) => true,
                Task::Reboot(reboot) => reboot.target == RebootTarget::Fastboot,
                _ => false,
            };
            remove.push(drop);
        }
        let mut flags = remove.into_iter();
        tasks.retain(|_| !flags.next().unwrap_or(false));

        info!(
            "flashing {} dynamic partitions as one {} image",
            folded.len(),
            super_name
        );
        Ok(Some(Task::OptimizedFlashSuper(OptimizedFlashSuperTask {
            super_name,
            image,
            partition_size,
        })))
    }

    pub(super) fn run(&self, plan: &mut FlashingPlan) -> Result<()> {
        // the reported partition size bounds the encoded image and is cheaper
        // to get than walking every chunk
        let limit = get_sparse_limit(self.partition_size, plan)?;
        let files = if limit > 0 {
            resparse_file(&self.image, limit as i64)?
        } else {
            vec![self.image.clone()]
        };
        flash_partition_files(plan, &self.super_name, &files)
    }
}

/// Folding only makes sense when the graph both updates super and flashes
/// its partitions without anything in between that depends on the old
/// layout.
fn can_optimize(tasks: &[Task]) -> bool {
    if !tasks.iter().any(|t| matches!(t, Task::UpdateSuper(_))) {
        debug!("no super update in task list, not optimizing");
        return false;
    }
    let blocking = tasks
        .iter()
        .any(|t| matches!(t, Task::Resize(_) | Task::Delete(_)));
    if blocking {
        debug!("task list edits logical partitions, not optimizing");
    }
    !blocking
}

/// Inserts a resize-to-zero task for every dynamic partition about to be
/// flashed, just before the first of them, so fastbootd can allocate
/// extents from a clean slate.
pub fn add_resize_tasks(plan: &mut FlashingPlan, tasks: &mut Vec<Task>) -> Result<bool> {
    let Some(blob) = plan.read_image_file("super_empty.img")? else {
        return Ok(false);
    };
    if LpMetadata::from_image_blob(&blob).is_err() {
        return Ok(false);
    }

    let mut insert_at = None;
    let mut resizes = Vec::new();
    for (index, task) in tasks.iter().enumerate() {
        let Some(flash) = task.as_flash() else {
            continue;
        };
        let partition = flash.partition_and_slot(plan)?;
        if should_flash_in_userspace(plan, &partition) {
            insert_at.get_or_insert(index);
            resizes.push(Task::resize(flash.partition(), "0", &plan.slot_override));
        }
    }
    let Some(index) = insert_at else {
        debug!("No dynamic partitions to flash");
        return Ok(false);
    };
    tasks.splice(index..index, resizes);
    Ok(true)
}
