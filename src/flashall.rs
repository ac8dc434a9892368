use anyhow::{bail, Context, Result};

use crate::avb::is_vbmeta_partition;
use crate::fastboot_info::parse_fastboot_info;
use crate::images::{ImageEntry, ImageType};
use crate::partition::should_flash_in_userspace;
use crate::plan::FlashingPlan;
use crate::requirements::check_requirements;
use crate::slot::{
    get_current_slot, get_other_slot, get_other_slot_for_device, get_slot_count, set_active_slot,
    supports_ab,
};
use crate::sparse::SparseFile;
use crate::task::{add_resize_tasks, run_tasks, OptimizedFlashSuperTask, Task, UpdateSuperTask};

/// Flashes every image a build produced, from an archive or a product
/// output directory bound as the plan's image source.
pub struct FlashAllTool<'a> {
    plan: &'a mut FlashingPlan,
    boot_images: Vec<ImageEntry>,
    os_images: Vec<ImageEntry>,
}

impl<'a> FlashAllTool<'a> {
    pub fn new(plan: &'a mut FlashingPlan) -> Self {
        Self {
            plan,
            boot_images: Vec::new(),
            os_images: Vec::new(),
        }
    }

    /// Builds the whole task graph, then runs it. Nothing on the device
    /// changes until the graph is complete.
    pub fn flash(&mut self) -> Result<()> {
        let capturing = self.plan.is_capturing();
        if !capturing {
            self.dump_info();
        }
        self.check_requirements()?;
        if !capturing {
            self.determine_slot()?;
        }
        let tasks = self.collect_tasks()?;

        if !capturing {
            // switch slots first so a fastbootd reboot lands in the right recovery
            let slot = if self.plan.slot_override == "all" {
                "a".to_string()
            } else {
                self.plan.slot_override.clone()
            };
            set_active_slot(self.plan, &slot)?;
        }
        cancel_snapshot_if_needed(self.plan)?;

        info!("flashing {} tasks", tasks.len());
        run_tasks(self.plan, &tasks)
    }

    fn dump_info(&mut self) {
        info!("--------------------------------------------");
        for (var, label) in [
            ("version-bootloader", "Bootloader Version..."),
            ("version-baseband", "Baseband Version....."),
            ("serialno", "Serial Number........"),
        ] {
            let value = self.plan.driver.get_var(var).unwrap_or_default();
            info!("{label}: {value}");
        }
        info!("--------------------------------------------");
    }

    pub fn check_requirements(&mut self) -> Result<()> {
        let data = self
            .plan
            .read_image_file("android-info.txt")?
            .context("could not read android-info.txt")?;
        if let Some(capture) = &self.plan.capture {
            return capture.borrow_mut().add_requirements_check(&data);
        }
        let text = String::from_utf8_lossy(&data).into_owned();
        let force = self.plan.force_flash;
        check_requirements(self.plan, &text, force)
    }

    pub fn determine_slot(&mut self) -> Result<()> {
        self.plan.current_slot = if self.plan.slot_override.is_empty() {
            get_current_slot(self.plan.driver.as_mut())
        } else {
            self.plan.slot_override.clone()
        };

        if self.plan.skip_secondary {
            return Ok(());
        }
        let other = match self.plan.slot_override.as_str() {
            "" | "all" => get_other_slot_for_device(self.plan.driver.as_mut())?,
            slot => {
                let count = get_slot_count(self.plan.driver.as_mut());
                get_other_slot(slot, count)?
            }
        };
        match other {
            Some(slot) => self.plan.secondary_slot = slot,
            None => {
                if supports_ab(self.plan.driver.as_mut()) {
                    warn!("Could not determine slot for secondary images. Ignoring.");
                }
                self.plan.skip_secondary = true;
            }
        }
        Ok(())
    }

    pub fn collect_tasks(&mut self) -> Result<Vec<Task>> {
        let mut tasks = match self.tasks_from_fastboot_info()? {
            Some(tasks) => tasks,
            None => self.tasks_from_image_list()?,
        };

        if self.plan.exclude_dynamic_partitions {
            let mut keep = Vec::with_capacity(tasks.len());
            for task in &tasks {
                let keep_task = match task.as_flash() {
                    Some(flash) => {
                        let partition = flash.partition_and_slot(self.plan)?;
                        !should_flash_in_userspace(self.plan, &partition)
                    }
                    None => false,
                };
                keep.push(keep_task);
            }
            let mut flags = keep.into_iter();
            tasks.retain(|_| flags.next().unwrap_or(false));
        }
        Ok(tasks)
    }

    fn tasks_from_fastboot_info(&mut self) -> Result<Option<Vec<Task>>> {
        if !self.plan.should_use_fastboot_info {
            return Ok(None);
        }
        let Some(data) = self.plan.read_image_file("fastboot-info.txt")? else {
            return Ok(None);
        };
        let text = String::from_utf8(data).context("fastboot-info.txt is not UTF-8")?;
        let mut tasks = parse_fastboot_info(self.plan, &text)?;
        self.add_super_tasks(&mut tasks)?;
        Ok(Some(tasks))
    }

    fn tasks_from_image_list(&mut self) -> Result<Vec<Task>> {
        self.collect_images();
        let mut tasks = Vec::new();
        // boot partitions go first; they work from either fastboot flavor
        let boot_images = std::mem::take(&mut self.boot_images);
        self.add_flash_tasks(&boot_images, &mut tasks)?;
        tasks.push(Task::UpdateSuper(UpdateSuperTask));
        let os_images = std::mem::take(&mut self.os_images);
        self.add_flash_tasks(&os_images, &mut tasks)?;
        self.add_super_tasks(&mut tasks)?;
        Ok(tasks)
    }

    fn add_super_tasks(&mut self, tasks: &mut Vec<Task>) -> Result<()> {
        if let Some(task) = OptimizedFlashSuperTask::initialize(self.plan, tasks)? {
            tasks.push(task);
        } else if !add_resize_tasks(self.plan, tasks)? {
            debug!("Failed to add resize tasks");
        }
        Ok(())
    }

    fn collect_images(&mut self) {
        for image in &self.plan.images {
            let slot = if image.is_secondary() {
                if self.plan.skip_secondary {
                    continue;
                }
                self.plan.secondary_slot.clone()
            } else {
                self.plan.slot_override.clone()
            };
            let entry = ImageEntry {
                image: image.clone(),
                slot,
            };
            match image.image_type {
                ImageType::BootCritical => self.boot_images.push(entry),
                ImageType::Normal => self.os_images.push(entry),
                ImageType::Extra => {}
            }
        }
    }

    fn add_flash_tasks(&mut self, images: &[ImageEntry], tasks: &mut Vec<Task>) -> Result<()> {
        for entry in images {
            let image = &entry.image;
            let file = match &self.plan.source {
                Some(source) => source.open_file(image.img_name)?,
                None => None,
            };
            let loadable = match file {
                Some(file) => {
                    SparseFile::import(&file)
                        .with_context(|| format!("could not load '{}'", image.img_name))?;
                    true
                }
                None => false,
            };
            if !loadable {
                if image.optional_if_no_image {
                    continue;
                }
                bail!("could not load '{}': image not found", image.img_name);
            }
            tasks.push(Task::flash(
                &entry.slot,
                image.part_name,
                image.img_name,
                is_vbmeta_partition(image.part_name),
            ));
        }
        Ok(())
    }
}

/// Cancels a pending snapshot update, if any.
pub fn cancel_snapshot_if_needed(plan: &mut FlashingPlan) -> Result<()> {
    if plan.is_capturing() {
        return plan.driver.snapshot_update_command("cancel");
    }
    let status = plan
        .driver
        .get_var("snapshot-update-status")
        .unwrap_or_else(|_| "none".to_string());
    if !status.is_empty() && status != "none" {
        plan.driver.snapshot_update_command("cancel")?;
    }
    Ok(())
}
