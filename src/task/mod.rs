//! Units of work in a flashing session.
//!
//! A task graph is a plain `Vec<Task>` run front to back. Order matters:
//! boot-critical images go first, the super partition layout is updated
//! before logical partitions are written, and anything that needs
//! userspace fastboot comes after the reboot into it.

mod super_flash;

pub use super_flash::{add_resize_tasks, OptimizedFlashSuperTask};

use anyhow::{bail, Result};
use std::fmt;

use crate::flash::do_flash;
use crate::format::fb_perform_format;
use crate::partition::{
    is_logical, is_userspace_fastboot, reboot_to_userspace_fastboot, should_flash_in_userspace,
};
use crate::plan::FlashingPlan;
use crate::slot::{do_for_partitions, get_current_slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootTarget {
    System,
    Bootloader,
    Recovery,
    Fastboot,
}

impl RebootTarget {
    pub fn parse(target: &str) -> Result<Self> {
        Ok(match target {
            "" | "system" => RebootTarget::System,
            "bootloader" => RebootTarget::Bootloader,
            "recovery" => RebootTarget::Recovery,
            "fastboot" => RebootTarget::Fastboot,
            other => bail!("unknown reboot target {other}"),
        })
    }
}

impl fmt::Display for RebootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RebootTarget::System => "system",
            RebootTarget::Bootloader => "bootloader",
            RebootTarget::Recovery => "recovery",
            RebootTarget::Fastboot => "fastboot",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTask {
    slot: String,
    pname: String,
    fname: String,
    apply_vbmeta: bool,
}

impl FlashTask {
    pub fn new(
        slot: impl Into<String>,
        pname: impl Into<String>,
        fname: impl Into<String>,
        apply_vbmeta: bool,
    ) -> Self {
        Self {
            slot: slot.into(),
            pname: pname.into(),
            fname: fname.into(),
            apply_vbmeta,
        }
    }

    pub fn partition(&self) -> &str {
        &self.pname
    }

    pub fn image_name(&self) -> &str {
        &self.fname
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn apply_vbmeta(&self) -> bool {
        self.apply_vbmeta
    }

    /// The partition name with its slot suffix, resolving an empty slot to
    /// the device's current one.
    pub fn partition_and_slot(&self, plan: &mut FlashingPlan) -> Result<String> {
        let slot = if self.slot.is_empty() {
            get_current_slot(plan.driver.as_mut())
        } else {
            self.slot.clone()
        };
        if slot.is_empty() {
            return Ok(self.pname.clone());
        }
        if slot == "all" {
            bail!("Cannot retrieve a singular name when using all slots");
        }
        Ok(format!("{}_{}", self.pname, slot))
    }

    pub fn run(&self, plan: &mut FlashingPlan) -> Result<()> {
        let fname = self.fname.clone();
        let apply_vbmeta = self.apply_vbmeta;
        do_for_partitions(plan, &self.pname, &self.slot, true, |plan, partition| {
            if should_flash_in_userspace(plan, partition)
                && !is_userspace_fastboot(plan)
                && !plan.force_flash
            {
                bail!(
                    "The partition you are trying to flash is dynamic, and should be flashed via fastbootd. Please run:\n\n    fastboot reboot fastboot\n\nAnd try again. If you are intentionally trying to overwrite a fixed partition, use --force."
                );
            }
            do_flash(plan, partition, &fname, apply_vbmeta)
        })
    }
}

impl fmt::Display for FlashTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("flash")?;
        if self.apply_vbmeta {
            f.write_str(" --apply-vbmeta")?;
        }
        if !self.slot.is_empty() {
            write!(f, " --slot={}", self.slot)?;
        }
        write!(f, " {}", self.pname)?;
        if self.fname != format!("{}.img", self.pname) {
            write!(f, " {}", self.fname)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootTask {
    pub target: RebootTarget,
}

impl RebootTask {
    fn run(&self, plan: &mut FlashingPlan) -> Result<()> {
        match self.target {
            RebootTarget::Fastboot => {
                if !is_userspace_fastboot(plan) {
                    reboot_to_userspace_fastboot(plan)?;
                }
                Ok(())
            }
            RebootTarget::Recovery => plan.driver.reboot_to("recovery"),
            RebootTarget::Bootloader => plan.driver.reboot_to("bootloader"),
            RebootTarget::System => plan.driver.reboot(),
        }
    }
}

/// Erases a partition and formats it if its filesystem type is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WipeTask {
    pub pname: String,
}

impl WipeTask {
    fn run(&self, plan: &mut FlashingPlan) -> Result<()> {
        let partition_type = match plan.driver.get_var(&format!("partition-type:{}", self.pname)) {
            Ok(t) => t,
            Err(_) => {
                error!("wipe task partition not found: {}", self.pname);
                return Ok(());
            }
        };
        if partition_type.is_empty() {
            return Ok(());
        }
        plan.driver.erase(&self.pname)?;
        fb_perform_format(plan, &self.pname, true, &partition_type, "")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeTask {
    pub pname: String,
    pub size: String,
    pub slot: String,
}

impl ResizeTask {
    fn run(&self, plan: &mut FlashingPlan) -> Result<()> {
        let size = self.size.clone();
        do_for_partitions(plan, &self.pname, &self.slot, false, |plan, partition| {
            if is_logical(plan, partition) {
                plan.driver.resize_partition(partition, &size)?;
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTask {
    pub pname: String,
}

/// Pushes `super_empty.img` so the device can rewrite the super partition
/// layout. Needs userspace fastboot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSuperTask;

impl UpdateSuperTask {
    fn run(&self, plan: &mut FlashingPlan) -> Result<()> {
        let Some(metadata) = plan.read_image_file("super_empty.img")? else {
            return Ok(());
        };
        if !is_userspace_fastboot(plan) {
            reboot_to_userspace_fastboot(plan)?;
        }
        let super_name = plan
            .driver
            .get_var("super-partition-name")
            .unwrap_or_else(|_| "super".to_string());
        plan.driver.download(&super_name, &metadata)?;
        let mut command = format!("update-super:{super_name}");
        if plan.wants_wipe {
            command.push_str(":wipe");
        }
        plan.driver.raw_command(&command, "Updating super partition")?;
        Ok(())
    }
}

pub enum Task {
    Flash(FlashTask),
    Reboot(RebootTask),
    Wipe(WipeTask),
    Resize(ResizeTask),
    Delete(DeleteTask),
    UpdateSuper(UpdateSuperTask),
    OptimizedFlashSuper(OptimizedFlashSuperTask),
}

impl Task {
    pub fn flash(slot: &str, pname: &str, fname: &str, apply_vbmeta: bool) -> Self {
        Task::Flash(FlashTask::new(slot, pname, fname, apply_vbmeta))
    }

    pub fn reboot(target: RebootTarget) -> Self {
        Task::Reboot(RebootTask { target })
    }

    pub fn wipe(pname: &str) -> Self {
        Task::Wipe(WipeTask {
            pname: pname.to_string(),
        })
    }

    pub fn resize(pname: &str, size: &str, slot: &str) -> Self {
        Task::Resize(ResizeTask {
            pname: pname.to_string(),
            size: size.to_string(),
            slot: slot.to_string(),
        })
    }

    pub fn delete(pname: &str) -> Self {
        Task::Delete(DeleteTask {
            pname: pname.to_string(),
        })
    }

    pub fn as_flash(&self) -> Option<&FlashTask> {
        match self {
            Task::Flash(task) => Some(task),
            _ => None,
        }
    }

    pub fn run(&self, plan: &mut FlashingPlan) -> Result<()> {
        debug!("running task: {self}");
        match self {
            Task::Flash(task) => task.run(plan),
            Task::Reboot(task) => task.run(plan),
            Task::Wipe(task) => task.run(plan),
            Task::Resize(task) => task.run(plan),
            Task::Delete(task) => plan.driver.delete_partition(&task.pname),
            Task::UpdateSuper(task) => task.run(plan),
            Task::OptimizedFlashSuper(task) => task.run(plan),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Flash(task) => task.fmt(f),
            Task::Reboot(task) => match task.target {
                RebootTarget::System => f.write_str("reboot"),
                target => write!(f, "reboot {target}"),
            },
            Task::Wipe(task) => write!(f, "erase {}", task.pname),
            Task::Resize(task) => write!(f, "resize {} {}", task.pname, task.size),
            Task::Delete(task) => write!(f, "delete {}", task.pname),
            Task::UpdateSuper(_) => f.write_str("update-super"),
            Task::OptimizedFlashSuper(task) => write!(f, "optimized-flash-super {}", task.super_name()),
        }
    }
}

/// Runs every task in order, stopping at the first failure.
pub fn run_tasks(plan: &mut FlashingPlan, tasks: &[Task]) -> Result<()> {
    for task in tasks {
        task.run(plan)?;
    }
    Ok(())
}
