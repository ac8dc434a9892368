use anyhow::{bail, Result};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs::File,
    io::{Seek, SeekFrom},
    path::Path,
    rc::Rc,
};

use super::CaptureRecorder;
use crate::driver::{lookup_var, FastbootDriver};
use crate::sparse::SparseFile;

/// Variables a capture assumes about the target device. The generated
/// scripts assert the ones that matter.
pub fn default_vars(sparse_limit: u64) -> BTreeMap<String, String> {
    [
        ("slot-count", "2".to_string()),
        ("current-slot", "a".to_string()),
        ("has-slot:super", "no".to_string()),
        ("has-slot:*", "yes".to_string()),
        ("is-logical:*", "no".to_string()),
        ("is-userspace", "no".to_string()),
        ("super-partition-name", "super".to_string()),
        ("partition-type:*", "raw".to_string()),
        ("max-download-size", format!("{sparse_limit:#x}")),
        ("snapshot-update-status", "none".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// A device stand-in that turns flash operations into script lines and
/// archive entries instead of sending them anywhere.
#[derive(Clone)]
pub struct CaptureDriver {
    recorder: Rc<RefCell<CaptureRecorder>>,
    vars: Rc<RefCell<BTreeMap<String, String>>>,
}

impl CaptureDriver {
    pub fn new(recorder: Rc<RefCell<CaptureRecorder>>, vars: BTreeMap<String, String>) -> Self {
        Self {
            recorder,
            vars: Rc::new(RefCell::new(vars)),
        }
    }

    pub fn set_var(&self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.borrow_mut().insert(name.into(), value.into());
    }

    /// Image names recorded for a flash of an `_a` partition: the base
    /// partition name and `<base>.img`.
    fn pending_names(partition: &str) -> Result<(String, String)> {
        let Some(base) = partition.strip_suffix("_a") else {
            bail!("unexpected partition name {partition} while capturing");
        };
        Ok((base.to_string(), format!("{base}.img")))
    }

    fn record_flash(&self, partition: &str, file_name: &str) {
        let cmd = format!("flash {partition} {file_name}");
        let mut recorder = self.recorder.borrow_mut();
        recorder.scripts.add_command(&cmd);
        recorder.scripts.add_sh_bat_command(&format!("fastboot {cmd}"));
    }

    fn unsupported(&self, what: &str) -> Result<()> {
        bail!("{what} cannot be captured")
    }
}

impl FastbootDriver for CaptureDriver {
    fn get_var(&mut self, name: &str) -> Result<String> {
        match lookup_var(&self.vars.borrow(), name) {
            Some(value) => Ok(value),
            None => bail!("getvar:{name} is not known while capturing"),
        }
    }

    fn download(&mut self, name: &str, _data: &[u8]) -> Result<()> {
        if name == "signature" {
            bail!("unexpected signature while capturing");
        }
        self.unsupported(&format!("download of {name}"))
    }

    fn download_file(&mut self, name: &str, _file: &mut File, _size: u64) -> Result<()> {
        self.unsupported(&format!("download of {name}"))
    }

    fn flash_partition(&mut self, partition: &str, file: &mut File, size: u64) -> Result<()> {
        let (base, file_name) = Self::pending_names(partition)?;
        self.record_flash(&base, &file_name);
        file.seek(SeekFrom::Start(0))?;
        self.recorder
            .borrow_mut()
            .add_file_from_reader(&file_name, file, size)
    }

    fn flash_sparse(
        &mut self,
        partition: &str,
        sparse: &SparseFile,
        _size: u64,
        current: usize,
        total: usize,
    ) -> Result<()> {
        if total == 1 && partition.ends_with("_a") {
            let (base, file_name) = Self::pending_names(partition)?;
            self.record_flash(&base, &file_name);
            return self.recorder.borrow_mut().add_sparse_file(&file_name, sparse);
        }

        if current == 1 {
            info!("capturing {partition} as {total} splits");
        }
        let file_name = format!("{partition}_{current}.img");
        self.recorder.borrow_mut().add_sparse_file(&file_name, sparse)?;
        let cmd = format!("flash {partition} {file_name}");
        let mut recorder = self.recorder.borrow_mut();
        recorder.scripts.add_command(&cmd);
        recorder
            .scripts
            .add_sh_bat_line(&format!("echo Flashing {partition}, {current}/{total}"));
        recorder.scripts.add_sh_bat_command(&format!("fastboot {cmd}"));
        Ok(())
    }

    fn erase(&mut self, partition: &str) -> Result<()> {
        let mut recorder = self.recorder.borrow_mut();
        recorder.scripts.add_command(&format!("erase {partition}"));
        recorder
            .scripts
            .add_sh_bat_command(&format!("fastboot erase {partition}"));
        Ok(())
    }

    fn boot(&mut self) -> Result<()> {
        self.unsupported("boot")
    }

    fn continue_boot(&mut self) -> Result<()> {
        self.unsupported("continue")
    }

    fn set_active(&mut self, slot: &str) -> Result<()> {
        let mut recorder = self.recorder.borrow_mut();
        recorder.scripts.add_command(&format!("run-cmd set_active:{slot}"));
        recorder
            .scripts
            .add_sh_bat_command(&format!("fastboot --set-active={slot}"));
        Ok(())
    }

    fn create_partition(&mut self, partition: &str, _size: &str) -> Result<()> {
        self.unsupported(&format!("creating {partition}"))
    }

    fn delete_partition(&mut self, partition: &str) -> Result<()> {
        self.unsupported(&format!("deleting {partition}"))
    }

    fn resize_partition(&mut self, partition: &str, _size: &str) -> Result<()> {
        bail!("unexpected logical partition {partition} while capturing")
    }

    fn raw_command(&mut self, command: &str, _message: &str) -> Result<String> {
        self.unsupported(&format!("command '{command}'"))?;
        Ok(String::new())
    }

    fn snapshot_update_command(&mut self, command: &str) -> Result<()> {
        if command != "cancel" {
            return self.unsupported(&format!("snapshot-update {command}"));
        }
        let mut recorder = self.recorder.borrow_mut();
        recorder.scripts.add_command("maybe-cancel-snapshot-update");
        recorder
            .scripts
            .add_sh_bat_command("fastboot snapshot-update cancel");
        Ok(())
    }

    fn fetch_to_file(&mut self, partition: &str, _file: &mut File, _offset: u64, _size: u64) -> Result<()> {
        self.unsupported(&format!("fetching {partition}"))
    }

    fn upload(&mut self, _outfile: &Path) -> Result<()> {
        self.unsupported("upload")
    }

    fn reboot(&mut self) -> Result<()> {
        let mut recorder = self.recorder.borrow_mut();
        recorder.scripts.add_command("reboot");
        recorder.scripts.add_sh_bat_command("fastboot reboot");
        Ok(())
    }

    fn reboot_to(&mut self, target: &str) -> Result<()> {
        {
            let mut recorder = self.recorder.borrow_mut();
            recorder.scripts.add_command(&format!("reboot-{target}"));
            recorder
                .scripts
                .add_sh_bat_command(&format!("fastboot reboot-{target}"));
        }
        self.set_var("is-userspace", if target == "fastboot" { "yes" } else { "no" });
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn last_error(&self) -> String {
        String::new()
    }
}
