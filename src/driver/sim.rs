use anyhow::{anyhow, bail, Context, Result};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    rc::Rc,
};

use super::{lookup_var, FastbootDriver};
use crate::sparse::SparseFile;

#[derive(Default)]
struct SimState {
    vars: BTreeMap<String, String>,
    failures: BTreeMap<String, String>,
    transcript: Vec<String>,
    partitions: BTreeMap<String, Vec<u8>>,
    staged: Vec<u8>,
    last_error: String,
}

/// An in-process device that answers `getvar` from a table and records
/// every other command.
///
/// Variable names may end in `*` to answer a whole family, e.g.
/// `has-slot:*`. Clones share state, so a caller can hand one clone to a
/// [`crate::plan::FlashingPlan`] and inspect another.
#[derive(Clone, Default)]
pub struct SimulatedDevice {
    state: Rc<RefCell<SimState>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let device = Self::new();
        for (k, v) in vars {
            device.set_var(k, v);
        }
        device
    }

    pub fn set_var(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.borrow_mut().vars.insert(name.into(), value.into());
    }

    pub fn remove_var(&self, name: &str) {
        self.state.borrow_mut().vars.remove(name);
    }

    /// Makes every command starting with `prefix` fail with `message`.
    pub fn fail_on(&self, prefix: impl Into<String>, message: impl Into<String>) {
        self.state
            .borrow_mut()
            .failures
            .insert(prefix.into(), message.into());
    }

    pub fn set_partition(&self, name: impl Into<String>, data: Vec<u8>) {
        self.state.borrow_mut().partitions.insert(name.into(), data);
    }

    pub fn partition(&self, name: &str) -> Option<Vec<u8>> {
        self.state.borrow().partitions.get(name).cloned()
    }

    pub fn transcript(&self) -> Vec<String> {
        self.state.borrow().transcript.clone()
    }

    pub fn staged(&self) -> Vec<u8> {
        self.state.borrow().staged.clone()
    }

    fn lookup(&self, name: &str) -> Option<String> {
        lookup_var(&self.state.borrow().vars, name)
    }

    fn command(&self, command: String) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let failure = state
            .failures
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, message)| message.clone());
        if let Some(message) = failure {
            state.last_error = message.clone();
            bail!("{command} failed (remote: '{message}')");
        }
        debug!("> {command}");
        state.transcript.push(command);
        Ok(())
    }
}

impl FastbootDriver for SimulatedDevice {
    fn get_var(&mut self, name: &str) -> Result<String> {
        if let Some(value) = self.lookup(name) {
            return Ok(value);
        }
        let message = "GetVar Variable Not found".to_string();
        self.state.borrow_mut().last_error = message.clone();
        Err(anyhow!("getvar:{name} failed (remote: '{message}')"))
    }

    fn download(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.command(format!("download:{name}"))?;
        self.state.borrow_mut().staged = data.to_vec();
        Ok(())
    }

    fn download_file(&mut self, name: &str, file: &mut File, size: u64) -> Result<()> {
        self.command(format!("download:{name}"))?;
        let data = read_len(file, size)?;
        self.state.borrow_mut().staged = data;
        Ok(())
    }

    fn flash_partition(&mut self, partition: &str, file: &mut File, size: u64) -> Result<()> {
        self.command(format!("flash:{partition}"))?;
        info!("Sending '{}' ({} KB)", partition, size / 1024);
        let data = read_len(file, size)?;
        self.state
            .borrow_mut()
            .partitions
            .insert(partition.to_string(), data);
        Ok(())
    }

    fn flash_sparse(
        &mut self,
        partition: &str,
        sparse: &SparseFile,
        size: u64,
        current: usize,
        total: usize,
    ) -> Result<()> {
        self.command(format!("flash:{partition} ({current}/{total})"))?;
        info!(
            "Sending sparse '{}' {}/{} ({} KB)",
            partition,
            current,
            total,
            size / 1024
        );
        let mut state = self.state.borrow_mut();
        let image = state.partitions.entry(partition.to_string()).or_default();
        sparse.apply_to(image)
    }

    fn erase(&mut self, partition: &str) -> Result<()> {
        self.command(format!("erase:{partition}"))?;
        self.state.borrow_mut().partitions.remove(partition);
        Ok(())
    }

    fn boot(&mut self) -> Result<()> {
        self.command("boot".to_string())
    }

    fn continue_boot(&mut self) -> Result<()> {
        self.command("continue".to_string())
    }

    fn set_active(&mut self, slot: &str) -> Result<()> {
        self.command(format!("set_active:{slot}"))?;
        self.set_var("current-slot", slot);
        Ok(())
    }

    fn create_partition(&mut self, partition: &str, size: &str) -> Result<()> {
        self.command(format!("create-logical-partition:{partition}:{size}"))
    }

    fn delete_partition(&mut self, partition: &str) -> Result<()> {
        self.command(format!("delete-logical-partition:{partition}"))
    }

    fn resize_partition(&mut self, partition: &str, size: &str) -> Result<()> {
        self.command(format!("resize-logical-partition:{partition}:{size}"))
    }

    fn raw_command(&mut self, command: &str, message: &str) -> Result<String> {
        if !message.is_empty() {
            info!("{message}");
        }
        self.command(command.to_string())?;
        Ok(String::new())
    }

    fn snapshot_update_command(&mut self, command: &str) -> Result<()> {
        self.command(format!("snapshot-update:{command}"))
    }

    fn fetch_to_file(
        &mut self,
        partition: &str,
        file: &mut File,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        self.command(format!("fetch:{partition}:{offset:#010x}:{size:#010x}"))?;
        let state = self.state.borrow();
        let data = state
            .partitions
            .get(partition)
            .ok_or_else(|| anyhow!("fetch: no data for {partition}"))?;
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= data.len() as u64)
            .ok_or_else(|| anyhow!("fetch: range out of bounds for {partition}"))?;
        file.write_all(&data[offset as usize..end as usize])?;
        Ok(())
    }

    fn upload(&mut self, outfile: &Path) -> Result<()> {
        self.command("upload".to_string())?;
        std::fs::write(outfile, self.state.borrow().staged.as_slice())
            .with_context(|| format!("failed to write {}", outfile.display()))
    }

    fn reboot(&mut self) -> Result<()> {
        self.command("reboot".to_string())
    }

    fn reboot_to(&mut self, target: &str) -> Result<()> {
        self.command(format!("reboot-{target}"))?;
        match target {
            "fastboot" => self.set_var("is-userspace", "yes"),
            "bootloader" => self.set_var("is-userspace", "no"),
            _ => {}
        }
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        debug!("simulated device reconnected");
        Ok(())
    }

    fn last_error(&self) -> String {
        self.state.borrow().last_error.clone()
    }
}

fn read_len(file: &mut File, size: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut data = Vec::with_capacity(size as usize);
    file.take(size).read_to_end(&mut data)?;
    if (data.len() as u64) < size {
        bail!("short read: expected {size} bytes, got {}", data.len());
    }
    Ok(data)
}
