//! Network devices remembered by `connect`, shared between invocations.
//!
//! The list lives in `<dir>/devices`, one serial per line. Every
//! read-modify-write happens under an exclusive lock on
//! `<dir>/transport.lock`.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

const DEVICES_FILE: &str = "devices";
const LOCK_FILE: &str = "transport.lock";

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    dir: PathBuf,
}

/// Held while the registry is being read or rewritten.
pub struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl DeviceRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.fastboot`
    pub fn default_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("cannot determine the home directory")?;
        Ok(home.join(".fastboot"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn devices_path(&self) -> PathBuf {
        self.dir.join(DEVICES_FILE)
    }

    pub fn exists(&self) -> bool {
        self.devices_path().exists()
    }

    pub fn lock(&self) -> Result<RegistryLock> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(RegistryLock { file })
    }

    pub fn read_devices(&self, _lock: &RegistryLock) -> Result<BTreeSet<String>> {
        let path = self.devices_path();
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn write_devices(&self, _lock: &RegistryLock, devices: &BTreeSet<String>) -> Result<()> {
        let path = self.devices_path();
        let mut text = String::new();
        for device in devices {
            text.push_str(device);
            text.push('\n');
        }
        fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn clear(&self, _lock: &RegistryLock) -> Result<()> {
        let path = self.devices_path();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    /// Snapshot of the registered devices under a short-lived lock.
    pub fn devices(&self) -> Result<BTreeSet<String>> {
        if !self.exists() {
            return Ok(BTreeSet::new());
        }
        let lock = self.lock()?;
        self.read_devices(&lock)
    }

    pub fn add(&self, serial: &str) -> Result<()> {
        let lock = self.lock()?;
        let mut devices = self.read_devices(&lock)?;
        devices.insert(serial.to_string());
        self.write_devices(&lock, &devices)
    }

    /// Returns whether `serial` was registered.
    pub fn remove(&self, serial: &str) -> Result<bool> {
        let lock = self.lock()?;
        let mut devices = self.read_devices(&lock)?;
        let removed = devices.remove(serial);
        self.write_devices(&lock, &devices)?;
        Ok(removed)
    }
}
