//! Device protocol seam.
//!
//! Everything the orchestration engine asks of a device goes through
//! [`FastbootDriver`]. The crate ships two implementations: the
//! [`sim::SimulatedDevice`] used for dry runs and tests, and the capture
//! driver that records a replayable script. A wire-protocol backend plugs in
//! by implementing the trait.

pub mod sim;

use anyhow::Result;
use std::{collections::BTreeMap, fs::File, path::Path};

use crate::sparse::SparseFile;

pub trait FastbootDriver {
    fn get_var(&mut self, name: &str) -> Result<String>;

    /// Stages `data` in the device's download buffer.
    fn download(&mut self, name: &str, data: &[u8]) -> Result<()>;

    fn download_file(&mut self, name: &str, file: &mut File, size: u64) -> Result<()>;

    fn flash_partition(&mut self, partition: &str, file: &mut File, size: u64) -> Result<()>;

    /// Flashes chunk `current` (1-based) of `total` sparse chunks.
    fn flash_sparse(
        &mut self,
        partition: &str,
        sparse: &SparseFile,
        size: u64,
        current: usize,
        total: usize,
    ) -> Result<()>;

    fn erase(&mut self, partition: &str) -> Result<()>;

    fn boot(&mut self) -> Result<()>;

    fn continue_boot(&mut self) -> Result<()>;

    fn set_active(&mut self, slot: &str) -> Result<()>;

    fn create_partition(&mut self, partition: &str, size: &str) -> Result<()>;

    fn delete_partition(&mut self, partition: &str) -> Result<()>;

    fn resize_partition(&mut self, partition: &str, size: &str) -> Result<()>;

    /// Sends a command verbatim and returns the device's response text.
    fn raw_command(&mut self, command: &str, message: &str) -> Result<String>;

    fn snapshot_update_command(&mut self, command: &str) -> Result<()>;

    fn fetch_to_file(&mut self, partition: &str, file: &mut File, offset: u64, size: u64)
    -> Result<()>;

    fn upload(&mut self, outfile: &Path) -> Result<()>;

    fn reboot(&mut self) -> Result<()>;

    fn reboot_to(&mut self, target: &str) -> Result<()>;

    /// Drops the current connection and waits for the device to come back,
    /// typically after `reboot_to("fastboot")`.
    fn reconnect(&mut self) -> Result<()>;

    /// Error text of the last failed command.
    fn last_error(&self) -> String;
}

/// Looks `name` up in a variable table where keys ending in `*` answer
/// every name with that prefix. The longest matching prefix wins.
pub fn lookup_var(vars: &BTreeMap<String, String>, name: &str) -> Option<String> {
    if let Some(value) = vars.get(name) {
        return Some(value.clone());
    }
    vars.iter()
        .filter_map(|(k, v)| k.strip_suffix('*').map(|p| (p, v)))
        .filter(|(prefix, _)| name.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, v)| v.clone())
}
