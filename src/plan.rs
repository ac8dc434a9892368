use anyhow::{bail, Result};
use bitflags::bitflags;
use std::{cell::RefCell, path::PathBuf, rc::Rc};

use crate::capture::CaptureRecorder;
use crate::driver::FastbootDriver;
use crate::images::{self, Image};
use crate::source::ImageSource;

bitflags! {
    /// Extra filesystem features requested with `--fs-options`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsOptions: u32 {
        const CASEFOLD = 1 << 0;
        const PROJID = 1 << 1;
        const COMPRESS = 1 << 2;
    }
}

impl FsOptions {
    pub fn parse(list: &str) -> Result<Self> {
        let mut options = FsOptions::empty();
        for name in list.split(',').filter(|s| !s.is_empty()) {
            options |= match name {
                "casefold" => FsOptions::CASEFOLD,
                "projid" => FsOptions::PROJID,
                "compress" => FsOptions::COMPRESS,
                other => bail!("unsupported fs option '{other}'"),
            };
        }
        Ok(options)
    }
}

/// Everything one flashing session needs: the device, where images come
/// from, and the switches that shape the task graph.
pub struct FlashingPlan {
    pub driver: Box<dyn FastbootDriver>,
    pub source: Option<Box<dyn ImageSource>>,
    /// Image inventory; `optional_if_no_image` can be cleared by
    /// `partition-exists` requirements.
    pub images: Vec<Image>,
    pub product_out: Option<PathBuf>,

    pub slot_override: String,
    pub current_slot: String,
    pub secondary_slot: String,

    pub sparse_limit: u64,
    pub fs_options: FsOptions,

    pub wants_wipe: bool,
    pub skip_reboot: bool,
    pub wants_set_active: bool,
    pub skip_secondary: bool,
    pub force_flash: bool,
    pub should_optimize_flash_super: bool,
    pub should_use_fastboot_info: bool,
    pub exclude_dynamic_partitions: bool,
    pub disable_verity: bool,
    pub disable_verification: bool,

    /// Set when flash-all runs against the capture driver.
    pub capture: Option<Rc<RefCell<CaptureRecorder>>>,

    target_sparse_limit: Option<u64>,
}

impl FlashingPlan {
    pub fn new(driver: Box<dyn FastbootDriver>) -> Self {
        Self {
            driver,
            source: None,
            images: images::catalog(),
            product_out: None,
            slot_override: String::new(),
            current_slot: String::new(),
            secondary_slot: String::new(),
            sparse_limit: 0,
            fs_options: FsOptions::empty(),
            wants_wipe: false,
            skip_reboot: false,
            wants_set_active: false,
            skip_secondary: false,
            force_flash: false,
            should_optimize_flash_super: true,
            should_use_fastboot_info: true,
            exclude_dynamic_partitions: false,
            disable_verity: false,
            disable_verification: false,
            capture: None,
            target_sparse_limit: None,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Reads a file from the bound image source, or from the product
    /// output directory when no source is bound.
    pub fn read_image_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match &self.source {
            Some(source) => source.read_file(name),
            None => match &self.product_out {
                Some(dir) => match std::fs::read(dir.join(name)) {
                    Ok(data) => Ok(Some(data)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                },
                None => Ok(None),
            },
        }
    }

    /// The device's `max-download-size`, queried once per connection.
    pub(crate) fn target_sparse_limit(&mut self) -> u64 {
        if let Some(limit) = self.target_sparse_limit {
            return limit;
        }
        let limit = match self.driver.get_var("max-download-size") {
            Ok(value) => match crate::utils::parse_u64_any(&value) {
                Ok(limit) => limit,
                Err(_) => {
                    warn!("couldn't parse max-download-size '{value}'");
                    0
                }
            },
            Err(_) => 0,
        };
        if limit > 0 {
            debug!("target reported max download size of {limit} bytes");
        }
        self.target_sparse_limit = Some(limit);
        limit
    }

    /// Forgets cached device limits after a reboot into another fastboot
    /// instance.
    pub(crate) fn reset_target_limits(&mut self) {
        self.target_sparse_limit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_option_list() {
        assert_eq!(
            FsOptions::parse("casefold,projid").unwrap(),
            FsOptions::CASEFOLD | FsOptions::PROJID
        );
        assert!(FsOptions::parse("casefold,bogus").is_err());
        assert!(FsOptions::parse("").unwrap().is_empty());
    }
}
