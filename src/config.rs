use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration};

use crate::capture::default_vars;
use crate::utils::parse_size;

pub const CONFIG_FILE: &str = ".fbtool.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash: Option<FlashConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulate: Option<SimulateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Where connected network devices are remembered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_dir: Option<PathBuf>,
    /// Pause between discovery rounds.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub backoff: Option<Duration>,
    /// Socket timeout for network devices.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub settle: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlashConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_out: Option<PathBuf>,
    /// `512M`, `0x20000000`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_secondary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reboot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_super_optimization: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_fastboot_info: Option<bool>,
}

impl FlashConfig {
    pub fn sparse_limit_bytes(&self) -> Result<Option<u64>> {
        self.sparse_limit
            .as_deref()
            .map(|s| parse_size(s).with_context(|| format!("invalid flash.sparse_limit '{s}'")))
            .transpose()
    }
}

/// Answers for `getvar` when no real device is involved.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SimulateConfig {
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl AppConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn generate_config_file(force: bool) -> Result<()> {
        if std::path::Path::new(CONFIG_FILE).exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                CONFIG_FILE
            );
        }

        fs::write(CONFIG_FILE, Self::generate_full_config()?)?;

        info!("Configuration file generated: {}", CONFIG_FILE);
        info!("Please edit this file to customize configuration");
        Ok(())
    }

    pub fn generate_full_config() -> Result<String> {
        let config = AppConfig {
            device: Some(DeviceConfig {
                serial: None,
                registry_dir: None,
                backoff: Some(Duration::from_secs(1)),
                settle: Some(Duration::from_secs(3)),
            }),
            flash: Some(FlashConfig {
                product_out: Some(PathBuf::from("out/target/product/generic")),
                sparse_limit: Some("256M".to_string()),
                skip_secondary: Some(false),
                skip_reboot: Some(false),
                disable_super_optimization: Some(false),
                disable_fastboot_info: Some(false),
            }),
            simulate: Some(SimulateConfig {
                vars: default_vars(256 * 1024 * 1024),
            }),
        };
        let toml_content = toml::to_string_pretty(&config)?;
        Ok(format!(
            "# fbtool configuration file\n# All fields are optional, command line arguments and environment variables override config file values\n\n{}",
            toml_content
        ))
    }

    pub fn device(&self) -> DeviceConfig {
        self.device.clone().unwrap_or_default()
    }

    pub fn flash(&self) -> FlashConfig {
        self.flash.clone().unwrap_or_default()
    }
}

/// Command line, then `FASTBOOT_DEVICE`, then `ANDROID_SERIAL`, then the
/// config file.
pub fn resolve_serial(
    cli: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
    config: &DeviceConfig,
) -> Option<String> {
    cli.map(str::to_string)
        .or_else(|| env("FASTBOOT_DEVICE").filter(|s| !s.is_empty()))
        .or_else(|| env("ANDROID_SERIAL").filter(|s| !s.is_empty()))
        .or_else(|| config.serial.clone())
}

/// Command line, then `ANDROID_PRODUCT_OUT`, then the config file.
pub fn resolve_product_out(
    cli: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
    config: &FlashConfig,
) -> Option<PathBuf> {
    cli.or_else(|| {
        env("ANDROID_PRODUCT_OUT")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    })
    .or_else(|| config.product_out.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_config_loads_back() {
        let text = AppConfig::generate_full_config().unwrap();
        let config: AppConfig = toml::from_str(&text).unwrap();
        let device = config.device();
        assert_eq!(device.backoff, Some(Duration::from_secs(1)));
        assert_eq!(config.flash().sparse_limit_bytes().unwrap(), Some(256 * 1024 * 1024));
        let vars = config.simulate.unwrap().vars;
        assert_eq!(vars.get("slot-count").map(String::as_str), Some("2"));
    }

    #[test]
    fn sections_are_optional() {
        let config: AppConfig = toml::from_str("[device]\nbackoff = \"250ms\"\n").unwrap();
        assert_eq!(config.device().backoff, Some(Duration::from_millis(250)));
        assert!(config.flash.is_none());
    }

    #[test]
    fn precedence() {
        let config = DeviceConfig {
            serial: Some("from-file".to_string()),
            ..Default::default()
        };
        let env = |name: &str| (name == "ANDROID_SERIAL").then(|| "from-env".to_string());
        assert_eq!(resolve_serial(Some("cli"), env, &config).as_deref(), Some("cli"));
        assert_eq!(resolve_serial(None, env, &config).as_deref(), Some("from-env"));
        assert_eq!(resolve_serial(None, |_| None, &config).as_deref(), Some("from-file"));

        let flash = FlashConfig::default();
        assert_eq!(resolve_product_out(None, |_| None, &flash), None);
        assert_eq!(
            resolve_product_out(None, |_| Some("/out".to_string()), &flash),
            Some(PathBuf::from("/out"))
        );
    }
}
