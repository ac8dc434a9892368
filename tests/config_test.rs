use std::fs;
use std::path::Path;
use std::time::Duration;

use fbtool::config::{AppConfig, CONFIG_FILE};
use tempfile::TempDir;

// Use serial_test because genconfig works on the current directory
use serial_test::serial;

struct CwdGuard(std::path::PathBuf);

impl CwdGuard {
    fn enter(dir: &Path) -> Self {
        let old = std::env::current_dir().expect("current dir");
        std::env::set_current_dir(dir).expect("enter temp dir");
        CwdGuard(old)
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.0);
    }
}

#[test]
#[serial]
fn genconfig_writes_a_loadable_file() {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp = TempDir::new().expect("temp dir");
    let _cwd = CwdGuard::enter(temp.path());

    AppConfig::generate_config_file(false).expect("generate");
    let config = AppConfig::load_from_file(CONFIG_FILE).expect("load");
    assert_eq!(config.device().settle, Some(Duration::from_secs(3)));
    assert_eq!(config.flash().skip_reboot, Some(false));
    let vars = config.simulate.expect("simulate section").vars;
    assert_eq!(vars.get("max-download-size").map(String::as_str), Some("0x10000000"));
}

#[test]
#[serial]
fn genconfig_keeps_existing_files_unless_forced() {
    let temp = TempDir::new().expect("temp dir");
    let _cwd = CwdGuard::enter(temp.path());

    fs::write(CONFIG_FILE, "[flash]\nskip_reboot = true\n").expect("write config");
    assert!(AppConfig::generate_config_file(false).is_err());
    let kept = AppConfig::load_from_file(CONFIG_FILE).expect("load");
    assert_eq!(kept.flash().skip_reboot, Some(true));

    AppConfig::generate_config_file(true).expect("overwrite");
    let fresh = AppConfig::load_from_file(CONFIG_FILE).expect("load");
    assert_eq!(fresh.flash().skip_reboot, Some(false));
}

#[test]
fn bad_sizes_are_reported() {
    let config: AppConfig = toml::from_str("[flash]\nsparse_limit = \"lots\"\n").expect("parse");
    assert!(config.flash().sparse_limit_bytes().is_err());
}
