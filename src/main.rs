use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use fbtool::capture::{default_output_path, FlashCapturer};
use fbtool::commands::{run_commands, Command, SessionOptions};
use fbtool::config::{self, AppConfig, CONFIG_FILE};
use fbtool::device::{
    self, usb, DeviceRegistry, Discovery, SystemClock, SystemTransportFactory,
};
use fbtool::driver::sim::SimulatedDevice;
use fbtool::plan::{FlashingPlan, FsOptions};
use fbtool::utils::parse_size;

#[derive(Parser)]
#[command(name = "fbtool")]
#[command(about = "Flashing orchestration for fastboot devices", long_about = None)]
struct Cli {
    /// Device serial, USB path or tcp:/udp: address
    #[arg(short, long, global = true)]
    serial: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached and connected devices
    Devices {
        /// Show device paths
        #[arg(short, long)]
        long: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect to a network device and remember it
    Connect {
        /// tcp:<host>[:port] or udp:<host>[:port]
        serial: String,
    },

    /// Forget one or all network devices
    Disconnect { serial: Option<String> },

    /// Block until a device answers
    WaitForDevice,

    /// Run commands against a simulated device and print what would be sent
    DryRun {
        #[command(flatten)]
        plan: PlanArgs,

        /// Simulated variable, NAME=VALUE (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Commands, e.g. `flash boot boot.img reboot`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        commands: Vec<String>,
    },

    /// Turn a factory image archive into an optimized flashable archive
    Capture {
        #[command(flatten)]
        plan: PlanArgs,

        /// Factory image archive (.zip)
        factory: PathBuf,

        /// Output archive, defaults to <factory>-opt.zip
        out: Option<PathBuf>,
    },

    /// Generate configuration file (.fbtool.toml) in current directory
    Genconfig {
        /// Force overwrite existing configuration file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct PlanArgs {
    /// Wipe userdata, cache and metadata
    #[arg(short = 'w')]
    wipe: bool,

    /// Slot to flash: a letter, `other` or `all`
    #[arg(long)]
    slot: Option<String>,

    /// Mark a slot active after flashing; the current slot when no value is given
    #[arg(short = 'a', long, num_args = 0..=1, default_missing_value = "", value_name = "SLOT")]
    set_active: Option<String>,

    /// Don't flash secondary slots in flashall/update
    #[arg(long)]
    skip_secondary: bool,

    /// Don't reboot after flashall/update
    #[arg(long)]
    skip_reboot: bool,

    /// Set the disable-verity flag in vbmeta
    #[arg(long)]
    disable_verity: bool,

    /// Set the disable-verification flag in vbmeta
    #[arg(long)]
    disable_verification: bool,

    /// Ignore unmet requirements and flash dynamic partitions from the bootloader
    #[arg(long)]
    force: bool,

    /// Flash dynamic partitions one by one instead of as one super image
    #[arg(long)]
    disable_super_optimization: bool,

    /// Ignore fastboot-info.txt
    #[arg(long)]
    disable_fastboot_info: bool,

    /// Only flash partitions the bootloader can write
    #[arg(long)]
    exclude_dynamic_partitions: bool,

    /// Split sparse images to this size (K/M/G suffixes accepted)
    #[arg(short = 'S', long, value_name = "SIZE")]
    sparse_limit: Option<String>,

    /// casefold, projid, compress (comma separated)
    #[arg(long, value_name = "OPTIONS")]
    fs_options: Option<String>,

    /// Directory holding the build's images
    #[arg(long, value_name = "DIR")]
    product_out: Option<PathBuf>,
}

impl PlanArgs {
    fn sparse_limit(&self, flash: &config::FlashConfig) -> Result<u64> {
        match &self.sparse_limit {
            Some(limit) => parse_size(limit),
            None => Ok(flash.sparse_limit_bytes()?.unwrap_or(0)),
        }
    }

    fn apply(&self, plan: &mut FlashingPlan, app: &AppConfig) -> Result<()> {
        let flash = app.flash();
        plan.wants_wipe |= self.wipe;
        if let Some(slot) = &self.slot {
            plan.slot_override = slot.clone();
        }
        plan.skip_secondary |= self.skip_secondary || flash.skip_secondary.unwrap_or(false);
        plan.skip_reboot = self.skip_reboot || flash.skip_reboot.unwrap_or(false);
        plan.disable_verity = self.disable_verity;
        plan.disable_verification = self.disable_verification;
        plan.force_flash = self.force;
        plan.should_optimize_flash_super =
            !(self.disable_super_optimization || flash.disable_super_optimization.unwrap_or(false));
        plan.should_use_fastboot_info =
            !(self.disable_fastboot_info || flash.disable_fastboot_info.unwrap_or(false));
        plan.exclude_dynamic_partitions = self.exclude_dynamic_partitions;
        let limit = self.sparse_limit(&flash)?;
        if limit > 0 {
            plan.sparse_limit = limit;
        }
        if let Some(options) = &self.fs_options {
            plan.fs_options = FsOptions::parse(options)?;
        }
        plan.product_out =
            config::resolve_product_out(self.product_out.clone(), env_var, &flash);
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_var(spec: &str) -> Result<(String, String)> {
    let (name, value) = spec
        .split_once('=')
        .with_context(|| format!("expected NAME=VALUE, got '{spec}'"))?;
    Ok((name.to_string(), value.to_string()))
}

fn registry(app: &AppConfig) -> Result<DeviceRegistry> {
    let dir = match app.device().registry_dir {
        Some(dir) => dir,
        None => DeviceRegistry::default_dir()?,
    };
    Ok(DeviceRegistry::new(dir))
}

fn factory(app: &AppConfig) -> SystemTransportFactory {
    SystemTransportFactory {
        timeout: app.device().settle.unwrap_or(Duration::from_secs(3)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger, default info level, display file line number and time
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            use std::io::Write;
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}:{}] {level_style}{}{level_style:#}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    // Try to load configuration file
    let app_config = if std::path::Path::new(CONFIG_FILE).exists() {
        match AppConfig::load_from_file(CONFIG_FILE) {
            Ok(cfg) => {
                let abs_path = std::fs::canonicalize(CONFIG_FILE)
                    .unwrap_or_else(|_| std::path::PathBuf::from(CONFIG_FILE));
                info!("Using configuration file: {}", abs_path.display());
                cfg
            }
            Err(e) => {
                error!("Failed to load configuration file: {}, using defaults", e);
                AppConfig::default()
            }
        }
    } else {
        AppConfig::default()
    };
    let serial = config::resolve_serial(cli.serial.as_deref(), env_var, &app_config.device());

    match cli.command {
        Commands::Devices { long, json } => {
            let usb_devices = usb::list_fastboot_devices().unwrap_or_else(|e| {
                warn!("{e:#}");
                Vec::new()
            });
            let registry = registry(&app_config)?;
            let rows = device::list_devices(&mut factory(&app_config), &usb_devices, Some(&registry))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!("{}", row.format(long));
                }
            }
        }

        Commands::Connect { serial } => {
            let registry = registry(&app_config)?;
            let mut discovery = Discovery::new(factory(&app_config), SystemClock);
            device::connect(&mut discovery, &registry, &serial)?;
        }

        Commands::Disconnect { serial } => {
            device::disconnect(&registry(&app_config)?, serial.as_deref())?;
        }

        Commands::WaitForDevice => {
            let registry = registry(&app_config)?;
            let backoff = app_config.device().backoff.unwrap_or(Duration::from_secs(1));
            let mut discovery = Discovery::new(factory(&app_config), SystemClock)
                .with_registry(&registry)
                .with_backoff(backoff);
            discovery.open(serial.as_deref())?;
            info!("device found: {}", serial.as_deref().unwrap_or("any"));
        }

        Commands::DryRun {
            plan: plan_args,
            vars,
            commands,
        } => {
            let commands = Command::parse(&commands)?;
            let device = SimulatedDevice::with_vars(
                app_config.simulate.clone().unwrap_or_default().vars,
            );
            for spec in &vars {
                let (name, value) = parse_var(spec)?;
                device.set_var(name, value);
            }
            let mut plan = FlashingPlan::new(Box::new(device.clone()));
            plan_args.apply(&mut plan, &app_config)?;
            let options = SessionOptions {
                set_active: plan_args.set_active.clone(),
            };
            let result = run_commands(&mut plan, &commands, &options);
            for line in device.transcript() {
                info!("{line}");
            }
            result?;
        }

        Commands::Capture {
            plan: plan_args,
            factory,
            out,
        } => {
            let out = match out {
                Some(out) => out,
                None => default_output_path(&factory)?,
            };
            let sparse_limit = plan_args.sparse_limit(&app_config.flash())?;
            let vars: BTreeMap<String, String> =
                app_config.simulate.clone().unwrap_or_default().vars;
            let capturer = FlashCapturer::create(&out, sparse_limit, &vars)?;
            let mut plan = capturer.plan();
            plan_args.apply(&mut plan, &app_config)?;
            capturer.run(&mut plan, &factory)?;
            info!("Finished. Output written to {}", out.display());
        }

        Commands::Genconfig { force } => {
            if let Err(e) = AppConfig::generate_config_file(force) {
                error!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
