//! The positional command language: `getvar product`, `flash boot`,
//! `flashall`, `update image.zip`, ...
//!
//! Commands are parsed up front so a typo fails before the device is
//! touched. Most run in order as they are reached; reboots and partition
//! deletions are queued and run after everything else, behind any `-w`
//! wipes.

use anyhow::{bail, Context, Result};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use crate::avb::is_vbmeta_partition;
use crate::buffer::{load_buf, BufferKind};
use crate::flashall::{cancel_snapshot_if_needed, FlashAllTool};
use crate::format::{fb_perform_format, FsGenerator};
use crate::images::{find_item, find_item_given_name};
use crate::lp::LpMetadata;
use crate::partition::{fetch_partition, wipe_super};
use crate::plan::FlashingPlan;
use crate::slot::{do_for_partitions, get_current_slot, verify_slot};
use crate::source::{LocalImageSource, ZipImageSource};
use crate::task::{run_tasks, FlashTask, RebootTarget, Task};

const BOOT_MAGIC: &[u8] = b"ANDROID!";
/// Smallest boot image header (v3).
const BOOT_HEADER_MIN_SIZE: usize = 1580;
const SIGNATURE_SIZE: usize = 256;
const FLASHING_COMMANDS: [&str; 5] = [
    "unlock",
    "lock",
    "unlock_critical",
    "lock_critical",
    "get_unlock_ability",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetVar(String),
    Erase(String),
    Format {
        fs_type: String,
        size: String,
        partition: String,
    },
    Signature(PathBuf),
    /// `None` is a plain reboot, dropped when reboots are skipped.
    Reboot(Option<RebootTarget>),
    Continue,
    Boot(PathBuf),
    Flash {
        partition: String,
        file: Option<PathBuf>,
    },
    FlashAll,
    Update(PathBuf),
    SetActive(String),
    Stage(PathBuf),
    GetStaged(PathBuf),
    Oem(Vec<String>),
    Flashing(String),
    CreateLogicalPartition {
        partition: String,
        size: String,
    },
    DeleteLogicalPartition(String),
    ResizeLogicalPartition {
        partition: String,
        size: String,
    },
    Gsi(Vec<String>),
    WipeSuper(Option<PathBuf>),
    SnapshotUpdate(Option<String>),
    Fetch {
        partition: String,
        out: PathBuf,
    },
}

struct Args<'a> {
    args: &'a [String],
    pos: usize,
}

impl<'a> Args<'a> {
    fn next(&mut self, command: &str) -> Result<String> {
        match self.args.get(self.pos) {
            Some(arg) => {
                self.pos += 1;
                Ok(arg.clone())
            }
            None => bail!("expected argument for '{command}'"),
        }
    }

    fn next_opt(&mut self) -> Option<String> {
        let arg = self.args.get(self.pos).cloned();
        if arg.is_some() {
            self.pos += 1;
        }
        arg
    }

    fn remaining(&self) -> usize {
        self.args.len() - self.pos
    }

    fn rest(&mut self) -> Vec<String> {
        let rest = self.args[self.pos..].to_vec();
        self.pos = self.args.len();
        rest
    }
}

impl Command {
    /// Parses a whole command line worth of positional arguments.
    pub fn parse(args: &[String]) -> Result<Vec<Command>> {
        let mut args = Args { args, pos: 0 };
        let mut commands = Vec::new();
        while let Some(command) = args.next_opt() {
            commands.push(Self::parse_one(&command, &mut args)?);
        }
        Ok(commands)
    }

    fn parse_one(command: &str, args: &mut Args<'_>) -> Result<Command> {
        Ok(match command {
            "getvar" => Command::GetVar(args.next(command)?),
            "erase" => Command::Erase(args.next(command)?),
            c if c == "format" || c.starts_with("format:") => {
                let mut pieces = c.split(':').skip(1);
                let fs_type = pieces.next().unwrap_or_default().to_string();
                let size = pieces.next().unwrap_or_default().to_string();
                Command::Format {
                    fs_type,
                    size,
                    partition: args.next(command)?,
                }
            }
            "signature" => Command::Signature(args.next(command)?.into()),
            "reboot" => match args.remaining() {
                0 => Command::Reboot(None),
                1 => Command::Reboot(Some(RebootTarget::parse(&args.next(command)?)?)),
                _ => bail!("junk after reboot command"),
            },
            "reboot-bootloader" => Command::Reboot(Some(RebootTarget::Bootloader)),
            "reboot-recovery" => Command::Reboot(Some(RebootTarget::Recovery)),
            "reboot-fastboot" => Command::Reboot(Some(RebootTarget::Fastboot)),
            "continue" => Command::Continue,
            "boot" => {
                let image = args.next(command)?;
                if args.remaining() > 0 {
                    bail!("boot takes a prebuilt boot image only; building one from a kernel and ramdisk is not supported");
                }
                Command::Boot(image.into())
            }
            "flash" => Command::Flash {
                partition: args.next(command)?,
                file: args.next_opt().map(PathBuf::from),
            },
            "flashall" => Command::FlashAll,
            "update" => Command::Update(
                args.next_opt()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("update.zip")),
            ),
            "set_active" => Command::SetActive(args.next(command)?),
            "stage" => Command::Stage(args.next(command)?.into()),
            "get_staged" => Command::GetStaged(args.next(command)?.into()),
            "oem" => {
                let rest = args.rest();
                if rest.is_empty() {
                    bail!("empty oem command");
                }
                Command::Oem(rest)
            }
            "flashing" => {
                let rest = args.rest();
                match rest.as_slice() {
                    [] => bail!("missing 'flashing' command"),
                    [sub] if FLASHING_COMMANDS.contains(&sub.as_str()) => {
                        Command::Flashing(sub.clone())
                    }
                    [sub, ..] => bail!("unknown 'flashing' command {sub}"),
                }
            }
            "create-logical-partition" => Command::CreateLogicalPartition {
                partition: args.next(command)?,
                size: args.next(command)?,
            },
            "delete-logical-partition" => Command::DeleteLogicalPartition(args.next(command)?),
            "resize-logical-partition" => Command::ResizeLogicalPartition {
                partition: args.next(command)?,
                size: args.next(command)?,
            },
            "gsi" => {
                let rest = args.rest();
                if rest.is_empty() {
                    bail!("invalid gsi command");
                }
                Command::Gsi(rest)
            }
            "wipe-super" => Command::WipeSuper(args.next_opt().map(PathBuf::from)),
            "snapshot-update" => {
                let arg = args.next_opt();
                if let Some(arg) = &arg {
                    if arg != "cancel" && arg != "merge" {
                        bail!("expected: snapshot-update [cancel|merge]");
                    }
                }
                Command::SnapshotUpdate(arg)
            }
            "fetch" => Command::Fetch {
                partition: args.next(command)?,
                out: args.next(command)?.into(),
            },
            other => bail!("unknown command {other}"),
        })
    }
}

/// Options that apply to the whole command line rather than to one command.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// `--set-active[=slot]`: `Some("")` means the current (or overridden)
    /// slot.
    pub set_active: Option<String>,
}

/// Runs parsed commands against the plan's device.
pub fn run_commands(
    plan: &mut FlashingPlan,
    commands: &[Command],
    options: &SessionOptions,
) -> Result<()> {
    if !plan.slot_override.is_empty() {
        plan.slot_override = verify_slot(plan.driver.as_mut(), &plan.slot_override, true)?;
    }
    let next_active = resolve_next_active(plan, options)?;

    let mut tasks = Vec::new();
    for command in commands {
        run_command(plan, command, &mut tasks)?;
    }

    if plan.wants_wipe {
        if plan.force_flash {
            cancel_snapshot_if_needed(plan)?;
        }
        let wipes = ["userdata", "cache", "metadata"].map(Task::wipe);
        tasks.splice(0..0, wipes);
    }
    if let Some(slot) = next_active {
        plan.driver.set_active(&slot)?;
    }
    run_tasks(plan, &tasks)
}

fn resolve_next_active(plan: &mut FlashingPlan, options: &SessionOptions) -> Result<Option<String>> {
    let Some(requested) = &options.set_active else {
        return Ok(None);
    };
    plan.wants_set_active = true;
    if !requested.is_empty() {
        return verify_slot(plan.driver.as_mut(), requested, false).map(Some);
    }
    if !plan.slot_override.is_empty() {
        let slot = plan.slot_override.clone();
        return verify_slot(plan.driver.as_mut(), &slot, false).map(Some);
    }
    let current = get_current_slot(plan.driver.as_mut());
    if current.is_empty() {
        plan.wants_set_active = false;
        return Ok(None);
    }
    verify_slot(plan.driver.as_mut(), &current, false).map(Some)
}

fn run_command(plan: &mut FlashingPlan, command: &Command, tasks: &mut Vec<Task>) -> Result<()> {
    let slot = plan.slot_override.clone();
    match command {
        Command::GetVar(name) => {
            let value = plan
                .driver
                .get_var(name)
                .with_context(|| format!("getvar:{name} FAILED"))?;
            println!("{name}: {value}");
        }
        Command::Erase(partition) => {
            do_for_partitions(plan, partition, &slot, true, |plan, partition| {
                if let Ok(fs_type) = plan.driver.get_var(&format!("partition-type:{partition}")) {
                    if FsGenerator::for_type(&fs_type).is_some() {
                        warn!("Did you mean to fastboot format this {fs_type} partition?");
                    }
                }
                plan.driver.erase(partition)
            })?;
        }
        Command::Format {
            fs_type,
            size,
            partition,
        } => {
            do_for_partitions(plan, partition, &slot, true, |plan, partition| {
                fb_perform_format(plan, partition, false, fs_type, size)
            })?;
        }
        Command::Signature(path) => {
            let data = fs::read(path)
                .with_context(|| format!("could not load '{}'", path.display()))?;
            if data.len() != SIGNATURE_SIZE {
                bail!("signature must be {SIGNATURE_SIZE} bytes (got {})", data.len());
            }
            plan.driver.download("signature", &data)?;
            plan.driver.raw_command("signature", "installing signature")?;
        }
        Command::Reboot(None) => {
            if !plan.skip_reboot {
                tasks.push(Task::reboot(RebootTarget::System));
            }
        }
        Command::Reboot(Some(target)) => tasks.push(Task::reboot(*target)),
        Command::Continue => plan.driver.continue_boot()?,
        Command::Boot(path) => {
            let data = load_boot_image(path)?;
            plan.driver.download("boot.img", &data)?;
            plan.driver.boot()?;
        }
        Command::Flash { partition, file } => {
            let file = match file {
                Some(file) => file.clone(),
                None => find_item(partition, plan.product_out.as_deref())?,
            };
            let fname = file.to_string_lossy().into_owned();
            FlashTask::new(&slot, partition, fname, is_vbmeta_partition(partition))
                .run(plan)?;
        }
        Command::FlashAll => {
            if plan.slot_override == "all" {
                warn!("slot set to 'all'. Secondary slots will not be flashed.");
                plan.skip_secondary = true;
            }
            if plan.source.is_none() {
                let Some(dir) = plan.product_out.clone() else {
                    bail!("ANDROID_PRODUCT_OUT not set");
                };
                plan.source = Some(Box::new(LocalImageSource::new(dir)));
            }
            FlashAllTool::new(plan).flash()?;
            if !plan.skip_reboot {
                tasks.push(Task::reboot(RebootTarget::System));
            }
        }
        Command::Update(path) => {
            if plan.slot_override == "all" {
                warn!("slot set to 'all'. Secondary slots will not be flashed.");
            }
            plan.source = Some(Box::new(ZipImageSource::open(path)?));
            FlashAllTool::new(plan).flash()?;
            if !plan.skip_reboot {
                tasks.push(Task::reboot(RebootTarget::System));
            }
        }
        Command::SetActive(requested) => {
            let slot = verify_slot(plan.driver.as_mut(), requested, false)?;
            plan.driver.set_active(&slot)?;
        }
        Command::Stage(path) => {
            let mut buf = load_buf(path, plan)?;
            if !matches!(buf.kind, BufferKind::Fd) {
                bail!("cannot load '{}'", path.display());
            }
            let name = path.to_string_lossy();
            plan.driver.download_file(&name, &mut buf.file, buf.size)?;
        }
        Command::GetStaged(path) => plan.driver.upload(path)?,
        Command::Oem(args) => {
            plan.driver.raw_command(&format!("oem {}", args.join(" ")), "")?;
        }
        Command::Flashing(sub) => {
            plan.driver.raw_command(&format!("flashing {sub}"), "")?;
        }
        Command::CreateLogicalPartition { partition, size } => {
            plan.driver.create_partition(partition, size)?;
        }
        Command::DeleteLogicalPartition(partition) => tasks.push(Task::delete(partition)),
        Command::ResizeLogicalPartition { partition, size } => {
            Task::resize(partition, size, &slot).run(plan)?;
        }
        Command::Gsi(args) => {
            plan.driver.raw_command(&format!("gsi:{}", args.join(":")), "")?;
        }
        Command::WipeSuper(image) => {
            let image = match image {
                Some(image) => image.clone(),
                None => find_item_given_name("super_empty.img", plan.product_out.as_deref())?,
            };
            let blob = fs::read(&image)
                .with_context(|| format!("could not read '{}'", image.display()))?;
            let metadata = LpMetadata::from_image_blob(&blob)
                .with_context(|| format!("could not parse '{}'", image.display()))?;
            wipe_super(plan, &metadata, &slot)?;
        }
        Command::SnapshotUpdate(arg) => {
            plan.driver
                .snapshot_update_command(arg.as_deref().unwrap_or_default())?;
        }
        Command::Fetch { partition, out } => {
            do_for_partitions(plan, partition, &slot, true, |plan, partition| {
                let mut file = File::create(out)
                    .with_context(|| format!("could not create '{}'", out.display()))?;
                fetch_partition(plan, partition, &mut file)?;
                Ok(())
            })?;
        }
    }
    Ok(())
}

/// Reads a prebuilt boot image, refusing anything else.
fn load_boot_image(path: &Path) -> Result<Vec<u8>> {
    let data = fs::read(path).with_context(|| format!("cannot load '{}'", path.display()))?;
    if data.len() < BOOT_HEADER_MIN_SIZE {
        bail!("cannot load '{}': too short", path.display());
    }
    if !data.starts_with(BOOT_MAGIC) {
        bail!("'{}' is not a boot image", path.display());
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn parses_a_command_line() {
        let commands = Command::parse(&args(
            "getvar product format::0x4000 userdata flash boot out/boot.img reboot",
        ))
        .unwrap();
        assert_eq!(
            commands,
            vec![
                Command::GetVar("product".to_string()),
                Command::Format {
                    fs_type: String::new(),
                    size: "0x4000".to_string(),
                    partition: "userdata".to_string(),
                },
                Command::Flash {
                    partition: "boot".to_string(),
                    file: Some(PathBuf::from("out/boot.img")),
                },
                Command::Reboot(None),
            ]
        );
    }

    #[test]
    fn greedy_commands_take_the_rest() {
        assert_eq!(
            Command::parse(&args("oem device-info now")).unwrap(),
            vec![Command::Oem(args("device-info now"))]
        );
        assert_eq!(
            Command::parse(&args("gsi wipe")).unwrap(),
            vec![Command::Gsi(args("wipe"))]
        );
        assert_eq!(
            Command::parse(&args("update")).unwrap(),
            vec![Command::Update(PathBuf::from("update.zip"))]
        );
    }

    #[test]
    fn rejects_bad_command_lines() {
        assert!(Command::parse(&args("frobnicate")).is_err());
        assert!(Command::parse(&args("reboot bootloader now")).is_err());
        assert!(Command::parse(&args("reboot sideways")).is_err());
        assert!(Command::parse(&args("flashing unlock now")).is_err());
        assert!(Command::parse(&args("flashing")).is_err());
        assert!(Command::parse(&args("snapshot-update undo")).is_err());
        assert!(Command::parse(&args("boot kernel ramdisk")).is_err());
        assert!(Command::parse(&args("oem")).is_err());
        assert!(Command::parse(&args("erase")).is_err());
    }
}
