//! `fastboot-info.txt`: a build-provided task list that replaces the
//! built-in image catalog.
//!
//! ```text
//! version 1
//! flash --apply-vbmeta vbmeta
//! flash --slot-other system system_other.img
//! reboot fastboot
//! update-super
//! if-wipe erase userdata
//! ```

use anyhow::{anyhow, bail, Result};

use crate::plan::FlashingPlan;
use crate::task::{RebootTarget, Task};

/// Highest `fastboot-info.txt` version this tool understands.
pub const FASTBOOT_INFO_VERSION: u32 = 1;

fn check_version(words: &[&str]) -> Result<()> {
    if words.len() != 2 || words[0] != "version" {
        bail!(
            "unknown characters in version info in fastboot-info.txt -> {}",
            words.join(" ")
        );
    }
    let version: u32 = words[1].parse().map_err(|_| {
        anyhow!(
            "version number contains non-numeric characters in fastboot-info.txt -> {}",
            words.join(" ")
        )
    })?;
    if version > FASTBOOT_INFO_VERSION {
        bail!(
            "fastboot-info.txt version: {version} not compatible with host tool version --> {FASTBOOT_INFO_VERSION}"
        );
    }
    Ok(())
}

fn parse_flash(plan: &FlashingPlan, args: &[&str]) -> Result<Task> {
    let mut apply_vbmeta = false;
    let mut slot = plan.slot_override.as_str();
    let mut partition = None;
    let mut image = None;
    for &arg in args {
        match arg {
            "--apply-vbmeta" => apply_vbmeta = true,
            "--slot-other" => slot = plan.secondary_slot.as_str(),
            _ if partition.is_none() => partition = Some(arg),
            _ if image.is_none() => image = Some(arg),
            _ => bail!(
                "unknown argument {arg} in fastboot-info.txt. parts: {}",
                args.join(" ")
            ),
        }
    }
    let Some(partition) = partition else {
        bail!(
            "partition name not found when parsing fastboot-info.txt. parts: {}",
            args.join(" ")
        );
    };
    let image = image
        .map(str::to_string)
        .unwrap_or_else(|| format!("{partition}.img"));
    Ok(Task::flash(slot, partition, &image, apply_vbmeta))
}

fn parse_line(plan: &FlashingPlan, words: &[&str]) -> Result<Task> {
    match words {
        ["flash", args @ ..] => parse_flash(plan, args),
        ["reboot"] => Ok(Task::reboot(RebootTarget::System)),
        ["reboot", target] => Ok(Task::reboot(RebootTarget::parse(target)?)),
        ["erase", partition] => Ok(Task::wipe(partition)),
        ["update-super"] => Ok(Task::UpdateSuper(crate::task::UpdateSuperTask)),
        _ => bail!(
            "unknown command parsing fastboot-info.txt line: {}",
            words.join(" ")
        ),
    }
}

/// Turns the script into tasks, honoring `if-wipe` against
/// `plan.wants_wipe`. Any malformed line rejects the whole script.
pub fn parse_fastboot_info(plan: &FlashingPlan, text: &str) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    let mut seen_version = false;
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words: Vec<&str> = line.split_whitespace().collect();
        if !seen_version {
            if words[0] != "version" {
                bail!("fastboot-info.txt must start with a version line, found: {line}");
            }
            check_version(&words)?;
            seen_version = true;
            continue;
        }
        if words[0] == "version" {
            bail!("duplicate version line {} in fastboot-info.txt", number + 1);
        }
        if words[0] == "if-wipe" {
            if words.len() < 2 {
                bail!("if-wipe without a command in fastboot-info.txt");
            }
            if !plan.wants_wipe {
                continue;
            }
            words.remove(0);
        }
        tasks.push(parse_line(plan, &words)?);
    }
    if !seen_version {
        bail!("fastboot-info.txt has no version line");
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::SimulatedDevice;

    fn plan() -> FlashingPlan {
        let mut plan = FlashingPlan::new(Box::new(SimulatedDevice::new()));
        plan.secondary_slot = "b".to_string();
        plan
    }

    fn render(tasks: &[Task]) -> Vec<String> {
        tasks.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn parses_every_command() {
        let text = "version 1\n\
                    # comment\n\
                    flash --apply-vbmeta vbmeta\n\
                    flash --slot-other system system_other.img\n\
                    reboot fastboot\n\
                    update-super\n\
                    flash product\n\
                    reboot\n";
        let tasks = parse_fastboot_info(&plan(), text).unwrap();
        assert_eq!(
            render(&tasks),
            [
                "flash --apply-vbmeta vbmeta",
                "flash --slot=b system system_other.img",
                "reboot fastboot",
                "update-super",
                "flash product",
                "reboot",
            ]
        );
    }

    #[test]
    fn if_wipe_follows_the_plan() {
        let text = "version 1\nif-wipe erase userdata\nflash boot\n";
        let mut plan = plan();
        assert_eq!(render(&parse_fastboot_info(&plan, text).unwrap()), ["flash boot"]);
        plan.wants_wipe = true;
        assert_eq!(
            render(&parse_fastboot_info(&plan, text).unwrap()),
            ["erase userdata", "flash boot"]
        );
    }

    #[test]
    fn rejects_bad_scripts() {
        let plan = plan();
        assert!(parse_fastboot_info(&plan, "flash boot\n").is_err());
        assert!(parse_fastboot_info(&plan, "version 2\nflash boot\n").is_err());
        assert!(parse_fastboot_info(&plan, "version x\n").is_err());
        assert!(parse_fastboot_info(&plan, "version 1\nflash a b c\n").is_err());
        assert!(parse_fastboot_info(&plan, "version 1\nreboot sideways\n").is_err());
        assert!(parse_fastboot_info(&plan, "version 1\nerase\n").is_err());
        assert!(parse_fastboot_info(&plan, "").is_err());
    }
}
