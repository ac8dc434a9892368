use anyhow::{bail, Result};

use crate::driver::FastbootDriver;
use crate::plan::FlashingPlan;

/// Number of A/B slots the device reports; 0 when unknown.
pub fn get_slot_count(driver: &mut dyn FastbootDriver) -> u32 {
    driver
        .get_var("slot-count")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

pub fn supports_ab(driver: &mut dyn FastbootDriver) -> bool {
    get_slot_count(driver) >= 2
}

/// The active slot letter, without a leading underscore; empty when the
/// device does not say.
pub fn get_current_slot(driver: &mut dyn FastbootDriver) -> String {
    match driver.get_var("current-slot") {
        Ok(slot) => slot.trim().trim_start_matches('_').to_string(),
        Err(_) => String::new(),
    }
}

/// The slot after `current` in `a, b, c, ...` order, wrapping around.
///
/// Returns `None` when the device has no slots or no current slot. Slot
/// names outside `a..a+count` are not something this tool can reason
/// about and are rejected.
pub fn get_other_slot(current: &str, count: u32) -> Result<Option<String>> {
    if count == 0 || current.is_empty() {
        return Ok(None);
    }
    if count > 26 {
        bail!("unsupported slot configuration: {count} slots");
    }
    let mut chars = current.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        bail!("unsupported slot name '{current}'");
    };
    if !c.is_ascii_lowercase() || (c as u32 - 'a' as u32) >= count {
        bail!("unsupported slot name '{current}' for a device with {count} slots");
    }
    let next = (c as u32 - 'a' as u32 + 1) % count + 'a' as u32;
    Ok(char::from_u32(next).map(String::from))
}

pub fn get_other_slot_for_device(driver: &mut dyn FastbootDriver) -> Result<Option<String>> {
    let count = get_slot_count(driver);
    let current = get_current_slot(driver);
    get_other_slot(&current, count)
}

/// Validates a user supplied slot name and resolves `other`.
///
/// `all` is returned as is when `allow_all`, otherwise it means slot `a`.
pub fn verify_slot(driver: &mut dyn FastbootDriver, slot: &str, allow_all: bool) -> Result<String> {
    let count = get_slot_count(driver);
    if slot == "all" {
        if allow_all {
            return Ok("all".to_string());
        }
        if count > 0 {
            return Ok("a".to_string());
        }
        bail!("No known slots");
    }
    if count == 0 {
        bail!("Device does not support slots");
    }
    if slot == "other" {
        return match get_other_slot_for_device(driver)? {
            Some(other) => Ok(other),
            None => bail!("No known slots"),
        };
    }
    let mut chars = slot.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_lowercase() && (c as u32 - 'a' as u32) < count.min(26) {
            return Ok(slot.to_string());
        }
    }
    let supported: Vec<String> = (0..count.min(26))
        .filter_map(|i| char::from_u32('a' as u32 + i).map(String::from))
        .collect();
    bail!(
        "Slot {slot} does not exist. supported slots are: {}",
        supported.join(", ")
    );
}

/// Runs `f` on `part` with the slot suffix it needs.
///
/// `part` may carry a `:suffix` (e.g. `vendor_boot:default`); the slot is
/// appended to the first token. An empty `slot` means the current slot.
pub fn do_for_partition<F>(
    plan: &mut FlashingPlan,
    part: &str,
    slot: &str,
    force_slot: bool,
    f: &mut F,
) -> Result<()>
where
    F: FnMut(&mut FlashingPlan, &str) -> Result<()>,
{
    let mut tokens: Vec<String> = part.split(':').map(str::to_string).collect();
    let has_slot = plan
        .driver
        .get_var(&format!("has-slot:{}", tokens[0]))
        .unwrap_or_else(|_| "no".to_string());
    if has_slot == "yes" {
        let suffix = if slot.is_empty() {
            let current = get_current_slot(plan.driver.as_mut());
            if current.is_empty() {
                bail!("Failed to identify current slot");
            }
            current
        } else {
            slot.to_string()
        };
        tokens[0] = format!("{}_{}", tokens[0], suffix);
        f(plan, &tokens.join(":"))
    } else {
        if force_slot && !slot.is_empty() {
            warn!(
                "{} does not support slots, and slot {} was requested",
                tokens[0], slot
            );
        }
        f(plan, part)
    }
}

/// Like [`do_for_partition`], expanding `slot == "all"` to every slot of a
/// slotted partition.
pub fn do_for_partitions<F>(
    plan: &mut FlashingPlan,
    part: &str,
    slot: &str,
    force_slot: bool,
    mut f: F,
) -> Result<()>
where
    F: FnMut(&mut FlashingPlan, &str) -> Result<()>,
{
    if slot != "all" {
        return do_for_partition(plan, part, slot, force_slot, &mut f);
    }
    let base = part.split(':').next().unwrap_or(part);
    let has_slot = match plan.driver.get_var(&format!("has-slot:{base}")) {
        Ok(v) => v,
        Err(e) => bail!("Could not check if partition {base} has slot {slot}: {e}"),
    };
    if has_slot == "yes" {
        let count = get_slot_count(plan.driver.as_mut());
        for i in 0..count.min(26) {
            let letter = char::from_u32('a' as u32 + i).map(String::from).unwrap_or_default();
            do_for_partition(plan, part, &letter, force_slot, &mut f)?;
        }
        Ok(())
    } else {
        do_for_partition(plan, part, "", force_slot, &mut f)
    }
}

/// Marks `slot_override` (or the current slot) active on A/B devices.
pub fn set_active_slot(plan: &mut FlashingPlan, slot_override: &str) -> Result<()> {
    if !supports_ab(plan.driver.as_mut()) {
        return Ok(());
    }
    if slot_override.is_empty() {
        let current = get_current_slot(plan.driver.as_mut());
        if !current.is_empty() {
            plan.driver.set_active(&current)?;
        }
    } else {
        plan.driver.set_active(slot_override)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::sim::SimulatedDevice;

    #[test]
    fn other_slot_cycles() {
        assert_eq!(get_other_slot("a", 2).unwrap().as_deref(), Some("b"));
        assert_eq!(get_other_slot("b", 2).unwrap().as_deref(), Some("a"));
        assert_eq!(get_other_slot("c", 3).unwrap().as_deref(), Some("a"));
        assert_eq!(get_other_slot("a", 0).unwrap(), None);
        assert_eq!(get_other_slot("", 2).unwrap(), None);
    }

    #[test]
    fn odd_slot_names_are_rejected() {
        assert!(get_other_slot("c", 2).is_err());
        assert!(get_other_slot("ab", 2).is_err());
        assert!(get_other_slot("A", 2).is_err());
        assert!(get_other_slot("a", 27).is_err());
    }

    #[test]
    fn user_slots_are_verified() {
        let mut device = SimulatedDevice::with_vars([("slot-count", "2"), ("current-slot", "b")]);
        assert_eq!(verify_slot(&mut device, "a", false).unwrap(), "a");
        assert_eq!(verify_slot(&mut device, "other", false).unwrap(), "a");
        assert_eq!(verify_slot(&mut device, "all", true).unwrap(), "all");
        assert_eq!(verify_slot(&mut device, "all", false).unwrap(), "a");
        let err = verify_slot(&mut device, "c", false).unwrap_err();
        assert!(err.to_string().contains("supported slots are: a, b"), "{err}");

        let mut single = SimulatedDevice::new();
        assert!(verify_slot(&mut single, "a", false).is_err());
        assert!(verify_slot(&mut single, "all", false).is_err());
    }

    #[test]
    fn all_slots_expand_for_slotted_partitions() {
        let device = SimulatedDevice::with_vars([
            ("slot-count", "2"),
            ("current-slot", "a"),
            ("has-slot:boot", "yes"),
            ("has-slot:radio", "no"),
        ]);
        let mut plan = FlashingPlan::new(Box::new(device));
        let mut seen = Vec::new();
        do_for_partitions(&mut plan, "boot", "all", true, |_, p| {
            seen.push(p.to_string());
            Ok(())
        })
        .unwrap();
        do_for_partitions(&mut plan, "radio", "all", true, |_, p| {
            seen.push(p.to_string());
            Ok(())
        })
        .unwrap();
        do_for_partitions(&mut plan, "boot", "", true, |_, p| {
            seen.push(p.to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, ["boot_a", "boot_b", "radio", "boot_a"]);
    }
}
