//! `android-info.txt` checks run before a flash-all.
//!
//! ```text
//! require board=alpha|beta
//! require version-bootloader=1234*
//! reject version-baseband=0.9
//! require-for-product:gamma version-bootloader=istanbul|constantinople
//! require partition-exists=vendor_dlkm
//! ```

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::LazyLock;

use crate::plan::FlashingPlan;

static REQUIRE_REJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(require\s+|reject\s+)?\s*(\S+)\s*=\s*(.*)$").expect("valid regex")
});

static REQUIRE_FOR_PRODUCT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^require-for-product:\s*(\S+)\s+(\S+)\s*=\s*(.*)$").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    /// Only applies to this product when set.
    pub product: Option<String>,
    /// `reject` lines fail when a value matches.
    pub invert: bool,
    pub options: Vec<String>,
}

impl Requirement {
    pub fn parse(line: &str) -> Option<Self> {
        let (caps, invert, product) = if let Some(caps) = REQUIRE_REJECT.captures(line) {
            let invert = caps.get(1).is_some_and(|m| m.as_str().trim() == "reject");
            (caps, invert, None)
        } else if let Some(caps) = REQUIRE_FOR_PRODUCT.captures(line) {
            let product = caps[1].to_string();
            (caps, false, Some(product))
        } else {
            return None;
        };
        let mut name = caps[2].to_string();
        if name == "board" {
            name = "product".to_string();
        }
        let options = caps[3].split('|').map(|o| o.trim().to_string()).collect();
        Some(Self {
            name,
            product,
            invert,
            options,
        })
    }

    /// Whether `value` satisfies one of the options, honoring `reject`.
    pub fn matches(&self, value: &str) -> bool {
        let hit = self.options.iter().any(|option| match option.strip_suffix('*') {
            Some(prefix) => value.starts_with(prefix),
            None => option == value,
        });
        hit != self.invert
    }
}

fn handle_partition_exists(plan: &mut FlashingPlan, options: &[String]) -> Result<()> {
    let partition = options.first().map(String::as_str).unwrap_or_default();
    let has_slot = plan.driver.get_var(&format!("has-slot:{partition}"));
    if !matches!(has_slot.as_deref(), Ok("yes") | Ok("no")) {
        bail!("device doesn't have required partition {partition}!");
    }
    let mut known = false;
    for image in plan.images.iter_mut() {
        if !image.is_secondary() && image.nickname == partition {
            image.optional_if_no_image = false;
            known = true;
        }
    }
    if !known {
        bail!("device requires partition {partition} which is not known to this version of fbtool");
    }
    Ok(())
}

fn check_requirement(plan: &mut FlashingPlan, current_product: &str, req: &Requirement) -> bool {
    if let Some(product) = &req.product {
        if product != current_product {
            return true;
        }
    }
    let value = if req.name == "product" && !current_product.is_empty() {
        current_product.to_string()
    } else {
        match plan.driver.get_var(&req.name) {
            Ok(value) => value,
            Err(_) => {
                error!("Device does not have {}", req.name);
                return false;
            }
        }
    };
    if req.matches(&value) {
        info!("Checking '{}' OKAY", req.name);
        return true;
    }
    error!("Device {} is '{}'.", req.name, value);
    error!(
        "Update {} '{}'.",
        if req.invert { "rejects" } else { "requires" },
        req.options.join("' or '")
    );
    false
}

/// Checks every line of `android-info.txt` against the device. Unmet
/// requirements abort unless `force`, which downgrades them to warnings.
pub fn check_requirements(plan: &mut FlashingPlan, data: &str, force: bool) -> Result<()> {
    let current_product = match plan.driver.get_var("product") {
        Ok(product) => product,
        Err(e) => {
            warn!("getvar:product FAILED ({e})");
            String::new()
        }
    };
    for line in data.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(req) = Requirement::parse(line) else {
            warn!("android-info.txt syntax error: {line}");
            continue;
        };
        if req.name == "partition-exists" {
            handle_partition_exists(plan, &req.options)?;
            continue;
        }
        if !check_requirement(plan, &current_product, &req) {
            if !force {
                bail!("requirements not met!");
            }
            warn!("requirements not met! but proceeding due to --force");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line_shapes() {
        let req = Requirement::parse("require board=alpha|beta").unwrap();
        assert_eq!(req.name, "product");
        assert_eq!(req.options, ["alpha", "beta"]);
        assert!(!req.invert);

        let req = Requirement::parse("reject version-baseband = 0.9 ").unwrap();
        assert!(req.invert);
        assert_eq!(req.options, ["0.9"]);

        let req = Requirement::parse("require-for-product:gamma version-bootloader=x|y").unwrap();
        assert_eq!(req.product.as_deref(), Some("gamma"));
        assert_eq!(req.name, "version-bootloader");

        assert!(Requirement::parse("garbage").is_none());
    }

    #[test]
    fn wildcards_and_reject() {
        let req = Requirement::parse("require version-bootloader=slider-1.*").unwrap();
        assert!(req.matches("slider-1.4"));
        assert!(!req.matches("slider-2.0"));
        let req = Requirement::parse("reject version-baseband=g5123*").unwrap();
        assert!(!req.matches("g5123-01"));
        assert!(req.matches("g7000"));
    }
}
