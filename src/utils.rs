use anyhow::{anyhow, bail, Result};

pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        bail!("size is empty");
    }

    let (num_str, unit) = s.split_at(s.len().saturating_sub(1));
    let (value, multiplier) = match unit.to_ascii_lowercase().as_str() {
        "k" => (num_str, 1024u64),
        "m" => (num_str, 1024u64 * 1024),
        "g" => (num_str, 1024u64 * 1024 * 1024),
        _ => (s, 1u64),
    };

    let num = parse_u64_any(value).map_err(|_| anyhow!("invalid size: {input}"))?;
    Ok(num.saturating_mul(multiplier))
}

pub fn parse_u64_any(input: &str) -> Result<u64> {
    let s = input.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| anyhow!("invalid hex: {input}"))
    } else {
        s.parse::<u64>().map_err(|_| anyhow!("invalid number: {input}"))
    }
}

/// Bootloaders report some numeric variables with stray whitespace and
/// implicit hex.
pub fn parse_numeric_var(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.starts_with("0x") || s.starts_with("0X") {
        parse_u64_any(s)
    } else {
        parse_u64_any(&format!("0x{s}"))
    }
}

pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

pub fn size_to_string(size: u64) -> String {
    if size >= 1024 * 1024 {
        format!("{} MiB", size / (1024 * 1024))
    } else if size >= 1024 {
        format!("{} KiB", size / 1024)
    } else {
        format!("{size} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_suffixes_and_hex() {
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("256M").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_size("0x1000").unwrap(), 4096);
        assert!(parse_size("").is_err());
    }

    #[test]
    fn numeric_vars_are_implicit_hex() {
        assert_eq!(parse_numeric_var(" 1000 ").unwrap(), 0x1000);
        assert_eq!(parse_numeric_var("0x20").unwrap(), 0x20);
        assert!(parse_numeric_var("zz").is_err());
    }

    #[test]
    fn human_sizes() {
        assert_eq!(size_to_string(3 * 1024 * 1024), "3 MiB");
        assert_eq!(size_to_string(2048), "2 KiB");
        assert_eq!(size_to_string(12), "12 B");
    }
}
