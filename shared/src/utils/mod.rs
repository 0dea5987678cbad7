//! Utility functions and helpers

pub mod time;

use anyhow::{Context, Result};

/// Parse a byte size with an optional K/M/G suffix (e.g. "32M", "512K", "4096")
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 1024),
        Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let value: usize = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size: {}", s))?;

    value
        .checked_mul(multiplier)
        .with_context(|| format!("size overflows: {}", s))
}

/// Parse a duration string (e.g. "250us", "10ms", "30s", "5m")
pub fn parse_duration(s: &str) -> Result<std::time::Duration> {
    let s = s.trim();

    if let Some(num_str) = s.strip_suffix("us") {
        let micros: u64 = num_str.parse()?;
        Ok(std::time::Duration::from_micros(micros))
    } else if let Some(num_str) = s.strip_suffix("ms") {
        let millis: u64 = num_str.parse()?;
        Ok(std::time::Duration::from_millis(millis))
    } else if let Some(num_str) = s.strip_suffix('s') {
        let secs: u64 = num_str.parse()?;
        Ok(std::time::Duration::from_secs(secs))
    } else if let Some(num_str) = s.strip_suffix('m') {
        let mins: u64 = num_str.parse()?;
        let secs = mins
            .checked_mul(60)
            .with_context(|| format!("duration overflows: {}", s))?;
        Ok(std::time::Duration::from_secs(secs))
    } else {
        // Default to microseconds, the unit of the sampling interval
        let micros: u64 = s.parse()?;
        Ok(std::time::Duration::from_micros(micros))
    }
}

/// Parse an address in the sampled process, hex with a `0x` prefix or decimal
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).with_context(|| format!("invalid address: {}", s)),
        None => s.parse().with_context(|| format!("invalid address: {}", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("32M").unwrap(), 32 * 1024 * 1024);
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250us").unwrap().as_micros(), 250);
        assert_eq!(parse_duration("10ms").unwrap().as_millis(), 10);
        assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
        assert_eq!(parse_duration("5m").unwrap().as_secs(), 300);
        assert_eq!(parse_duration("100").unwrap().as_micros(), 100);
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert!(parse_duration("307445734561825860m").is_ok());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x7f00").unwrap(), 0x7f00);
        assert_eq!(parse_address("4096").unwrap(), 4096);
        assert!(parse_address("0xzz").is_err());
    }
}
