//! Relative duration strings such as `+1 hour`, `30 minutes` or `15m`.
//!
//! A string is one or more `<count> <unit>` components, optionally prefixed
//! with `+`; components are summed (`1 hour 30 minutes`).

use std::time::Duration;

use crate::errors::{GcloudError, Result};

pub const DEFAULT_RELATIVE_DURATION: &str = "+1 hour";

fn unit_seconds(unit: &str) -> Option<u64> {
    let secs = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return None,
    };
    Some(secs)
}

/// Parse a relative duration. Units are case-insensitive.
pub fn parse_relative_duration(input: &str) -> Result<Duration> {
    let invalid = || GcloudError::InvalidArgument(format!("Invalid relative duration: {input:?}"));

    let trimmed = input.trim();
    let body = trimmed.strip_prefix('+').unwrap_or(trimmed).to_ascii_lowercase();
    let mut rest = body.trim_start();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let count: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = rest[digits..].trim_start();

        let letters = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let per_unit = unit_seconds(&rest[..letters]).ok_or_else(invalid)?;
        rest = rest[letters..].trim_start();

        total = count
            .checked_mul(per_unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
    }
    Ok(Duration::from_secs(total))
}
