//! Cache duration tokens such as `2w`, `500ms` or `1.5h`.
//!
//! The token appears as the `_<duration>` path segment of a proxy route and
//! overrides the `max-age` the gateway writes into `Cache-Control`.

use std::sync::LazyLock;

use regex::Regex;

use crate::{ProxyError, Result};

/// Age written into `Cache-Control` when the route carries no duration: two weeks.
pub const DEFAULT_MAX_AGE_SECONDS: u64 = 2 * 7 * 24 * 60 * 60;

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+|\d+\.\d+)(ms|s|m|h|d|w|y)$").expect("duration pattern is valid")
});

/// Seconds per unit suffix.
fn unit_seconds(unit: &str) -> Option<f64> {
    let seconds = match unit {
        "ms" => 1.0 / 1000.0,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 60.0 * 60.0,
        "d" => 24.0 * 60.0 * 60.0,
        "w" => 7.0 * 24.0 * 60.0 * 60.0,
        "y" => 365.0 * 24.0 * 60.0 * 60.0,
        _ => return None,
    };
    Some(seconds)
}

/// Converts a duration token into whole seconds, rounding down.
///
/// `Cache-Control` only accepts integral delta-seconds, so `1500ms` yields `1`.
pub fn parse_duration(token: &str) -> Result<u64> {
    let invalid = || ProxyError::InvalidDuration(token.to_owned());

    let caps = DURATION.captures(token).ok_or_else(invalid)?;
    let value: f64 = caps[1].parse().map_err(|_| invalid())?;
    let unit = unit_seconds(&caps[2]).ok_or_else(invalid)?;

    let seconds = value * unit;
    if !seconds.is_finite() {
        return Err(invalid());
    }
    Ok(seconds.floor() as u64)
}
