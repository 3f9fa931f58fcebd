//! Validation helpers for settings fields.

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Convert a seconds value into a non-zero interval.
///
/// # Errors
///
/// Returns `ConfigError::InvalidField` when `secs` is zero.
pub fn positive_interval(field: &'static str, secs: u64) -> ConfigResult<Duration> {
    if secs == 0 {
        return Err(ConfigError::InvalidField {
            field,
            value: Some(secs.to_string()),
            reason: "must_be_positive",
        });
    }
    Ok(Duration::from_secs(secs))
}

/// Ensure a count limit is non-zero.
///
/// # Errors
///
/// Returns `ConfigError::InvalidField` when `value` is zero.
pub fn positive_limit(field: &'static str, value: u64) -> ConfigResult<u64> {
    if value == 0 {
        return Err(ConfigError::InvalidField {
            field,
            value: Some(value.to_string()),
            reason: "must_be_positive",
        });
    }
    Ok(value)
}

/// Parse an unsigned integer supplied through the environment.
///
/// # Errors
///
/// Returns `ConfigError::InvalidField` when `raw` is not a base-10 integer.
pub fn parse_u64(field: &'static str, raw: &str) -> ConfigResult<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidField {
            field,
            value: Some(raw.to_string()),
            reason: "not_an_integer",
        })
}

/// Accept only the log formats the telemetry layer understands.
///
/// # Errors
///
/// Returns `ConfigError::InvalidField` for anything other than `json` or `pretty`.
pub fn log_format(field: &'static str, raw: &str) -> ConfigResult<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "json" | "pretty" => Ok(normalized),
        _ => Err(ConfigError::InvalidField {
            field,
            value: Some(raw.to_string()),
            reason: "unknown_log_format",
        }),
    }
}
