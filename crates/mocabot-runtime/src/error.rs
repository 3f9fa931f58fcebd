//! # Design
//!
//! - Centralize runtime errors for request-path and background operations.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Runtime-level error type.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A configuration store operation failed.
    #[error("configuration store operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: mocabot_config::ConfigError,
    },
    /// A flag bus operation failed.
    #[error("flag operation failed")]
    Flag {
        /// Operation identifier.
        operation: &'static str,
        /// Source flag error.
        source: mocabot_events::FlagError,
    },
    /// A database operation failed.
    #[error("database operation failed")]
    Data {
        /// Operation identifier.
        operation: &'static str,
        /// Source database error.
        source: mocabot_data::DataError,
    },
    /// A telemetry sink failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: mocabot_telemetry::TelemetryError,
    },
    /// Filesystem operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// The storage directory could not be enumerated.
    #[error("storage scan failed")]
    Storage {
        /// Directory being enumerated.
        path: PathBuf,
        /// Source traversal error.
        source: walkdir::Error,
    },
    /// A dialogue engine failed.
    #[error("dialogue engine failed")]
    Engine {
        /// Bot whose engine failed.
        bot: String,
        /// Source engine error.
        source: anyhow::Error,
    },
    /// A request argument was rejected.
    #[error("invalid input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Machine-readable reason for the failure.
        reason: &'static str,
        /// Optional value associated with the failure.
        value: Option<String>,
    },
    /// No bot is registered under the requested name.
    #[error("unknown bot")]
    UnknownBot {
        /// Requested bot name.
        name: String,
    },
    /// A bot with the requested name already exists.
    #[error("bot already exists")]
    BotExists {
        /// Requested bot name.
        name: String,
    },
    /// The caller is blacklisted.
    #[error("request forbidden")]
    Forbidden {
        /// Address that was refused.
        remote_addr: String,
    },
    /// The caller exceeded its request budget.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Rate gate key that tripped.
        key: String,
        /// Hits counted in the current window.
        count: u64,
        /// Hits allowed per window.
        limit: u64,
    },
    /// The server is in maintenance mode.
    #[error("server under maintenance")]
    Maintenance,
    /// A background task could not be joined.
    #[error("background task join failed")]
    TaskJoin {
        /// Operation identifier.
        operation: &'static str,
        /// Source join error.
        source: tokio::task::JoinError,
    },
}

impl RuntimeError {
    pub(crate) const fn config(
        operation: &'static str,
        source: mocabot_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn flag(operation: &'static str, source: mocabot_events::FlagError) -> Self {
        Self::Flag { operation, source }
    }

    pub(crate) const fn data(operation: &'static str, source: mocabot_data::DataError) -> Self {
        Self::Data { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: mocabot_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) fn engine(bot: &str, source: anyhow::Error) -> Self {
        Self::Engine {
            bot: bot.to_string(),
            source,
        }
    }

    pub(crate) fn invalid(field: &'static str, reason: &'static str, value: &str) -> Self {
        Self::InvalidInput {
            field,
            reason,
            value: Some(value.to_string()),
        }
    }

    /// Whether the error is a normal "not found" rather than a failure.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::UnknownBot { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn runtime_error_helpers_build_variants() {
        let config = RuntimeError::config(
            "system.open",
            mocabot_config::ConfigError::InvalidField {
                field: "dos_detect",
                value: None,
                reason: "must be positive",
            },
        );
        assert!(matches!(config, RuntimeError::Config { .. }));
        assert!(config.source().is_some());

        let data = RuntimeError::data(
            "bots.insert",
            mocabot_data::DataError::Unavailable {
                operation: "bots.insert",
            },
        );
        assert!(matches!(data, RuntimeError::Data { .. }));

        let engine = RuntimeError::engine("moca", anyhow::anyhow!("boom"));
        assert!(matches!(engine, RuntimeError::Engine { ref bot, .. } if bot == "moca"));

        let invalid = RuntimeError::invalid("message", "too_long", "xxx");
        assert_eq!(invalid.to_string(), "invalid input");
    }

    #[test]
    fn unknown_bot_reads_as_not_found() {
        let missing = RuntimeError::UnknownBot {
            name: "ghost".to_string(),
        };
        assert!(missing.is_not_found());
        assert!(!RuntimeError::Maintenance.is_not_found());
    }
}
