//! Error types for configuration operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Field contained an invalid value.
    #[error("invalid configuration field")]
    InvalidField {
        /// Field that failed validation.
        field: &'static str,
        /// Offending value when available.
        value: Option<String>,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// A configuration document could not be parsed.
    #[error("malformed configuration document")]
    Malformed {
        /// Operation identifier.
        operation: &'static str,
        /// Path of the offending document.
        path: PathBuf,
        /// Source parse error.
        source: serde_json::Error,
    },
    /// A configuration document could not be serialized.
    #[error("failed to serialize configuration document")]
    Serialize {
        /// Operation identifier.
        operation: &'static str,
        /// Path of the target document.
        path: PathBuf,
        /// Source serialization error.
        source: serde_json::Error,
    },
    /// File system operation failed.
    #[error("filesystem operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
    /// A blocking store task could not be joined.
    #[error("blocking store task failed")]
    TaskJoin {
        /// Operation identifier.
        operation: &'static str,
        /// Source join error.
        source: tokio::task::JoinError,
    },
}

impl ConfigError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: serde_json::Error,
    ) -> Self {
        Self::Malformed {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether the error came from an unreadable or unparsable document rather
    /// than a validation failure.
    #[must_use]
    pub const fn is_document_error(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::Io { .. })
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn config_error_messages_are_constant() {
        let parse = serde_json::from_str::<serde_json::Value>("{")
            .err()
            .map(|source| ConfigError::malformed("store.reload", "system.json", source));
        let parse = parse.expect("invalid json should fail to parse");
        assert_eq!(parse.to_string(), "malformed configuration document");
        assert!(parse.source().is_some());
        assert!(parse.is_document_error());

        let invalid = ConfigError::InvalidField {
            field: "reload_interval_secs",
            value: Some("0".to_string()),
            reason: "must_be_positive",
        };
        assert_eq!(invalid.to_string(), "invalid configuration field");
        assert!(invalid.source().is_none());
        assert!(!invalid.is_document_error());
    }
}
