//! Flag bus error primitives.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use mocabot_config::ConfigError;

/// Error emitted when a flag operation cannot reach the backing store.
#[derive(Debug)]
pub enum FlagError {
    /// Persisting or reloading the flag document failed.
    Store {
        /// Operation identifier.
        operation: &'static str,
        /// Flag involved, when the failure concerns a single flag.
        flag: Option<String>,
        /// Underlying store error.
        source: ConfigError,
    },
}

impl FlagError {
    pub(crate) fn store(operation: &'static str, flag: Option<&str>, source: ConfigError) -> Self {
        Self::Store {
            operation,
            flag: flag.map(ToString::to_string),
            source,
        }
    }

    /// Flag associated with the failure, if any.
    #[must_use]
    pub fn flag(&self) -> Option<&str> {
        match self {
            Self::Store { flag, .. } => flag.as_deref(),
        }
    }
}

impl Display for FlagError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store { .. } => formatter.write_str("flag store operation failed"),
        }
    }
}

impl Error for FlagError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store { source, .. } => Some(source),
        }
    }
}

/// Result wrapper for flag bus operations.
pub type FlagResult<T> = Result<T, FlagError>;
