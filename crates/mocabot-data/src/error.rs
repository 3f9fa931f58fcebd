//! Error types for the data access layer.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Result alias for data layer operations.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors raised by the data access layer.
#[derive(Debug)]
pub enum DataError {
    /// A bot with the same name already has a row.
    Duplicate {
        /// Name that collided.
        name: String,
    },
    /// The backing store could not be reached.
    Unavailable {
        /// Operation identifier.
        operation: &'static str,
    },
    /// A file operation failed.
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// Stored rows could not be decoded.
    Corrupt {
        /// File holding the rows.
        path: PathBuf,
        /// Underlying decode error.
        source: serde_json::Error,
    },
    /// Rows could not be encoded.
    Encode {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying encode error.
        source: serde_json::Error,
    },
}

impl DataError {
    /// Whether the error reports an existing row rather than a failure.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

impl Display for DataError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { .. } => formatter.write_str("row already exists"),
            Self::Unavailable { .. } => formatter.write_str("database unavailable"),
            Self::Io { .. } => formatter.write_str("database io failure"),
            Self::Corrupt { .. } => formatter.write_str("stored rows could not be decoded"),
            Self::Encode { .. } => formatter.write_str("rows could not be encoded"),
        }
    }
}

impl Error for DataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Duplicate { .. } | Self::Unavailable { .. } => None,
            Self::Io { source, .. } => Some(source),
            Self::Corrupt { source, .. } | Self::Encode { source, .. } => Some(source),
        }
    }
}
