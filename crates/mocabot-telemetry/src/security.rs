//! Append-only security log.
//!
//! Every entry is written to the log file as `<rfc3339> [LEVEL] message` and
//! mirrored as a tracing event on the `security` target.

use std::fmt::{self, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use tracing::{error, info, warn};

use crate::error::{Result, TelemetryError};

/// Severity of a security log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Informational entry.
    Info,
    /// Suspicious activity that was acted upon.
    Warning,
    /// Activity requiring operator attention.
    Critical,
}

impl SecurityLevel {
    /// Upper-case label written to the log file.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

impl Display for SecurityLevel {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Sink for security-relevant events.
pub trait SecurityLog: Send + Sync {
    /// Record `message` at `level`.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be persisted.
    fn write_event(&self, message: &str, level: SecurityLevel) -> Result<()>;
}

/// Security log backed by an append-mode file.
#[derive(Debug)]
pub struct FileSecurityLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSecurityLog {
    /// Open (or create) the log file at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the file cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| TelemetryError::SecurityLogOpen {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TelemetryError::SecurityLogOpen {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecurityLog for FileSecurityLog {
    fn write_event(&self, message: &str, level: SecurityLevel) -> Result<()> {
        match level {
            SecurityLevel::Info => info!(target: "security", %message, "security event"),
            SecurityLevel::Warning => warn!(target: "security", %message, "security event"),
            SecurityLevel::Critical => error!(target: "security", %message, "security event"),
        }

        let line = format!(
            "{} [{level}] {message}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| TelemetryError::SecurityLogWrite {
                path: self.path.clone(),
                source,
            })
    }
}
