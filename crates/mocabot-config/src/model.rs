//! Typed bootstrap settings for the server process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{
    API_KEYS_FILE, BLACKLIST_FILE, CONFIG_DIR, DATA_DIR, DEFAULT_ANOMALY_INTERVAL_SECS,
    DEFAULT_DIALOGUE_LIMIT, DEFAULT_DIALOGUE_WINDOW_SECS, DEFAULT_DOS_THRESHOLD,
    DEFAULT_LOG_LEVEL, DEFAULT_RELOAD_INTERVAL_SECS, FLAGS_FILE, LOG_DIR, SECURITY_LOG_FILE,
    STORAGE_DIR, SYSTEM_FILE,
};

/// Per-client throttle applied to dialogue requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialogueLimit {
    /// Hits allowed inside one elastic window.
    pub limit: u64,
    /// Elastic window length.
    pub window: Duration,
}

/// Resolved settings used to wire the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Root directory all relative paths are resolved against.
    pub root: PathBuf,
    /// Directory holding JSON configuration documents.
    pub config_dir: PathBuf,
    /// Directory holding one sub-directory per bot.
    pub storage_dir: PathBuf,
    /// Directory holding log files.
    pub log_dir: PathBuf,
    /// Directory holding the JSON database.
    pub data_dir: PathBuf,
    /// Interval between store reload ticks.
    pub reload_interval: Duration,
    /// Interval between anomaly sweeps.
    pub anomaly_interval: Duration,
    /// Threshold used when the system store has no `dos_detect` value.
    pub dos_threshold: u64,
    /// Throttle applied to dialogue requests per client address.
    pub dialogue_limit: DialogueLimit,
    /// Tracing filter directive.
    pub log_level: String,
    /// Requested log format (`json` or `pretty`); inferred when absent.
    pub log_format: Option<String>,
}

impl ServerSettings {
    /// Default settings rooted at `root`.
    #[must_use]
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_dir: root.join(CONFIG_DIR),
            storage_dir: root.join(STORAGE_DIR),
            log_dir: root.join(LOG_DIR),
            data_dir: root.join(DATA_DIR),
            root,
            reload_interval: Duration::from_secs(DEFAULT_RELOAD_INTERVAL_SECS),
            anomaly_interval: Duration::from_secs(DEFAULT_ANOMALY_INTERVAL_SECS),
            dos_threshold: DEFAULT_DOS_THRESHOLD,
            dialogue_limit: DialogueLimit {
                limit: DEFAULT_DIALOGUE_LIMIT,
                window: Duration::from_secs(DEFAULT_DIALOGUE_WINDOW_SECS),
            },
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: None,
        }
    }

    /// Path of the live system configuration document.
    #[must_use]
    pub fn system_file(&self) -> PathBuf {
        self.config_dir.join(SYSTEM_FILE)
    }

    /// Path of the flag document.
    #[must_use]
    pub fn flags_file(&self) -> PathBuf {
        self.config_dir.join(FLAGS_FILE)
    }

    /// Path of the IP blacklist document.
    #[must_use]
    pub fn blacklist_file(&self) -> PathBuf {
        self.config_dir.join(BLACKLIST_FILE)
    }

    /// Path of the API key document.
    #[must_use]
    pub fn api_keys_file(&self) -> PathBuf {
        self.config_dir.join(API_KEYS_FILE)
    }

    /// Path of the append-only security log.
    #[must_use]
    pub fn security_log_file(&self) -> PathBuf {
        self.log_dir.join(SECURITY_LOG_FILE)
    }

    /// Directory owned by the bot called `name`.
    #[must_use]
    pub fn bot_dir(&self, name: &str) -> PathBuf {
        self.storage_dir.join(name)
    }

    /// Resolve `path` against the settings root unless it is absolute.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// On-disk shape of `server.json`; every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SettingsDocument {
    pub(crate) storage_dir: Option<PathBuf>,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) data_dir: Option<PathBuf>,
    pub(crate) reload_interval_secs: Option<u64>,
    pub(crate) anomaly_interval_secs: Option<u64>,
    pub(crate) dos_threshold: Option<u64>,
    pub(crate) dialogue_limit: Option<u64>,
    pub(crate) dialogue_window_secs: Option<u64>,
    pub(crate) log_level: Option<String>,
    pub(crate) log_format: Option<String>,
}
