//! Default file names, keys, and intervals for the server layout.
//!
//! # Design
//! - Centralize names shared by the loader, the runtime, and the binary.
//! - Keep time-based defaults explicit so operators can audit them.

/// Directory holding JSON configuration documents.
pub const CONFIG_DIR: &str = "configs";
/// Directory holding one sub-directory per bot.
pub const STORAGE_DIR: &str = "storage";
/// Directory holding log files, including the security log.
pub const LOG_DIR: &str = "logs";
/// Directory holding the JSON database.
pub const DATA_DIR: &str = "data";

/// Bootstrap settings document.
pub const SERVER_FILE: &str = "server.json";
/// Live system configuration (maintenance mode, DoS threshold).
pub const SYSTEM_FILE: &str = "system.json";
/// Feature flag document.
pub const FLAGS_FILE: &str = "flags.json";
/// Deduplicated IP blacklist.
pub const BLACKLIST_FILE: &str = "ip_blacklist.json";
/// Accepted API keys.
pub const API_KEYS_FILE: &str = "api_key.json";
/// Security log file name under the log directory.
pub const SECURITY_LOG_FILE: &str = "secure.log";

/// System store key toggling maintenance mode.
pub const MAINTENANCE_MODE_KEY: &str = "maintenance_mode";
/// System store key holding the DoS detection threshold.
pub const DOS_DETECT_KEY: &str = "dos_detect";
/// Flag whose change triggers a bot registry rebuild.
pub const BOT_RELOAD_FLAG: &str = "bot_reload";

/// Seconds between store reload ticks.
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 1;
/// Seconds between anomaly sweeps.
pub const DEFAULT_ANOMALY_INTERVAL_SECS: u64 = 5;
/// Requests per anomaly window above which an IP is blacklisted.
pub const DEFAULT_DOS_THRESHOLD: u64 = 5_000;
/// Dialogue requests allowed per client within the throttle window.
pub const DEFAULT_DIALOGUE_LIMIT: u64 = 30;
/// Throttle window for dialogue requests, in seconds.
pub const DEFAULT_DIALOGUE_WINDOW_SECS: u64 = 60;
/// Default tracing filter directive.
pub const DEFAULT_LOG_LEVEL: &str = "info";
