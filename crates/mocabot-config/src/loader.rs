//! Settings loader: `configs/server.json` first, then `MOCABOT_*` overrides.
//!
//! # Design
//! - A missing settings file is not an error; every field has a default.
//! - Environment lookups are injected so callers and tests control them.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use crate::defaults::{CONFIG_DIR, SERVER_FILE};
use crate::error::{ConfigError, ConfigResult};
use crate::model::{ServerSettings, SettingsDocument};
use crate::validate::{log_format, parse_u64, positive_interval, positive_limit};

const ENV_LOG_LEVEL: &str = "MOCABOT_LOG_LEVEL";
const ENV_LOG_FORMAT: &str = "MOCABOT_LOG_FORMAT";
const ENV_RELOAD_INTERVAL: &str = "MOCABOT_RELOAD_INTERVAL_SECS";
const ENV_ANOMALY_INTERVAL: &str = "MOCABOT_ANOMALY_INTERVAL_SECS";
const ENV_STORAGE_DIR: &str = "MOCABOT_STORAGE_DIR";

/// Load settings rooted at `root`, applying overrides from the process environment.
///
/// # Errors
///
/// Returns an error when `server.json` exists but cannot be read or parsed, or
/// when any resolved value fails validation.
pub fn load_settings(root: &Path) -> ConfigResult<ServerSettings> {
    load_settings_with(root, |name| std::env::var(name).ok())
}

/// Load settings rooted at `root`, resolving overrides through `env`.
///
/// # Errors
///
/// Returns an error when `server.json` exists but cannot be read or parsed, or
/// when any resolved value fails validation.
pub fn load_settings_with<F>(root: &Path, env: F) -> ConfigResult<ServerSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let path = root.join(CONFIG_DIR).join(SERVER_FILE);
    let document = match fs::read(&path) {
        Ok(bytes) => serde_json::from_slice::<SettingsDocument>(&bytes)
            .map_err(|err| ConfigError::malformed("settings.parse", &path, err))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "settings file absent; using defaults");
            SettingsDocument::default()
        }
        Err(err) => return Err(ConfigError::io("settings.read", &path, err)),
    };

    let mut settings = ServerSettings::rooted_at(root);
    apply_document(&mut settings, document)?;
    apply_env(&mut settings, &env)?;

    info!(
        root = %settings.root.display(),
        reload_secs = settings.reload_interval.as_secs(),
        anomaly_secs = settings.anomaly_interval.as_secs(),
        "server settings loaded"
    );
    Ok(settings)
}

/// Create the configuration, storage, log, and data directories when missing.
///
/// # Errors
///
/// Returns an error if any directory cannot be created.
pub fn ensure_layout(settings: &ServerSettings) -> ConfigResult<()> {
    for dir in [
        &settings.config_dir,
        &settings.storage_dir,
        &settings.log_dir,
        &settings.data_dir,
    ] {
        fs::create_dir_all(dir).map_err(|err| ConfigError::io("layout.create_dir", dir, err))?;
    }
    Ok(())
}

fn apply_document(settings: &mut ServerSettings, document: SettingsDocument) -> ConfigResult<()> {
    if let Some(dir) = document.storage_dir {
        settings.storage_dir = settings.resolve(&dir);
    }
    if let Some(dir) = document.log_dir {
        settings.log_dir = settings.resolve(&dir);
    }
    if let Some(dir) = document.data_dir {
        settings.data_dir = settings.resolve(&dir);
    }
    if let Some(secs) = document.reload_interval_secs {
        settings.reload_interval = positive_interval("reload_interval_secs", secs)?;
    }
    if let Some(secs) = document.anomaly_interval_secs {
        settings.anomaly_interval = positive_interval("anomaly_interval_secs", secs)?;
    }
    if let Some(threshold) = document.dos_threshold {
        settings.dos_threshold = threshold;
    }
    if let Some(limit) = document.dialogue_limit {
        settings.dialogue_limit.limit = positive_limit("dialogue_limit", limit)?;
    }
    if let Some(secs) = document.dialogue_window_secs {
        settings.dialogue_limit.window = positive_interval("dialogue_window_secs", secs)?;
    }
    if let Some(level) = document.log_level {
        settings.log_level = level;
    }
    if let Some(format) = document.log_format {
        settings.log_format = Some(log_format("log_format", &format)?);
    }
    Ok(())
}

fn apply_env<F>(settings: &mut ServerSettings, env: &F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = env(ENV_LOG_LEVEL).filter(|value| !value.trim().is_empty()) {
        settings.log_level = level;
    }
    if let Some(format) = env(ENV_LOG_FORMAT) {
        settings.log_format = Some(log_format(ENV_LOG_FORMAT, &format)?);
    }
    if let Some(raw) = env(ENV_RELOAD_INTERVAL) {
        settings.reload_interval =
            positive_interval(ENV_RELOAD_INTERVAL, parse_u64(ENV_RELOAD_INTERVAL, &raw)?)?;
    }
    if let Some(raw) = env(ENV_ANOMALY_INTERVAL) {
        settings.anomaly_interval =
            positive_interval(ENV_ANOMALY_INTERVAL, parse_u64(ENV_ANOMALY_INTERVAL, &raw)?)?;
    }
    if let Some(dir) = env(ENV_STORAGE_DIR) {
        settings.storage_dir = settings.resolve(Path::new(&dir));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = load_settings_with(dir.path(), no_env)?;
        assert_eq!(settings, ServerSettings::rooted_at(dir.path()));
        assert_eq!(settings.reload_interval, Duration::from_secs(1));
        assert_eq!(settings.anomaly_interval, Duration::from_secs(5));
        assert_eq!(settings.dos_threshold, 5_000);
        Ok(())
    }

    #[test]
    fn file_values_then_env_overrides_apply() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join(CONFIG_DIR))?;
        fs::write(
            dir.path().join(CONFIG_DIR).join(SERVER_FILE),
            r#"{"reload_interval_secs": 2, "dos_threshold": 10, "log_format": "json"}"#,
        )?;
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_ANOMALY_INTERVAL, "9"),
            (ENV_STORAGE_DIR, "bots"),
        ]);

        let settings =
            load_settings_with(dir.path(), |name| env.get(name).map(ToString::to_string))?;
        assert_eq!(settings.reload_interval, Duration::from_secs(2));
        assert_eq!(settings.anomaly_interval, Duration::from_secs(9));
        assert_eq!(settings.dos_threshold, 10);
        assert_eq!(settings.log_format.as_deref(), Some("json"));
        assert_eq!(settings.storage_dir, dir.path().join("bots"));
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join(CONFIG_DIR))?;
        let path = dir.path().join(CONFIG_DIR).join(SERVER_FILE);

        fs::write(&path, r#"{"reload_interval_secs": 0}"#)?;
        assert!(matches!(
            load_settings_with(dir.path(), no_env),
            Err(ConfigError::InvalidField {
                field: "reload_interval_secs",
                ..
            })
        ));

        fs::write(&path, "{ not json")?;
        assert!(matches!(
            load_settings_with(dir.path(), no_env),
            Err(ConfigError::Malformed { .. })
        ));
        Ok(())
    }

    #[test]
    fn ensure_layout_creates_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = ServerSettings::rooted_at(dir.path());
        ensure_layout(&settings)?;
        assert!(settings.config_dir.is_dir());
        assert!(settings.storage_dir.is_dir());
        assert!(settings.log_dir.is_dir());
        assert!(settings.data_dir.is_dir());
        Ok(())
    }
}
