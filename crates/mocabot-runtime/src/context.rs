//! The `Runtime` context object shared by request handlers and background tasks.
//!
//! # Design
//! - One explicit context replaces process-wide globals; handlers receive an `Arc<Runtime>`.
//! - Request handlers and timers touch shared state only through the containers held here.
//! - Startup failures (stores, initial rebuild) are fatal; later failures are reported.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use mocabot_config::defaults::{BOT_RELOAD_FLAG, MAINTENANCE_MODE_KEY};
use mocabot_config::{ListStore, MapStore, ServerSettings, StoreOptions};
use mocabot_data::{BotDatabase, ChatLogEntry, StudyEntry};
use mocabot_events::{DispatchReport, FlagBus};
use mocabot_telemetry::{Metrics, SecurityLevel, SecurityLog};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyDetector, AnomalySweep};
use crate::engine::{BotFactory, Reply};
use crate::error::{RuntimeError, RuntimeResult};
use crate::rate::{PurgeExpired, RateGate};
use crate::registry::{BotRecord, BotRegistry};
use crate::reload::{RebuildOnFlag, StoreReloadTask, record_handler_failures};
use crate::scheduler::Scheduler;

/// Longest accepted bot name, in characters.
pub const MAX_BOT_NAME_LEN: usize = 32;
/// Longest accepted dialogue or study message, in characters.
pub const MAX_MESSAGE_LEN: usize = 512;
/// Longest accepted client identifier, in characters.
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Scheduler name of the store reload task.
pub const STORE_RELOAD_TASK: &str = "store-reload";
/// Scheduler name of the anomaly sweep.
pub const DOS_DETECT_TASK: &str = "dos-detect";
/// Scheduler name of the throttle purge task.
pub const THROTTLE_PURGE_TASK: &str = "throttle-purge";

/// Collaborators required to build a [`Runtime`].
pub struct RuntimeDeps {
    /// Resolved server settings.
    pub settings: ServerSettings,
    /// Bot, chat log, and study persistence.
    pub database: Arc<dyn BotDatabase>,
    /// Opens a dialogue engine per bot directory.
    pub factory: Arc<dyn BotFactory>,
    /// Security event sink.
    pub security: Arc<dyn SecurityLog>,
    /// Shared metrics registry.
    pub metrics: Metrics,
}

/// One inbound dialogue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueRequest {
    /// Caller address, used for blacklisting and throttling.
    pub remote_addr: String,
    /// Target bot name.
    pub bot: String,
    /// Message to answer.
    pub message: String,
    /// Optional caller-supplied client identifier.
    pub client_id: Option<String>,
}

/// One study request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyRequest {
    /// Target bot name.
    pub bot: String,
    /// Messages to learn from, in conversation order.
    pub messages: Vec<String>,
}

/// Shared runtime state.
pub struct Runtime {
    settings: ServerSettings,
    system: Arc<MapStore>,
    blacklist: Arc<ListStore>,
    api_keys: Arc<ListStore>,
    flags: Arc<FlagBus>,
    registry: Arc<BotRegistry>,
    database: Arc<dyn BotDatabase>,
    factory: Arc<dyn BotFactory>,
    security: Arc<dyn SecurityLog>,
    metrics: Metrics,
    throttle: Arc<RateGate>,
    dos_tally: Arc<RateGate>,
}

impl Runtime {
    /// Open the stores, build the registry, and register the reload handler.
    ///
    /// # Errors
    ///
    /// Returns an error if any store cannot be opened, the initial registry
    /// rebuild fails, or the reload flag cannot be seeded.
    pub async fn initialize(deps: RuntimeDeps) -> RuntimeResult<Arc<Self>> {
        let RuntimeDeps {
            settings,
            database,
            factory,
            security,
            metrics,
        } = deps;

        let system = Arc::new(
            MapStore::open(settings.system_file(), StoreOptions::default())
                .map_err(|err| RuntimeError::config("system.open", err))?,
        );
        let blacklist = Arc::new(
            ListStore::open(settings.blacklist_file(), StoreOptions::deduplicated())
                .map_err(|err| RuntimeError::config("blacklist.open", err))?,
        );
        let api_keys = Arc::new(
            ListStore::open(settings.api_keys_file(), StoreOptions::default())
                .map_err(|err| RuntimeError::config("api_keys.open", err))?,
        );
        let flags = Arc::new(FlagBus::new(Arc::new(
            MapStore::open(settings.flags_file(), StoreOptions::default())
                .map_err(|err| RuntimeError::config("flags.open", err))?,
        )));

        let registry = Arc::new(BotRegistry::new(
            settings.storage_dir.clone(),
            Arc::clone(&database),
            Arc::clone(&factory),
        ));
        let report = registry.rebuild().await?;
        metrics.record_registry_rebuild(report.bots);

        flags
            .set(BOT_RELOAD_FLAG, Value::Bool(false))
            .await
            .map_err(|err| RuntimeError::flag("flags.seed", err))?;
        let handler_id = format!("{BOT_RELOAD_FLAG}:{}", std::process::id());
        flags.add_handler(
            handler_id.clone(),
            BOT_RELOAD_FLAG,
            Arc::new(RebuildOnFlag::new(Arc::clone(&registry), metrics.clone())),
        );

        let limit = settings.dialogue_limit;
        info!(
            bots = report.bots,
            handler = %handler_id,
            dialogue_limit = limit.limit,
            dialogue_window_ms = limit.window.as_millis(),
            "runtime initialized"
        );

        Ok(Arc::new(Self {
            settings,
            system,
            blacklist,
            api_keys,
            flags,
            registry,
            database,
            factory,
            security,
            metrics,
            throttle: Arc::new(RateGate::elastic(limit.window)),
            dos_tally: Arc::new(RateGate::tally()),
        }))
    }

    /// Start the store reload, anomaly sweep, and throttle purge tasks.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start_background(&self) -> Scheduler {
        let mut scheduler = Scheduler::with_metrics(self.metrics.clone());
        scheduler.add_periodic(
            STORE_RELOAD_TASK,
            self.settings.reload_interval,
            Arc::new(StoreReloadTask::new(
                Arc::clone(&self.system),
                Arc::clone(&self.blacklist),
                Arc::clone(&self.api_keys),
                Arc::clone(&self.flags),
                self.metrics.clone(),
            )),
        );
        scheduler.add_periodic(
            DOS_DETECT_TASK,
            self.settings.anomaly_interval,
            Arc::new(self.anomaly_detector()),
        );
        scheduler.add_periodic(
            THROTTLE_PURGE_TASK,
            self.settings.dialogue_limit.window,
            Arc::new(PurgeExpired::new(Arc::clone(&self.throttle))),
        );
        scheduler
    }

    /// Detector over this runtime's tally, blacklist, and system store.
    #[must_use]
    pub fn anomaly_detector(&self) -> AnomalyDetector {
        AnomalyDetector::new(
            Arc::clone(&self.dos_tally),
            Arc::clone(&self.blacklist),
            Arc::clone(&self.system),
            Arc::clone(&self.security),
            self.metrics.clone(),
            self.settings.dos_threshold,
        )
    }

    /// Run one anomaly sweep now, on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns an error when the blacklist cannot be persisted or the sweep
    /// task does not complete.
    pub async fn sweep_anomalies(&self) -> RuntimeResult<AnomalySweep> {
        let detector = self.anomaly_detector();
        tokio::task::spawn_blocking(move || detector.sweep())
            .await
            .map_err(|source| RuntimeError::TaskJoin {
                operation: "anomaly.sweep",
                source,
            })?
    }

    /// Resolved settings.
    #[must_use]
    pub const fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Bot registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<BotRegistry> {
        &self.registry
    }

    /// Flag bus.
    #[must_use]
    pub const fn flags(&self) -> &Arc<FlagBus> {
        &self.flags
    }

    /// Live system configuration store.
    #[must_use]
    pub const fn system(&self) -> &Arc<MapStore> {
        &self.system
    }

    /// Metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Tally fed by [`Runtime::record_request`] and drained by anomaly sweeps.
    #[must_use]
    pub const fn dos_tally(&self) -> &Arc<RateGate> {
        &self.dos_tally
    }

    /// Prometheus text exposition of the metrics registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded.
    pub fn render_metrics(&self) -> RuntimeResult<String> {
        self.metrics
            .render()
            .map_err(|err| RuntimeError::telemetry("metrics.render", err))
    }

    // Flags

    /// Current value of `flag`.
    #[must_use]
    pub fn get_flag(&self, flag: &str) -> Value {
        self.flags.get(flag)
    }

    /// Persist `value` for `flag`, running its handlers when it changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag document cannot be written.
    pub async fn set_flag(&self, flag: &str, value: Value) -> RuntimeResult<DispatchReport> {
        let report = self
            .flags
            .set(flag, value)
            .await
            .map_err(|err| RuntimeError::flag("flags.set", err))?;
        record_handler_failures(&self.metrics, &[flag], report);
        Ok(report)
    }

    /// Flip a boolean flag and return its new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag document cannot be written.
    pub async fn toggle_flag(&self, flag: &str) -> RuntimeResult<bool> {
        self.flags
            .toggle(flag)
            .await
            .map_err(|err| RuntimeError::flag("flags.toggle", err))
    }

    /// Toggle `bot_reload`, rebuilding the registry in this and every other
    /// process watching the flag file.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag document cannot be written.
    pub async fn request_bot_reload(&self) -> RuntimeResult<bool> {
        let value = self.toggle_flag(BOT_RELOAD_FLAG).await?;
        self.metrics.set_active_bots(self.registry.len());
        Ok(value)
    }

    // Live configuration

    /// Value of `key` in the system store, or `default` when absent or mistyped.
    #[must_use]
    pub fn config_get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.system.get_as(key, default)
    }

    /// Persist `value` under `key` in the system store and return the previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the system document cannot be written.
    pub fn set_config(&self, key: &str, value: Value) -> RuntimeResult<Value> {
        self.system
            .set(key, value)
            .map_err(|err| RuntimeError::config("system.set", err))
    }

    /// Whether maintenance mode is on.
    #[must_use]
    pub fn in_maintenance(&self) -> bool {
        self.config_get(MAINTENANCE_MODE_KEY, false)
    }

    /// Switch maintenance mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the system document cannot be written.
    pub fn set_maintenance(&self, enabled: bool) -> RuntimeResult<()> {
        self.set_config(MAINTENANCE_MODE_KEY, Value::Bool(enabled))?;
        let state = if enabled { "enabled" } else { "disabled" };
        self.audit(&format!("maintenance mode {state}"), SecurityLevel::Info);
        Ok(())
    }

    // Blacklist

    /// Whether `ip` is blacklisted.
    #[must_use]
    pub fn is_blacklisted(&self, ip: &str) -> bool {
        self.blacklist.contains(ip)
    }

    /// Blacklist `ip`. Returns `false` when it was already listed.
    ///
    /// # Errors
    ///
    /// Returns an error if the blacklist cannot be written.
    pub fn blacklist_ip(&self, ip: &str) -> RuntimeResult<bool> {
        let added = self
            .blacklist
            .append(ip)
            .map_err(|err| RuntimeError::config("blacklist.append", err))?;
        if added {
            self.audit(&format!("blacklisted {ip} by operator"), SecurityLevel::Info);
        }
        Ok(added)
    }

    /// Remove `ip` from the blacklist. Returns `false` when it was not listed.
    ///
    /// # Errors
    ///
    /// Returns an error if the blacklist cannot be written.
    pub fn unblacklist_ip(&self, ip: &str) -> RuntimeResult<bool> {
        let removed = self
            .blacklist
            .remove(ip)
            .map_err(|err| RuntimeError::config("blacklist.remove", err))?;
        if removed {
            self.audit(&format!("removed {ip} from blacklist"), SecurityLevel::Info);
        }
        Ok(removed)
    }

    /// Blacklisted addresses in insertion order.
    #[must_use]
    pub fn blacklist(&self) -> Vec<String> {
        self.blacklist.items()
    }

    // Rate limiting

    /// Record a hit on the client throttle for `key` and return its window count.
    pub fn rate_hit(&self, key: &str) -> u64 {
        self.throttle.hit(key)
    }

    /// Record a hit for `key` and fail once its window count exceeds `limit`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::RateLimited` when the count is above `limit`.
    pub fn check_rate_limit(&self, key: &str, limit: u64) -> RuntimeResult<u64> {
        let count = self.rate_hit(key);
        if count > limit {
            self.metrics.inc_rate_limit_throttled();
            debug!(key = %key, count, limit, "request throttled");
            return Err(RuntimeError::RateLimited {
                key: key.to_string(),
                count,
                limit,
            });
        }
        Ok(count)
    }

    /// Count one inbound request from `ip` toward anomaly detection.
    pub fn record_request(&self, ip: &str) -> u64 {
        self.dos_tally.hit(ip)
    }

    /// Whether `key` is an accepted API key.
    #[must_use]
    pub fn is_api_key_allowed(&self, key: &str) -> bool {
        !key.is_empty() && self.api_keys.contains(key)
    }

    // Bots

    /// Names of every loaded bot, sorted.
    #[must_use]
    pub fn bot_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Create a bot directory, row, and engine, then announce it through `bot_reload`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a malformed name, `BotExists` when the
    /// directory or row already exists, or the underlying failure otherwise.
    pub async fn create_bot(&self, name: &str) -> RuntimeResult<i64> {
        validate_bot_name(name)?;
        let storage_path = self.settings.bot_dir(name);
        if is_dir(&storage_path).await {
            return Err(RuntimeError::BotExists {
                name: name.to_string(),
            });
        }

        let id = match self.database.insert_bot(name).await {
            Ok(id) => id,
            Err(err) if err.is_duplicate() => {
                return Err(RuntimeError::BotExists {
                    name: name.to_string(),
                });
            }
            Err(err) => return Err(RuntimeError::data("bots.insert", err)),
        };

        fs::create_dir_all(&storage_path)
            .await
            .map_err(|source| RuntimeError::Io {
                operation: "bot.create_dir",
                path: storage_path.clone(),
                source,
            })?;
        let engine = self
            .factory
            .open(name, &storage_path)
            .await
            .map_err(|err| RuntimeError::engine(name, err))?;
        self.registry
            .insert(
                BotRecord {
                    name: name.to_string(),
                    storage_path,
                    engine,
                },
                id,
            )
            .await;
        self.audit(&format!("bot {name} created"), SecurityLevel::Info);
        self.request_bot_reload().await?;
        info!(bot = %name, id, "bot created");
        Ok(id)
    }

    /// Answer one dialogue request and log it.
    ///
    /// # Errors
    ///
    /// Returns `Maintenance`, `Forbidden`, `RateLimited`, `InvalidInput`, or
    /// `UnknownBot` when the request is refused, and the engine or database
    /// failure otherwise.
    pub async fn dialogue(&self, request: DialogueRequest) -> RuntimeResult<Reply> {
        if self.in_maintenance() {
            return Err(RuntimeError::Maintenance);
        }
        if self.is_blacklisted(&request.remote_addr) {
            return Err(RuntimeError::Forbidden {
                remote_addr: request.remote_addr,
            });
        }
        self.record_request(&request.remote_addr);
        self.check_rate_limit(
            &format!("dialogue:{}", request.remote_addr),
            self.settings.dialogue_limit.limit,
        )?;

        validate_bot_name(&request.bot)?;
        validate_message("message", &request.message)?;
        if let Some(client_id) = &request.client_id
            && client_id.chars().count() > MAX_CLIENT_ID_LEN
        {
            return Err(RuntimeError::InvalidInput {
                field: "client_id",
                reason: "too_long",
                value: None,
            });
        }

        let (record, bot_id) = self.resolve(&request.bot)?;
        let reply = record
            .engine
            .dialogue(&request.message, false)
            .await
            .map_err(|err| RuntimeError::engine(&request.bot, err))?;

        self.database
            .record_chat(ChatLogEntry {
                remote_addr: request.remote_addr,
                bot_id,
                message: request.message,
                reply_kind: reply.kind.clone(),
                reply: reply.content.clone(),
                client_id: request.client_id,
                created_at: Utc::now(),
            })
            .await
            .map_err(|err| RuntimeError::data("chat_logs.insert", err))?;
        self.metrics.inc_dialogue_request();
        Ok(reply)
    }

    /// Feed messages to a bot in study mode, save it, and record what it learned.
    ///
    /// Messages that are empty or longer than the message limit are skipped.
    /// Returns the number of messages studied.
    ///
    /// # Errors
    ///
    /// Returns `Maintenance`, `InvalidInput`, or `UnknownBot` when the request
    /// is refused, and the engine or database failure otherwise.
    pub async fn study(&self, request: StudyRequest) -> RuntimeResult<usize> {
        if self.in_maintenance() {
            return Err(RuntimeError::Maintenance);
        }
        validate_bot_name(&request.bot)?;
        if request.messages.is_empty() {
            return Err(RuntimeError::InvalidInput {
                field: "messages",
                reason: "empty",
                value: None,
            });
        }

        let (record, bot_id) = self.resolve(&request.bot)?;
        let accepted: Vec<String> = request
            .messages
            .into_iter()
            .filter(|message| validate_message("message", message).is_ok())
            .collect();

        for message in &accepted {
            record
                .engine
                .dialogue(message, true)
                .await
                .map_err(|err| RuntimeError::engine(&request.bot, err))?;
        }
        record
            .engine
            .save()
            .await
            .map_err(|err| RuntimeError::engine(&request.bot, err))?;

        for message in &accepted {
            self.database
                .record_study(StudyEntry {
                    bot_id,
                    message: message.clone(),
                    created_at: Utc::now(),
                })
                .await
                .map_err(|err| RuntimeError::data("study.insert", err))?;
        }
        self.request_bot_reload().await?;
        debug!(bot = %request.bot, studied = accepted.len(), "study request applied");
        Ok(accepted.len())
    }

    /// Chat log rows for the bot called `name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownBot` when no id is cached for `name`, or the database failure.
    pub async fn chat_logs(&self, name: &str) -> RuntimeResult<Vec<ChatLogEntry>> {
        let bot_id = self.bot_id(name)?;
        self.database
            .chat_logs(bot_id)
            .await
            .map_err(|err| RuntimeError::data("chat_logs.fetch", err))
    }

    /// Studied messages for the bot called `name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownBot` when no id is cached for `name`, or the database failure.
    pub async fn bot_dictionary(&self, name: &str) -> RuntimeResult<Vec<StudyEntry>> {
        let bot_id = self.bot_id(name)?;
        self.database
            .study_entries(bot_id)
            .await
            .map_err(|err| RuntimeError::data("study.fetch", err))
    }

    fn bot_id(&self, name: &str) -> RuntimeResult<i64> {
        self.registry
            .lookup_id(name)
            .ok_or_else(|| RuntimeError::UnknownBot {
                name: name.to_string(),
            })
    }

    fn resolve(&self, name: &str) -> RuntimeResult<(BotRecord, i64)> {
        let snapshot = self.registry.snapshot();
        let unknown = || RuntimeError::UnknownBot {
            name: name.to_string(),
        };
        let record = snapshot.get(name).cloned().ok_or_else(unknown)?;
        let bot_id = snapshot.ids().id(name).ok_or_else(unknown)?;
        Ok((record, bot_id))
    }

    fn audit(&self, message: &str, level: SecurityLevel) {
        if let Err(err) = self.security.write_event(message, level) {
            warn!(error = %err, "failed to write security log entry");
        }
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_dir())
}

/// Check a bot name: 1 to 32 ASCII letters, digits, `_`, or `-`.
///
/// # Errors
///
/// Returns `RuntimeError::InvalidInput` naming the failed rule.
pub fn validate_bot_name(name: &str) -> RuntimeResult<()> {
    if name.is_empty() {
        return Err(RuntimeError::invalid("name", "empty", name));
    }
    if name.chars().count() > MAX_BOT_NAME_LEN {
        return Err(RuntimeError::invalid("name", "too_long", name));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(RuntimeError::invalid("name", "invalid_characters", name));
    }
    Ok(())
}

fn validate_message(field: &'static str, message: &str) -> RuntimeResult<()> {
    let reason = if message.trim().is_empty() {
        "empty"
    } else if message.chars().count() > MAX_MESSAGE_LEN {
        "too_long"
    } else {
        return Ok(());
    };
    Err(RuntimeError::InvalidInput {
        field,
        reason,
        value: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_names_follow_the_allowed_alphabet() {
        assert!(validate_bot_name("moca_bot-2").is_ok());
        assert!(validate_bot_name(&"a".repeat(MAX_BOT_NAME_LEN)).is_ok());

        for (name, reason) in [
            ("", "empty"),
            ("has space", "invalid_characters"),
            ("../escape", "invalid_characters"),
            ("モカ", "invalid_characters"),
        ] {
            let err = validate_bot_name(name).err();
            assert!(
                matches!(err, Some(RuntimeError::InvalidInput { reason: got, .. }) if got == reason),
                "{name:?} should fail with {reason}"
            );
        }
        let long = "a".repeat(MAX_BOT_NAME_LEN + 1);
        assert!(matches!(
            validate_bot_name(&long),
            Err(RuntimeError::InvalidInput {
                reason: "too_long",
                ..
            })
        ));
    }

    #[test]
    fn messages_must_be_non_blank_and_bounded() {
        assert!(validate_message("message", "hello").is_ok());
        assert!(validate_message("message", &"x".repeat(MAX_MESSAGE_LEN)).is_ok());
        assert!(validate_message("message", "   ").is_err());
        assert!(validate_message("message", &"x".repeat(MAX_MESSAGE_LEN + 1)).is_err());
    }
}
