//! Periodic reconciliation of the watched JSON documents, and the flag
//! handler that rebuilds the bot registry.

use std::sync::Arc;

use async_trait::async_trait;
use mocabot_config::{ConfigResult, Document, ListStore, MapStore, ReloadOutcome, WatchedStore};
use mocabot_events::{DispatchReport, FlagBus, FlagChange, FlagHandler, FlagReload};
use mocabot_telemetry::Metrics;
use tracing::{debug, info, warn};

use crate::registry::BotRegistry;
use crate::scheduler::PeriodicTask;

/// Store label used for the flag document in metrics and logs.
pub const FLAGS_STORE: &str = "flags";

/// Reloads every watched document once per tick.
pub struct StoreReloadTask {
    system: Arc<MapStore>,
    blacklist: Arc<ListStore>,
    api_keys: Arc<ListStore>,
    flags: Arc<FlagBus>,
    metrics: Metrics,
}

impl StoreReloadTask {
    /// Task over the runtime's stores.
    #[must_use]
    pub const fn new(
        system: Arc<MapStore>,
        blacklist: Arc<ListStore>,
        api_keys: Arc<ListStore>,
        flags: Arc<FlagBus>,
        metrics: Metrics,
    ) -> Self {
        Self {
            system,
            blacklist,
            api_keys,
            flags,
            metrics,
        }
    }

    async fn reload_store<D: Document>(
        &self,
        label: &'static str,
        store: &Arc<WatchedStore<D>>,
    ) {
        let outcome = Arc::clone(store).reload_blocking().await;
        self.observe(label, outcome);
    }

    fn observe<C>(&self, label: &'static str, outcome: ConfigResult<ReloadOutcome<C>>) {
        match outcome {
            Ok(ReloadOutcome::Applied(changes)) if !changes.is_empty() => {
                info!(store = label, changes = changes.len(), "store reloaded with changes");
            }
            Ok(ReloadOutcome::Applied(_)) => {}
            Ok(ReloadOutcome::Skipped) => {
                debug!(store = label, "store reload already in flight");
            }
            Err(err) => {
                self.metrics.inc_store_reload_failure(label);
                warn!(store = label, error = %err, "store reload failed; keeping previous values");
            }
        }
    }

    async fn reload_flags(&self) {
        match self.flags.reload().await {
            Ok(FlagReload::Applied { changes, report }) => {
                let names: Vec<&str> = changes.iter().map(|change| change.flag.as_str()).collect();
                if !names.is_empty() {
                    info!(flags = ?names, invoked = report.invoked, "flags reloaded with changes");
                }
                record_handler_failures(&self.metrics, &names, report);
            }
            Ok(FlagReload::Skipped) => {
                debug!(store = FLAGS_STORE, "flag reload already in flight");
            }
            Err(err) => {
                self.metrics.inc_store_reload_failure(FLAGS_STORE);
                warn!(
                    store = FLAGS_STORE,
                    error = %err,
                    "flag reload failed; keeping previous values"
                );
            }
        }
    }
}

#[async_trait]
impl PeriodicTask for StoreReloadTask {
    async fn run(&self) -> anyhow::Result<()> {
        self.reload_store("system", &self.system).await;
        self.reload_store("ip_blacklist", &self.blacklist).await;
        self.reload_store("api_keys", &self.api_keys).await;
        self.reload_flags().await;
        Ok(())
    }
}

/// Count handler failures against the flags whose changes were dispatched.
pub(crate) fn record_handler_failures(metrics: &Metrics, flags: &[&str], report: DispatchReport) {
    if report.failed == 0 {
        return;
    }
    let failed = u64::try_from(report.failed).unwrap_or(u64::MAX);
    metrics.add_flag_handler_failures(&flags.join(","), failed);
}

/// Flag handler that rebuilds the bot registry.
pub struct RebuildOnFlag {
    registry: Arc<BotRegistry>,
    metrics: Metrics,
}

impl RebuildOnFlag {
    /// Handler rebuilding `registry`.
    #[must_use]
    pub const fn new(registry: Arc<BotRegistry>, metrics: Metrics) -> Self {
        Self { registry, metrics }
    }
}

#[async_trait]
impl FlagHandler for RebuildOnFlag {
    async fn on_change(&self, change: &FlagChange) -> anyhow::Result<()> {
        debug!(flag = %change.flag, "rebuilding bot registry");
        match self.registry.rebuild().await {
            Ok(report) => {
                self.metrics.record_registry_rebuild(report.bots);
                Ok(())
            }
            Err(err) => {
                self.metrics.inc_registry_rebuild_failure();
                Err(anyhow::Error::new(err).context("bot registry rebuild failed"))
            }
        }
    }
}
