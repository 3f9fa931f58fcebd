//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters/gauges the runtime coordination layer reports.

use std::sync::Arc;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    store_reload_failures_total: IntCounterVec,
    flag_handler_failures_total: IntCounterVec,
    registry_rebuilds_total: IntCounter,
    registry_rebuild_failures_total: IntCounter,
    active_bots: IntGauge,
    rate_limit_throttled_total: IntCounter,
    blacklist_additions_total: IntCounter,
    scheduler_ticks_skipped_total: IntCounterVec,
    scheduler_task_failures_total: IntCounterVec,
    dialogue_requests_total: IntCounter,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Bots currently loaded in the registry.
    pub active_bots: i64,
    /// Completed registry rebuilds.
    pub registry_rebuilds_total: u64,
    /// Registry rebuilds that failed and kept the previous state.
    pub registry_rebuild_failures_total: u64,
    /// Requests rejected by the per-client throttle.
    pub rate_limit_throttled_total: u64,
    /// Addresses added to the blacklist by anomaly detection.
    pub blacklist_additions_total: u64,
    /// Dialogue requests accepted for processing.
    pub dialogue_requests_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be built or
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let store_reload_failures_total = counter_vec(
            "store_reload_failures_total",
            "Configuration store reloads that failed and kept the previous document",
            &["store"],
        )?;
        let flag_handler_failures_total = counter_vec(
            "flag_handler_failures_total",
            "Flag change handlers that returned an error or panicked",
            &["flag"],
        )?;
        let registry_rebuilds_total =
            counter("registry_rebuilds_total", "Completed bot registry rebuilds")?;
        let registry_rebuild_failures_total = counter(
            "registry_rebuild_failures_total",
            "Bot registry rebuilds that failed",
        )?;
        let active_bots = IntGauge::with_opts(Opts::new("active_bots", "Bots loaded in the registry"))
            .map_err(|source| TelemetryError::MetricsCollector {
                name: "active_bots",
                source,
            })?;
        let rate_limit_throttled_total = counter(
            "rate_limit_throttled_total",
            "Requests rejected due to client rate limiting",
        )?;
        let blacklist_additions_total = counter(
            "blacklist_additions_total",
            "Addresses blacklisted by anomaly detection",
        )?;
        let scheduler_ticks_skipped_total = counter_vec(
            "scheduler_ticks_skipped_total",
            "Periodic ticks skipped because the previous run was still in progress",
            &["task"],
        )?;
        let scheduler_task_failures_total = counter_vec(
            "scheduler_task_failures_total",
            "Periodic task runs that returned an error or panicked",
            &["task"],
        )?;
        let dialogue_requests_total =
            counter("dialogue_requests_total", "Dialogue requests accepted")?;

        register(&registry, "store_reload_failures_total", &store_reload_failures_total)?;
        register(&registry, "flag_handler_failures_total", &flag_handler_failures_total)?;
        register(&registry, "registry_rebuilds_total", &registry_rebuilds_total)?;
        register(
            &registry,
            "registry_rebuild_failures_total",
            &registry_rebuild_failures_total,
        )?;
        register(&registry, "active_bots", &active_bots)?;
        register(&registry, "rate_limit_throttled_total", &rate_limit_throttled_total)?;
        register(&registry, "blacklist_additions_total", &blacklist_additions_total)?;
        register(
            &registry,
            "scheduler_ticks_skipped_total",
            &scheduler_ticks_skipped_total,
        )?;
        register(
            &registry,
            "scheduler_task_failures_total",
            &scheduler_task_failures_total,
        )?;
        register(&registry, "dialogue_requests_total", &dialogue_requests_total)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                store_reload_failures_total,
                flag_handler_failures_total,
                registry_rebuilds_total,
                registry_rebuild_failures_total,
                active_bots,
                rate_limit_throttled_total,
                blacklist_additions_total,
                scheduler_ticks_skipped_total,
                scheduler_task_failures_total,
                dialogue_requests_total,
            }),
        })
    }

    /// Increment the reload failure counter for the named store.
    pub fn inc_store_reload_failure(&self, store: &str) {
        self.inner
            .store_reload_failures_total
            .with_label_values(&[store])
            .inc();
    }

    /// Add `count` handler failures for `flag`.
    pub fn add_flag_handler_failures(&self, flag: &str, count: u64) {
        if count > 0 {
            self.inner
                .flag_handler_failures_total
                .with_label_values(&[flag])
                .inc_by(count);
        }
    }

    /// Record a completed registry rebuild and the resulting bot count.
    pub fn record_registry_rebuild(&self, bots: usize) {
        self.inner.registry_rebuilds_total.inc();
        self.inner
            .active_bots
            .set(i64::try_from(bots).unwrap_or(i64::MAX));
    }

    /// Increment the failed registry rebuild counter.
    pub fn inc_registry_rebuild_failure(&self) {
        self.inner.registry_rebuild_failures_total.inc();
    }

    /// Set the active bot gauge.
    pub fn set_active_bots(&self, bots: usize) {
        self.inner
            .active_bots
            .set(i64::try_from(bots).unwrap_or(i64::MAX));
    }

    /// Increment the client throttle counter.
    pub fn inc_rate_limit_throttled(&self) {
        self.inner.rate_limit_throttled_total.inc();
    }

    /// Increment the anomaly blacklist counter.
    pub fn inc_blacklist_addition(&self) {
        self.inner.blacklist_additions_total.inc();
    }

    /// Increment the skipped tick counter for `task`.
    pub fn inc_scheduler_tick_skipped(&self, task: &str) {
        self.inner
            .scheduler_ticks_skipped_total
            .with_label_values(&[task])
            .inc();
    }

    /// Increment the failed run counter for `task`.
    pub fn inc_scheduler_task_failure(&self, task: &str) {
        self.inner
            .scheduler_task_failures_total
            .with_label_values(&[task])
            .inc();
    }

    /// Increment the accepted dialogue request counter.
    pub fn inc_dialogue_request(&self) {
        self.inner.dialogue_requests_total.inc();
    }

    /// Skipped tick count recorded for `task`.
    #[must_use]
    pub fn scheduler_ticks_skipped(&self, task: &str) -> u64 {
        self.inner
            .scheduler_ticks_skipped_total
            .with_label_values(&[task])
            .get()
    }

    /// Reload failure count recorded for `store`.
    #[must_use]
    pub fn store_reload_failures(&self, store: &str) -> u64 {
        self.inner
            .store_reload_failures_total
            .with_label_values(&[store])
            .get()
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_bots: self.inner.active_bots.get(),
            registry_rebuilds_total: self.inner.registry_rebuilds_total.get(),
            registry_rebuild_failures_total: self.inner.registry_rebuild_failures_total.get(),
            rate_limit_throttled_total: self.inner.rate_limit_throttled_total.get(),
            blacklist_additions_total: self.inner.blacklist_additions_total.get(),
            dialogue_requests_total: self.inner.dialogue_requests_total.get(),
        }
    }
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn counter_vec(name: &'static str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::MetricsCollector { name, source })
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}
