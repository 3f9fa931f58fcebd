//! Traffic anomaly sweep that blacklists flooding addresses.

use std::sync::Arc;

use async_trait::async_trait;
use mocabot_config::defaults::DOS_DETECT_KEY;
use mocabot_config::{ListStore, MapStore};
use mocabot_telemetry::{Metrics, SecurityLevel, SecurityLog};
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::rate::RateGate;
use crate::scheduler::PeriodicTask;

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnomalySweep {
    /// Addresses present in the drained tally.
    pub inspected: usize,
    /// Addresses newly added to the blacklist, sorted.
    pub blacklisted: Vec<String>,
}

/// Drains the request tally and blacklists addresses above the live threshold.
#[derive(Clone)]
pub struct AnomalyDetector {
    tally: Arc<RateGate>,
    blacklist: Arc<ListStore>,
    system: Arc<MapStore>,
    security: Arc<dyn SecurityLog>,
    metrics: Metrics,
    default_threshold: u64,
}

impl AnomalyDetector {
    /// Detector over `tally`, reading its threshold from `system` under `dos_detect`.
    #[must_use]
    pub fn new(
        tally: Arc<RateGate>,
        blacklist: Arc<ListStore>,
        system: Arc<MapStore>,
        security: Arc<dyn SecurityLog>,
        metrics: Metrics,
        default_threshold: u64,
    ) -> Self {
        Self {
            tally,
            blacklist,
            system,
            security,
            metrics,
            default_threshold,
        }
    }

    /// Threshold in effect right now.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.system.get_as(DOS_DETECT_KEY, self.default_threshold)
    }

    /// Drain the tally and blacklist every address whose count exceeds the threshold.
    ///
    /// # Errors
    ///
    /// Returns an error when the blacklist cannot be persisted. The tally has
    /// already been drained at that point; addresses added before the failure
    /// stay blacklisted.
    pub fn sweep(&self) -> RuntimeResult<AnomalySweep> {
        let counts = self.tally.snapshot_and_clear();
        let threshold = self.threshold();
        let mut offenders: Vec<(String, u64)> = counts
            .iter()
            .filter(|(_, count)| **count > threshold)
            .map(|(ip, count)| (ip.clone(), *count))
            .collect();
        offenders.sort();

        let mut sweep = AnomalySweep {
            inspected: counts.len(),
            blacklisted: Vec::new(),
        };
        for (ip, count) in offenders {
            let added = self
                .blacklist
                .append(&ip)
                .map_err(|err| RuntimeError::config("blacklist.append", err))?;
            if !added {
                continue;
            }
            self.metrics.inc_blacklist_addition();
            let message = format!(
                "blacklisted {ip}: {count} requests in one sweep (threshold {threshold})"
            );
            if let Err(err) = self.security.write_event(&message, SecurityLevel::Warning) {
                warn!(ip = %ip, error = %err, "failed to write security log entry");
            }
            sweep.blacklisted.push(ip);
        }

        debug!(
            inspected = sweep.inspected,
            blacklisted = sweep.blacklisted.len(),
            threshold,
            "anomaly sweep finished"
        );
        Ok(sweep)
    }
}

#[async_trait]
impl PeriodicTask for AnomalyDetector {
    async fn run(&self) -> anyhow::Result<()> {
        let detector = self.clone();
        tokio::task::spawn_blocking(move || detector.sweep()).await??;
        Ok(())
    }
}
