//! Keyed request counters with elastic expiry.
//!
//! # Design
//! - Every hit inside a window extends it, so a steady client never sees a reset.
//! - Tally gates never expire; they are drained by [`RateGate::snapshot_and_clear`].
//! - All state sits behind one mutex, so a drain cannot lose or double-count a hit.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::scheduler::PeriodicTask;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u64,
    window_start: Instant,
    expires_at: Option<Instant>,
}

impl RateWindow {
    fn open(now: Instant, window: Option<Duration>) -> Self {
        Self {
            count: 1,
            window_start: now,
            expires_at: expiry(now, window),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

fn expiry(now: Instant, window: Option<Duration>) -> Option<Instant> {
    window.and_then(|window| now.checked_add(window))
}

/// Keyed hit counter.
#[derive(Debug)]
pub struct RateGate {
    window: Option<Duration>,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateGate {
    /// Gate whose windows expire `window` after the most recent hit.
    #[must_use]
    pub fn elastic(window: Duration) -> Self {
        Self {
            window: Some(window),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Gate that counts until drained.
    #[must_use]
    pub fn tally() -> Self {
        Self {
            window: None,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Window length, or `None` for a tally gate.
    #[must_use]
    pub const fn window(&self) -> Option<Duration> {
        self.window
    }

    /// Record a hit for `key` now and return the count in its window.
    pub fn hit(&self, key: &str) -> u64 {
        self.hit_at(key, Instant::now())
    }

    /// Record a hit for `key` at `now` and return the count in its window.
    pub fn hit_at(&self, key: &str, now: Instant) -> u64 {
        let mut windows = self.lock();
        if let Some(window) = windows.get_mut(key) {
            if window.is_expired(now) {
                *window = RateWindow::open(now, self.window);
            } else {
                window.count = window.count.saturating_add(1);
                window.expires_at = expiry(now, self.window);
            }
            return window.count;
        }
        windows.insert(key.to_string(), RateWindow::open(now, self.window));
        1
    }

    /// Hits counted for `key` in its current window.
    #[must_use]
    pub fn count(&self, key: &str) -> u64 {
        self.count_at(key, Instant::now())
    }

    /// Hits counted for `key` as seen at `now`; an expired window reads as zero.
    #[must_use]
    pub fn count_at(&self, key: &str, now: Instant) -> u64 {
        self.lock()
            .get(key)
            .filter(|window| !window.is_expired(now))
            .map_or(0, |window| window.count)
    }

    /// Start of the current window for `key`, if one is open.
    #[must_use]
    pub fn window_start(&self, key: &str) -> Option<Instant> {
        self.lock().get(key).map(|window| window.window_start)
    }

    /// Forget `key`.
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Drain every counter in one critical section.
    pub fn snapshot_and_clear(&self) -> HashMap<String, u64> {
        let drained = mem::take(&mut *self.lock());
        drained
            .into_iter()
            .map(|(key, window)| (key, window.count))
            .collect()
    }

    /// Drop windows that expired at or before `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, window| !window.is_expired(now));
        before - windows.len()
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no key is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Periodic task that bounds a gate's memory by dropping expired windows.
#[derive(Debug, Clone)]
pub struct PurgeExpired {
    gate: Arc<RateGate>,
}

impl PurgeExpired {
    /// Task purging `gate`.
    #[must_use]
    pub const fn new(gate: Arc<RateGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl PeriodicTask for PurgeExpired {
    async fn run(&self) -> anyhow::Result<()> {
        let purged = self.gate.purge_expired(Instant::now());
        if purged > 0 {
            debug!(purged, remaining = self.gate.len(), "expired rate windows dropped");
        }
        Ok(())
    }
}
