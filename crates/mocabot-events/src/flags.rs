//! Flag storage plus ordered change handlers.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use mocabot_config::{MapStore, ReloadOutcome};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::{FlagError, FlagResult};

/// A flag whose value moved from `old` to `new`. Absent flags read as `Value::Null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagChange {
    /// Flag name.
    pub flag: String,
    /// Value before the change.
    pub old: Value,
    /// Value after the change.
    pub new: Value,
}

/// Reaction to a flag change. Implementors carry whatever context they need.
#[async_trait]
pub trait FlagHandler: Send + Sync {
    /// Handle one change. Errors are logged by the bus and do not stop other handlers.
    async fn on_change(&self, change: &FlagChange) -> anyhow::Result<()>;
}

/// Outcome of dispatching one or more changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

impl DispatchReport {
    fn absorb(&mut self, other: Self) {
        self.invoked += other.invoked;
        self.failed += other.failed;
    }
}

/// Result of [`FlagBus::reload`].
#[derive(Debug, Clone, PartialEq)]
pub enum FlagReload {
    /// A reload of the flag file was already running.
    Skipped,
    /// The file was reconciled and handlers ran for each change.
    Applied {
        /// Flags whose values changed.
        changes: Vec<FlagChange>,
        /// Combined dispatch outcome.
        report: DispatchReport,
    },
}

struct Registration {
    id: String,
    handler: Arc<dyn FlagHandler>,
}

/// Named flags with change handlers.
///
/// Dispatches are serialized: while handlers for one change run, other `set`,
/// `toggle`, and `reload` calls wait. `reload` reads the file under the same
/// lock, so handlers see changes in the order they were applied. Handlers
/// therefore must not set flags on the bus that is dispatching to them.
pub struct FlagBus {
    store: Arc<MapStore>,
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    dispatch: Mutex<()>,
}

impl FlagBus {
    /// Build a bus over the flag document.
    #[must_use]
    pub fn new(store: Arc<MapStore>) -> Self {
        Self {
            store,
            handlers: RwLock::new(HashMap::new()),
            dispatch: Mutex::new(()),
        }
    }

    /// Backing flag document.
    #[must_use]
    pub const fn store(&self) -> &Arc<MapStore> {
        &self.store
    }

    /// Current value of `flag`, `Value::Null` when unset.
    #[must_use]
    pub fn get(&self, flag: &str) -> Value {
        self.store.get(flag).unwrap_or(Value::Null)
    }

    /// Current value of `flag` as a boolean; anything but `true` reads as `false`.
    #[must_use]
    pub fn get_bool(&self, flag: &str) -> bool {
        self.store.get_as(flag, false)
    }

    /// Register `handler` for `flag` under `handler_id`.
    ///
    /// An id already registered on the same flag is replaced in place, keeping
    /// its position; an id registered on another flag moves to the end of
    /// `flag`'s handlers.
    pub fn add_handler(
        &self,
        handler_id: impl Into<String>,
        flag: impl Into<String>,
        handler: Arc<dyn FlagHandler>,
    ) {
        let handler_id = handler_id.into();
        let flag = flag.into();
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for (name, registrations) in handlers.iter_mut() {
            if name != &flag {
                registrations.retain(|registration| registration.id != handler_id);
            }
        }

        let registrations = handlers.entry(flag.clone()).or_default();
        if let Some(existing) = registrations
            .iter_mut()
            .find(|registration| registration.id == handler_id)
        {
            existing.handler = handler;
            debug!(flag = %flag, handler = %handler_id, "flag handler replaced");
        } else {
            registrations.push(Registration {
                id: handler_id.clone(),
                handler,
            });
            debug!(flag = %flag, handler = %handler_id, "flag handler registered");
        }
    }

    /// Unregister `handler_id` from every flag. Returns whether it was registered.
    pub fn remove_handler(&self, handler_id: &str) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for registrations in handlers.values_mut() {
            let before = registrations.len();
            registrations.retain(|registration| registration.id != handler_id);
            removed |= registrations.len() != before;
        }
        handlers.retain(|_, registrations| !registrations.is_empty());
        removed
    }

    /// Handler ids registered for `flag`, in dispatch order.
    #[must_use]
    pub fn handler_ids(&self, flag: &str) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(flag)
            .map(|registrations| {
                registrations
                    .iter()
                    .map(|registration| registration.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Persist `value` for `flag`; when it differs from the previous value, run
    /// the flag's handlers before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag document cannot be written. Handler failures
    /// are reported through [`DispatchReport::failed`], not as errors.
    pub async fn set(&self, flag: &str, value: Value) -> FlagResult<DispatchReport> {
        let _dispatching = self.dispatch.lock().await;
        self.set_locked(flag, value).await
    }

    /// Flip a boolean flag (unset or non-boolean reads as `false`) and return the new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag document cannot be written.
    pub async fn toggle(&self, flag: &str) -> FlagResult<bool> {
        let _dispatching = self.dispatch.lock().await;
        let next = !self.get_bool(flag);
        self.set_locked(flag, Value::Bool(next)).await?;
        Ok(next)
    }

    /// Reconcile the flag file and dispatch handlers for every changed flag.
    ///
    /// # Errors
    ///
    /// Returns an error when the flag file cannot be read or parsed; the previous
    /// values stay in effect and no handler runs.
    pub async fn reload(&self) -> FlagResult<FlagReload> {
        let _dispatching = self.dispatch.lock().await;
        let outcome = Arc::clone(&self.store)
            .reload_blocking()
            .await
            .map_err(|err| FlagError::store("flags.reload", None, err))?;

        let ReloadOutcome::Applied(changes) = outcome else {
            return Ok(FlagReload::Skipped);
        };

        let mut report = DispatchReport::default();
        let mut flag_changes = Vec::with_capacity(changes.len());
        for change in changes {
            let change = FlagChange {
                flag: change.key,
                old: change.old,
                new: change.new,
            };
            report.absorb(self.dispatch_change(&change).await);
            flag_changes.push(change);
        }

        Ok(FlagReload::Applied {
            changes: flag_changes,
            report,
        })
    }

    async fn set_locked(&self, flag: &str, value: Value) -> FlagResult<DispatchReport> {
        let previous = self
            .store
            .set(flag, value.clone())
            .map_err(|err| FlagError::store("flags.set", Some(flag), err))?;
        if previous == value {
            return Ok(DispatchReport::default());
        }

        let change = FlagChange {
            flag: flag.to_string(),
            old: previous,
            new: value,
        };
        Ok(self.dispatch_change(&change).await)
    }

    async fn dispatch_change(&self, change: &FlagChange) -> DispatchReport {
        let handlers: Vec<(String, Arc<dyn FlagHandler>)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&change.flag)
            .map(|registrations| {
                registrations
                    .iter()
                    .map(|registration| (registration.id.clone(), Arc::clone(&registration.handler)))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for (handler_id, handler) in handlers {
            report.invoked += 1;
            match AssertUnwindSafe(handler.on_change(change))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {
                    debug!(flag = %change.flag, handler = %handler_id, "flag handler completed");
                }
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        flag = %change.flag,
                        handler = %handler_id,
                        error = %err,
                        "flag handler failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    error!(flag = %change.flag, handler = %handler_id, "flag handler panicked");
                }
            }
        }
        report
    }
}
