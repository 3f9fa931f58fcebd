//! File-backed JSON stores with synchronous persistence and manual reload.
//!
//! # Design
//! - Readers load an `Arc` snapshot through `ArcSwap`; they never block and never
//!   observe a half-applied reload.
//! - Every mutation and every reload runs under one writer lock, so a reload can
//!   not overwrite a value that `set` has just persisted.
//! - Memory changes only after the document reached disk (temp file + rename).
//! - A reload that finds the file unreadable or malformed keeps the last good
//!   document and reports the error to the caller.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::document::{Document, JsonMap};
use crate::error::{ConfigError, ConfigResult};

/// Behaviour switches applied when a document is normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Drop repeated entries from list documents, keeping the first occurrence.
    pub deduplicate: bool,
}

impl StoreOptions {
    /// Options for a list whose entries are unique.
    #[must_use]
    pub const fn deduplicated() -> Self {
        Self { deduplicate: true }
    }
}

/// Result of a [`WatchedStore::reload`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome<C> {
    /// The file was reconciled; the vector lists what changed (possibly nothing).
    Applied(Vec<C>),
    /// Another reload of the same store was in flight, so this one did nothing.
    Skipped,
}

impl<C> ReloadOutcome<C> {
    /// Changes applied by the reload; empty when skipped.
    #[must_use]
    pub fn changes(&self) -> &[C] {
        match self {
            Self::Applied(changes) => changes,
            Self::Skipped => &[],
        }
    }

    /// Whether the reload was skipped because another was running.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// A JSON document mirrored from a file.
#[derive(Debug)]
pub struct WatchedStore<D: Document> {
    path: PathBuf,
    options: StoreOptions,
    current: ArcSwap<D>,
    write_lock: Mutex<()>,
    reload_lock: Mutex<()>,
}

/// Key/value store (`system.json`, `flags.json`).
pub type MapStore = WatchedStore<JsonMap>;
/// Ordered list store (`ip_blacklist.json`, `api_key.json`).
pub type ListStore = WatchedStore<Vec<String>>;

impl<D: Document> WatchedStore<D> {
    /// Open the store at `path`, creating it with an empty document when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed, or
    /// when the initial empty document cannot be written.
    pub fn open(path: impl Into<PathBuf>, options: StoreOptions) -> ConfigResult<Self> {
        let path = path.into();
        let document = match fs::read(&path) {
            Ok(bytes) => parse_document::<D>("store.open", &path, &bytes, &options)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let document = D::default();
                write_document(&path, &document)?;
                info!(path = %path.display(), "created empty configuration document");
                document
            }
            Err(err) => return Err(ConfigError::io("store.open", &path, err)),
        };

        Ok(Self {
            path,
            options,
            current: ArcSwap::from_pointee(document),
            write_lock: Mutex::new(()),
            reload_lock: Mutex::new(()),
        })
    }

    /// File backing this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document; cheap and lock-free.
    #[must_use]
    pub fn snapshot(&self) -> Arc<D> {
        self.current.load_full()
    }

    /// Apply `mutate` to a copy of the document, persist it, then publish it.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written; memory is left unchanged.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut D) -> R) -> ConfigResult<R> {
        let _writer = lock(&self.write_lock);
        let mut next = D::clone(&self.current.load());
        let result = mutate(&mut next);
        self.publish(next)?;
        Ok(result)
    }

    /// Re-read the file and reconcile memory with it.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed; the previous
    /// document stays in place.
    pub fn reload(&self) -> ConfigResult<ReloadOutcome<D::Change>> {
        let _reloading = match self.reload_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(path = %self.path.display(), "reload already in flight; skipping");
                return Ok(ReloadOutcome::Skipped);
            }
        };

        let _writer = lock(&self.write_lock);
        let bytes =
            fs::read(&self.path).map_err(|err| ConfigError::io("store.reload", &self.path, err))?;
        let next = parse_document::<D>("store.reload", &self.path, &bytes, &self.options)?;
        let previous = self.current.load_full();
        let changes = D::diff(&previous, &next);
        self.current.store(Arc::new(next));
        if !changes.is_empty() {
            debug!(
                path = %self.path.display(),
                changes = changes.len(),
                "configuration document reloaded"
            );
        }
        Ok(ReloadOutcome::Applied(changes))
    }

    /// Run [`Self::reload`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns the reload error, or `ConfigError::TaskJoin` if the blocking task
    /// panicked or was cancelled.
    pub async fn reload_blocking(self: Arc<Self>) -> ConfigResult<ReloadOutcome<D::Change>> {
        tokio::task::spawn_blocking(move || self.reload())
            .await
            .map_err(|source| ConfigError::TaskJoin {
                operation: "store.reload_blocking",
                source,
            })?
    }

    /// Persist and publish the mutated copy only when `mutate` reports a change.
    fn modify(&self, mutate: impl FnOnce(&mut D) -> bool) -> ConfigResult<bool> {
        let _writer = lock(&self.write_lock);
        let mut next = D::clone(&self.current.load());
        if !mutate(&mut next) {
            return Ok(false);
        }
        self.publish(next)?;
        Ok(true)
    }

    /// Callers hold the writer lock.
    fn publish(&self, mut next: D) -> ConfigResult<()> {
        next.normalize(&self.options);
        write_document(&self.path, &next)?;
        self.current.store(Arc::new(next));
        Ok(())
    }
}

impl WatchedStore<JsonMap> {
    /// Raw value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.current.load().get(key).cloned()
    }

    /// Value under `key` converted to `T`, or `default` when absent or of another shape.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(default)
    }

    /// Store `value` under `key` and persist, returning the previous value
    /// (`Value::Null` when the key was absent).
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn set(&self, key: &str, value: Value) -> ConfigResult<Value> {
        let mut previous = Value::Null;
        self.modify(|document| {
            previous = document
                .insert(key.to_string(), value)
                .unwrap_or(Value::Null);
            true
        })?;
        Ok(previous)
    }

    /// Remove `key` and persist, returning the removed value if there was one.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn remove(&self, key: &str) -> ConfigResult<Option<Value>> {
        let mut removed = None;
        self.modify(|document| {
            removed = document.remove(key);
            removed.is_some()
        })?;
        Ok(removed)
    }
}

impl WatchedStore<Vec<String>> {
    /// Whether `item` is present.
    #[must_use]
    pub fn contains(&self, item: &str) -> bool {
        self.current.load().iter().any(|entry| entry == item)
    }

    /// Copy of every entry, in file order.
    #[must_use]
    pub fn items(&self) -> Vec<String> {
        Vec::clone(&self.current.load())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Append `item` and persist. Returns `false` without touching the file when
    /// the store deduplicates and `item` is already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn append(&self, item: &str) -> ConfigResult<bool> {
        let deduplicate = self.options.deduplicate;
        self.modify(|document| {
            if deduplicate && document.iter().any(|entry| entry == item) {
                return false;
            }
            document.push(item.to_string());
            true
        })
    }

    /// Remove every occurrence of `item` and persist. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub fn remove(&self, item: &str) -> ConfigResult<bool> {
        self.modify(|document| {
            let before = document.len();
            document.retain(|entry| entry != item);
            document.len() != before
        })
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_document<D: Document>(
    operation: &'static str,
    path: &Path,
    bytes: &[u8],
    options: &StoreOptions,
) -> ConfigResult<D> {
    let mut document: D =
        serde_json::from_slice(bytes).map_err(|err| ConfigError::malformed(operation, path, err))?;
    document.normalize(options);
    Ok(document)
}

fn write_document<D: Document>(path: &Path, document: &D) -> ConfigResult<()> {
    let mut bytes = serde_json::to_vec_pretty(document).map_err(|source| ConfigError::Serialize {
        operation: "store.persist",
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| ConfigError::io("store.create_dir", parent, err))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).map_err(|err| ConfigError::io("store.write_tmp", &tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| ConfigError::io("store.rename", path, err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_creates_missing_file_with_empty_document() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("configs").join("flags.json");
        let store = MapStore::open(&path, StoreOptions::default())?;
        assert!(path.is_file());
        assert!(store.snapshot().is_empty());
        assert_eq!(fs::read_to_string(&path)?.trim(), "{}");
        Ok(())
    }

    #[test]
    fn open_rejects_malformed_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("system.json");
        fs::write(&path, "{ broken")?;
        let result = MapStore::open(&path, StoreOptions::default());
        assert!(matches!(result, Err(ConfigError::Malformed { .. })));
        Ok(())
    }

    #[test]
    fn set_persists_before_publishing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("system.json");
        let store = MapStore::open(&path, StoreOptions::default())?;

        let previous = store.set("maintenance_mode", json!(true))?;
        assert_eq!(previous, Value::Null);
        assert!(store.get_as("maintenance_mode", false));

        let on_disk: Value = serde_json::from_slice(&fs::read(&path)?)?;
        assert_eq!(on_disk, json!({"maintenance_mode": true}));
        assert!(!dir.path().join("system.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn failed_persist_leaves_memory_untouched() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("system.json");
        let store = MapStore::open(&path, StoreOptions::default())?;
        store.set("dos_detect", json!(10))?;

        // A directory squatting on the temp path makes the write fail.
        fs::create_dir(dir.path().join("system.json.tmp"))?;
        let result = store.set("dos_detect", json!(99));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
        assert_eq!(store.get_as("dos_detect", 0_u64), 10);
        Ok(())
    }

    #[test]
    fn get_as_falls_back_on_wrong_shape() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = MapStore::open(dir.path().join("system.json"), StoreOptions::default())?;
        store.set("dos_detect", json!("lots"))?;
        assert_eq!(store.get_as("dos_detect", 5_000_u64), 5_000);
        assert_eq!(store.get_as("absent", 7_u64), 7);
        Ok(())
    }

    #[test]
    fn reload_reports_changes_and_keeps_state_on_malformed_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("flags.json");
        fs::write(&path, r#"{"a": 1}"#)?;
        let store = MapStore::open(&path, StoreOptions::default())?;

        fs::write(&path, r#"{"a": 2, "b": true}"#)?;
        let outcome = store.reload()?;
        let keys: Vec<&str> = outcome
            .changes()
            .iter()
            .map(|change| change.key.as_str())
            .collect();
        assert_eq!(keys, vec!["a", "b"]);

        fs::write(&path, r#"{"a": "#)?;
        assert!(store.reload().is_err());
        assert_eq!(store.get("a"), Some(json!(2)));
        assert_eq!(store.get("b"), Some(json!(true)));

        fs::remove_file(&path)?;
        assert!(matches!(store.reload(), Err(ConfigError::Io { .. })));
        assert_eq!(store.get("a"), Some(json!(2)));
        Ok(())
    }

    #[test]
    fn concurrent_reload_is_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = MapStore::open(dir.path().join("flags.json"), StoreOptions::default())?;
        let _held = store.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(store.reload()?.is_skipped());
        Ok(())
    }

    #[test]
    fn list_store_deduplicates_appends() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ip_blacklist.json");
        fs::write(&path, r#"["10.0.0.1", "10.0.0.1", "10.0.0.2"]"#)?;
        let store = ListStore::open(&path, StoreOptions::deduplicated())?;
        assert_eq!(store.len(), 2);

        assert!(!store.append("10.0.0.1")?);
        assert_eq!(store.len(), 2);
        assert!(store.append("10.0.0.3")?);
        assert!(store.contains("10.0.0.3"));

        assert!(store.remove("10.0.0.2")?);
        assert!(!store.remove("10.0.0.2")?);
        let on_disk: Vec<String> = serde_json::from_slice(&fs::read(&path)?)?;
        assert_eq!(on_disk, vec!["10.0.0.1".to_string(), "10.0.0.3".to_string()]);
        Ok(())
    }

    #[test]
    fn plain_list_keeps_duplicates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ListStore::open(dir.path().join("api_key.json"), StoreOptions::default())?;
        assert!(store.append("key")?);
        assert!(store.append("key")?);
        assert_eq!(store.items(), vec!["key".to_string(), "key".to_string()]);
        Ok(())
    }
}
