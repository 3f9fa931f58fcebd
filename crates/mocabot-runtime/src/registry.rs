//! Registry of active bots and the id/name cache.
//!
//! # Design
//! - The bot map and the id/name cache live in one snapshot swapped atomically,
//!   so readers never see one without the other.
//! - Rebuilds are serialized; a database failure keeps the previous snapshot.
//! - An engine that fails to open keeps its previous instance.
//! - Rebuilds add or replace bots; a loaded bot stays until restart even when
//!   its directory disappears.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use mocabot_data::{BotDatabase, BotRow};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::engine::{BotFactory, DialogueEngine};
use crate::error::{RuntimeError, RuntimeResult};

/// One loaded bot.
#[derive(Clone)]
pub struct BotRecord {
    /// Bot name, equal to its storage directory name.
    pub name: String,
    /// Directory holding the bot's engine state.
    pub storage_path: PathBuf,
    /// Engine answering for the bot.
    pub engine: Arc<dyn DialogueEngine>,
}

impl Debug for BotRecord {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BotRecord")
            .field("name", &self.name)
            .field("storage_path", &self.storage_path)
            .finish_non_exhaustive()
    }
}

/// Bidirectional map between database ids and bot names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdNameCache {
    by_id: HashMap<i64, String>,
    by_name: HashMap<String, i64>,
}

impl IdNameCache {
    /// Build the cache from database rows.
    #[must_use]
    pub fn from_rows(rows: &[BotRow]) -> Self {
        let mut cache = Self::default();
        for row in rows {
            cache.insert(row.id, &row.name);
        }
        cache
    }

    fn insert(&mut self, id: i64, name: &str) {
        self.by_id.insert(id, name.to_string());
        self.by_name.insert(name.to_string(), id);
    }

    /// Id registered for `name`.
    #[must_use]
    pub fn id(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    /// Name registered for `id`.
    #[must_use]
    pub fn name(&self, id: i64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Number of cached rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the cache holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Consistent view of the registry at one point in time.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    bots: BTreeMap<String, BotRecord>,
    ids: IdNameCache,
}

impl RegistrySnapshot {
    /// Bot loaded under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BotRecord> {
        self.bots.get(name)
    }

    /// Loaded bots, ordered by name.
    pub fn bots(&self) -> impl Iterator<Item = &BotRecord> {
        self.bots.values()
    }

    /// Id/name cache captured with the bots.
    #[must_use]
    pub const fn ids(&self) -> &IdNameCache {
        &self.ids
    }

    /// Number of loaded bots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bots.len()
    }

    /// Whether no bot is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}

/// Summary of one rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Bots loaded after the rebuild.
    pub bots: usize,
    /// Rows created for directories the database did not know.
    pub inserted: usize,
    /// Bots whose engine failed to open.
    pub failed: Vec<String>,
}

/// Registry of bots discovered under the storage root.
pub struct BotRegistry {
    storage_root: PathBuf,
    database: Arc<dyn BotDatabase>,
    factory: Arc<dyn BotFactory>,
    snapshot: ArcSwap<RegistrySnapshot>,
    rebuild_lock: Mutex<()>,
}

impl Debug for BotRegistry {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BotRegistry")
            .field("storage_root", &self.storage_root)
            .field("bots", &self.snapshot.load().len())
            .finish_non_exhaustive()
    }
}

impl BotRegistry {
    /// Empty registry; call [`BotRegistry::rebuild`] to populate it.
    #[must_use]
    pub fn new(
        storage_root: impl Into<PathBuf>,
        database: Arc<dyn BotDatabase>,
        factory: Arc<dyn BotFactory>,
    ) -> Self {
        Self {
            storage_root: storage_root.into(),
            database,
            factory,
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Directory scanned for bots.
    #[must_use]
    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Bot loaded under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<BotRecord> {
        self.snapshot.load().get(name).cloned()
    }

    /// Database id for `name`.
    #[must_use]
    pub fn lookup_id(&self, name: &str) -> Option<i64> {
        self.snapshot.load().ids.id(name)
    }

    /// Bot name for database `id`.
    #[must_use]
    pub fn lookup_name(&self, id: i64) -> Option<String> {
        self.snapshot.load().ids.name(id).map(str::to_string)
    }

    /// Names of every loaded bot, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.snapshot.load().bots.keys().cloned().collect()
    }

    /// Copy of the id/name cache.
    #[must_use]
    pub fn id_cache(&self) -> IdNameCache {
        self.snapshot.load().ids.clone()
    }

    /// Number of loaded bots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Whether no bot is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Rescan the storage root and swap in a fresh snapshot.
    ///
    /// Discovered bots are added or replaced; bots already loaded are kept.
    ///
    /// # Errors
    ///
    /// Returns an error when the storage root cannot be enumerated or the
    /// database rejects an insert or fetch; the previous snapshot stays active.
    pub async fn rebuild(&self) -> RuntimeResult<RebuildReport> {
        let _rebuilding = self.rebuild_lock.lock().await;
        let directories = scan_storage(self.storage_root.clone()).await?;
        let previous = self.snapshot.load_full();

        let mut report = RebuildReport::default();
        let mut bots = previous.bots.clone();
        for (name, storage_path) in directories {
            if self.ensure_row(&name).await? {
                report.inserted += 1;
            }
            match self.factory.open(&name, &storage_path).await {
                Ok(engine) => {
                    bots.insert(
                        name.clone(),
                        BotRecord {
                            name,
                            storage_path,
                            engine,
                        },
                    );
                }
                Err(err) => {
                    warn!(
                        bot = %name,
                        error = %err,
                        "engine failed to open; keeping previous instance"
                    );
                    report.failed.push(name);
                }
            }
        }

        let rows = self
            .database
            .fetch_all_bots()
            .await
            .map_err(|err| RuntimeError::data("bots.fetch_all", err))?;
        let ids = IdNameCache::from_rows(&rows);

        report.bots = bots.len();
        self.snapshot.store(Arc::new(RegistrySnapshot { bots, ids }));
        info!(
            bots = report.bots,
            inserted = report.inserted,
            failed = report.failed.len(),
            "bot registry rebuilt"
        );
        Ok(report)
    }

    /// Publish a newly created bot without a full rescan.
    pub async fn insert(&self, record: BotRecord, id: i64) {
        let _rebuilding = self.rebuild_lock.lock().await;
        let current = self.snapshot.load_full();
        let mut bots = current.bots.clone();
        let mut ids = current.ids.clone();
        ids.insert(id, &record.name);
        debug!(bot = %record.name, id, "bot registered");
        bots.insert(record.name.clone(), record);
        self.snapshot.store(Arc::new(RegistrySnapshot { bots, ids }));
    }

    async fn ensure_row(&self, name: &str) -> RuntimeResult<bool> {
        match self.database.insert_bot(name).await {
            Ok(id) => {
                info!(bot = %name, id, "bot row created for storage directory");
                Ok(true)
            }
            Err(err) if err.is_duplicate() => Ok(false),
            Err(err) => Err(RuntimeError::data("bots.insert", err)),
        }
    }
}

async fn scan_storage(root: PathBuf) -> RuntimeResult<Vec<(String, PathBuf)>> {
    tokio::task::spawn_blocking(move || list_bot_dirs(&root))
        .await
        .map_err(|source| RuntimeError::TaskJoin {
            operation: "registry.scan",
            source,
        })?
}

fn list_bot_dirs(root: &Path) -> RuntimeResult<Vec<(String, PathBuf)>> {
    let mut directories = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| RuntimeError::Storage {
            path: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            warn!(path = %entry.path().display(), "skipping bot directory with non-utf8 name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        directories.push((name.to_string(), entry.path().to_path_buf()));
    }
    Ok(directories)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Reply;
    use async_trait::async_trait;
    use mocabot_data::{ChatLogEntry, DataError, DataResult, StudyEntry};
    use std::sync::Mutex as StdMutex;
    use std::sync::PoisonError;

    #[derive(Default)]
    struct RowsOnly {
        rows: StdMutex<Vec<BotRow>>,
    }

    #[async_trait]
    impl BotDatabase for RowsOnly {
        async fn insert_bot(&self, name: &str) -> DataResult<i64> {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            if rows.iter().any(|row| row.name == name) {
                return Err(DataError::Duplicate {
                    name: name.to_string(),
                });
            }
            let id = i64::try_from(rows.len()).unwrap_or(i64::MAX) + 1;
            rows.push(BotRow {
                id,
                name: name.to_string(),
            });
            Ok(id)
        }

        async fn fetch_all_bots(&self) -> DataResult<Vec<BotRow>> {
            Ok(self
                .rows
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone())
        }

        async fn record_chat(&self, _entry: ChatLogEntry) -> DataResult<()> {
            Ok(())
        }

        async fn record_study(&self, _entry: StudyEntry) -> DataResult<()> {
            Ok(())
        }

        async fn chat_logs(&self, _bot_id: i64) -> DataResult<Vec<ChatLogEntry>> {
            Ok(Vec::new())
        }

        async fn study_entries(&self, _bot_id: i64) -> DataResult<Vec<StudyEntry>> {
            Ok(Vec::new())
        }
    }

    struct Silent;

    #[async_trait]
    impl DialogueEngine for Silent {
        async fn dialogue(&self, _text: &str, _study: bool) -> anyhow::Result<Reply> {
            Ok(Reply::new("unknown", ""))
        }

        async fn save(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct SilentFactory;

    #[async_trait]
    impl BotFactory for SilentFactory {
        async fn open(
            &self,
            _name: &str,
            _storage_path: &Path,
        ) -> anyhow::Result<Arc<dyn DialogueEngine>> {
            Ok(Arc::new(Silent))
        }
    }

    fn registry(root: &Path) -> BotRegistry {
        BotRegistry::new(root, Arc::new(RowsOnly::default()), Arc::new(SilentFactory))
    }

    #[tokio::test]
    async fn rebuild_lists_directories_in_name_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["mocha", "latte", ".hidden"] {
            std::fs::create_dir(dir.path().join(name))?;
        }
        std::fs::write(dir.path().join("notes.txt"), "not a bot")?;

        let registry = registry(dir.path());
        let report = registry.rebuild().await?;

        assert_eq!(report.bots, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(registry.names(), vec!["latte".to_string(), "mocha".to_string()]);
        assert_eq!(registry.lookup_id("latte"), Some(1));
        assert_eq!(registry.lookup_name(2).as_deref(), Some("mocha"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_storage_root_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(&dir.path().join("absent"));
        let result = registry.rebuild().await;
        assert!(matches!(result, Err(RuntimeError::Storage { .. })));
        assert!(registry.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn insert_publishes_bot_and_id_together() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path());
        registry
            .insert(
                BotRecord {
                    name: "moca".to_string(),
                    storage_path: dir.path().join("moca"),
                    engine: Arc::new(Silent),
                },
                7,
            )
            .await;

        let snapshot = registry.snapshot();
        assert!(snapshot.get("moca").is_some());
        assert_eq!(snapshot.ids().id("moca"), Some(7));
        assert_eq!(registry.id_cache().name(7), Some("moca"));
        Ok(())
    }

    #[test]
    fn id_cache_maps_both_ways() {
        let cache = IdNameCache::from_rows(&[
            BotRow {
                id: 1,
                name: "moca".to_string(),
            },
            BotRow {
                id: 4,
                name: "latte".to_string(),
            },
        ]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.id("latte"), Some(4));
        assert_eq!(cache.name(1), Some("moca"));
        assert_eq!(cache.name(2), None);
    }
}
