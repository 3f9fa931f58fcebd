//! In-memory doubles for the database, dialogue engines, and security log.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use mocabot_data::{BotDatabase, BotRow, ChatLogEntry, DataError, DataResult, StudyEntry};
use mocabot_runtime::{BotFactory, DialogueEngine, Reply};
use mocabot_telemetry::{SecurityLevel, SecurityLog, TelemetryError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Rows {
    bots: Vec<BotRow>,
    chats: Vec<ChatLogEntry>,
    studies: Vec<StudyEntry>,
}

/// `BotDatabase` kept in memory, with switches to simulate outages.
#[derive(Debug, Default)]
pub struct MemoryBotDatabase {
    rows: Mutex<Rows>,
    fail_fetch: AtomicBool,
    fail_insert: AtomicBool,
}

impl MemoryBotDatabase {
    /// Make `fetch_all_bots` fail until switched back.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Make `insert_bot` fail with an outage (not a duplicate) until switched back.
    pub fn set_fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    /// Bot rows in insertion order.
    #[must_use]
    pub fn bots(&self) -> Vec<BotRow> {
        lock(&self.rows).bots.clone()
    }

    /// Every chat log row.
    #[must_use]
    pub fn chats(&self) -> Vec<ChatLogEntry> {
        lock(&self.rows).chats.clone()
    }

    /// Every study row.
    #[must_use]
    pub fn studies(&self) -> Vec<StudyEntry> {
        lock(&self.rows).studies.clone()
    }
}

#[async_trait]
impl BotDatabase for MemoryBotDatabase {
    async fn insert_bot(&self, name: &str) -> DataResult<i64> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(DataError::Unavailable {
                operation: "bots.insert",
            });
        }
        let mut rows = lock(&self.rows);
        if rows.bots.iter().any(|row| row.name == name) {
            return Err(DataError::Duplicate {
                name: name.to_string(),
            });
        }
        let id = rows.bots.last().map_or(1, |row| row.id + 1);
        rows.bots.push(BotRow {
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn fetch_all_bots(&self) -> DataResult<Vec<BotRow>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(DataError::Unavailable {
                operation: "bots.fetch",
            });
        }
        Ok(self.bots())
    }

    async fn record_chat(&self, entry: ChatLogEntry) -> DataResult<()> {
        lock(&self.rows).chats.push(entry);
        Ok(())
    }

    async fn record_study(&self, entry: StudyEntry) -> DataResult<()> {
        lock(&self.rows).studies.push(entry);
        Ok(())
    }

    async fn chat_logs(&self, bot_id: i64) -> DataResult<Vec<ChatLogEntry>> {
        Ok(self
            .chats()
            .into_iter()
            .filter(|entry| entry.bot_id == bot_id)
            .collect())
    }

    async fn study_entries(&self, bot_id: i64) -> DataResult<Vec<StudyEntry>> {
        Ok(self
            .studies()
            .into_iter()
            .filter(|entry| entry.bot_id == bot_id)
            .collect())
    }
}

/// Engine that answers `"<bot>: <text>"` and remembers what it studied.
#[derive(Debug)]
pub struct EchoEngine {
    bot: String,
    studied: Mutex<Vec<String>>,
    saves: AtomicUsize,
}

impl EchoEngine {
    /// Engine for `bot`.
    #[must_use]
    pub fn new(bot: &str) -> Self {
        Self {
            bot: bot.to_string(),
            studied: Mutex::new(Vec::new()),
            saves: AtomicUsize::new(0),
        }
    }

    /// Messages received in study mode.
    #[must_use]
    pub fn studied(&self) -> Vec<String> {
        lock(&self.studied).clone()
    }

    /// Number of completed saves.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DialogueEngine for EchoEngine {
    async fn dialogue(&self, text: &str, study: bool) -> anyhow::Result<Reply> {
        if study {
            lock(&self.studied).push(text.to_string());
            return Ok(Reply::new("studied", ""));
        }
        Ok(Reply::new("echo", format!("{}: {text}", self.bot)))
    }

    async fn save(&self) -> anyhow::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory producing [`EchoEngine`]s, with per-name failure injection.
#[derive(Debug, Default)]
pub struct EchoFactory {
    opens: AtomicUsize,
    failing: Mutex<BTreeSet<String>>,
    engines: Mutex<HashMap<String, Arc<EchoEngine>>>,
}

impl EchoFactory {
    /// Make opening `name` fail until [`EchoFactory::heal`] is called.
    pub fn fail_on(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }

    /// Let `name` open again.
    pub fn heal(&self, name: &str) {
        lock(&self.failing).remove(name);
    }

    /// Total successful opens.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Most recently opened engine for `name`.
    #[must_use]
    pub fn engine(&self, name: &str) -> Option<Arc<EchoEngine>> {
        lock(&self.engines).get(name).cloned()
    }
}

#[async_trait]
impl BotFactory for EchoFactory {
    async fn open(
        &self,
        name: &str,
        _storage_path: &Path,
    ) -> anyhow::Result<Arc<dyn DialogueEngine>> {
        if lock(&self.failing).contains(name) {
            return Err(anyhow!("engine for {name} refused to open"));
        }
        let engine = Arc::new(EchoEngine::new(name));
        lock(&self.engines).insert(name.to_string(), Arc::clone(&engine));
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(engine)
    }
}

/// Security log that keeps entries in memory.
#[derive(Debug, Default)]
pub struct RecordingSecurityLog {
    entries: Mutex<Vec<(String, SecurityLevel)>>,
}

impl RecordingSecurityLog {
    /// Entries written so far.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, SecurityLevel)> {
        lock(&self.entries).clone()
    }
}

impl SecurityLog for RecordingSecurityLog {
    fn write_event(&self, message: &str, level: SecurityLevel) -> Result<(), TelemetryError> {
        lock(&self.entries).push((message.to_string(), level));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_database_rejects_duplicate_names() -> anyhow::Result<()> {
        let database = MemoryBotDatabase::default();
        assert_eq!(database.insert_bot("moca").await?, 1);
        assert_eq!(database.insert_bot("latte").await?, 2);
        let err = database.insert_bot("moca").await.err();
        assert!(err.is_some_and(|err| err.is_duplicate()));

        database.set_fail_fetch(true);
        assert!(database.fetch_all_bots().await.is_err());
        database.set_fail_fetch(false);
        assert_eq!(database.fetch_all_bots().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn echo_factory_tracks_engines_and_failures() -> anyhow::Result<()> {
        let factory = EchoFactory::default();
        let engine = factory.open("moca", Path::new("/tmp/moca")).await?;
        let reply = engine.dialogue("hi", false).await?;
        assert_eq!(reply.content, "moca: hi");
        assert_eq!(factory.opens(), 1);

        factory.fail_on("moca");
        assert!(factory.open("moca", Path::new("/tmp/moca")).await.is_err());
        factory.heal("moca");
        assert!(factory.open("moca", Path::new("/tmp/moca")).await.is_ok());
        assert_eq!(factory.opens(), 2);
        Ok(())
    }
}
