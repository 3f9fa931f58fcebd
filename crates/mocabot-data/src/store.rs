//! Database contract consumed by the runtime.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{BotRow, ChatLogEntry, StudyEntry};

/// Persistence for bots, chat logs, and study history.
#[async_trait]
pub trait BotDatabase: Send + Sync {
    /// Insert a bot row and return its id.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Duplicate` when `name` already has a row, or another
    /// error when the store cannot be written.
    async fn insert_bot(&self, name: &str) -> Result<i64>;

    /// Every bot row, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    async fn fetch_all_bots(&self) -> Result<Vec<BotRow>>;

    /// Append a chat log row.
    ///
    /// # Errors
    ///
    /// Returns an error when the row cannot be written.
    async fn record_chat(&self, entry: ChatLogEntry) -> Result<()>;

    /// Append a study row.
    ///
    /// # Errors
    ///
    /// Returns an error when the row cannot be written.
    async fn record_study(&self, entry: StudyEntry) -> Result<()>;

    /// Chat log rows for `bot_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the rows cannot be read.
    async fn chat_logs(&self, bot_id: i64) -> Result<Vec<ChatLogEntry>>;

    /// Study rows for `bot_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the rows cannot be read.
    async fn study_entries(&self, bot_id: i64) -> Result<Vec<StudyEntry>>;
}
