//! Row types shared by every `BotDatabase` implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotRow {
    /// Database identifier.
    pub id: i64,
    /// Unique bot name, equal to its storage directory name.
    pub name: String,
}

/// One answered dialogue request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    /// Remote address of the caller.
    pub remote_addr: String,
    /// Bot that answered.
    pub bot_id: i64,
    /// Message sent by the caller.
    pub message: String,
    /// Reply kind reported by the engine.
    pub reply_kind: String,
    /// Reply text.
    pub reply: String,
    /// Caller-supplied client identifier.
    pub client_id: Option<String>,
    /// Time the reply was produced.
    pub created_at: DateTime<Utc>,
}

/// One message a bot studied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyEntry {
    /// Bot that studied the message.
    pub bot_id: i64,
    /// Studied text.
    pub message: String,
    /// Time the message was studied.
    pub created_at: DateTime<Utc>,
}
