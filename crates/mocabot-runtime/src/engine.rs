//! Dialogue engine contract and the default phrase-book engine.
//!
//! # Design
//! - The runtime treats engines as opaque: text in, `Reply` out.
//! - `PhraseBook` learns prompt/response pairs from consecutive studied
//!   messages and persists them to `phrases.json` in the bot directory.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

/// File holding a phrase book inside its bot directory.
pub const PHRASES_FILE: &str = "phrases.json";

/// Reply kind for a prompt the engine recognised.
pub const REPLY_LEARNED: &str = "learned";
/// Reply kind for a prompt the engine has no answer for.
pub const REPLY_UNKNOWN: &str = "unknown";
/// Reply kind returned while studying.
pub const REPLY_STUDIED: &str = "studied";

/// Engine answer to one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Engine-defined reply category.
    pub kind: String,
    /// Reply text.
    pub content: String,
}

impl Reply {
    /// Build a reply of `kind` carrying `content`.
    #[must_use]
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }
}

/// Conversational engine owned by one bot.
#[async_trait]
pub trait DialogueEngine: Send + Sync {
    /// Answer `text`; in study mode the engine learns from it instead.
    async fn dialogue(&self, text: &str, study: bool) -> Result<Reply>;

    /// Persist whatever the engine has learned.
    async fn save(&self) -> Result<()>;
}

/// Opens the engine for a bot directory.
#[async_trait]
pub trait BotFactory: Send + Sync {
    /// Open (or create) the engine for `name` stored under `storage_path`.
    async fn open(&self, name: &str, storage_path: &Path) -> Result<Arc<dyn DialogueEngine>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PhraseDocument {
    pairs: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct PhraseState {
    document: PhraseDocument,
    last_studied: Option<String>,
}

/// Engine that replays responses learned from studied conversations.
#[derive(Debug)]
pub struct PhraseBook {
    path: PathBuf,
    state: Mutex<PhraseState>,
}

impl PhraseBook {
    /// Load the phrase book stored in `dir`, starting empty when none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(PHRASES_FILE);
        let document = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => PhraseDocument::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(PhraseState {
                document,
                last_studied: None,
            }),
        })
    }

    /// Number of learned prompts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().document.pairs.len()
    }

    /// Whether nothing has been learned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, PhraseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn prompt_key(text: &str) -> String {
    text.trim().to_lowercase()
}

#[async_trait]
impl DialogueEngine for PhraseBook {
    async fn dialogue(&self, text: &str, study: bool) -> Result<Reply> {
        let key = prompt_key(text);
        let mut state = self.lock();
        if study {
            if let Some(previous) = state.last_studied.take() {
                state
                    .document
                    .pairs
                    .insert(previous, text.trim().to_string());
            }
            state.last_studied = Some(key);
            return Ok(Reply::new(REPLY_STUDIED, ""));
        }

        Ok(state.document.pairs.get(&key).map_or_else(
            || Reply::new(REPLY_UNKNOWN, ""),
            |response| Reply::new(REPLY_LEARNED, response.clone()),
        ))
    }

    async fn save(&self) -> Result<()> {
        let document = self.lock().document.clone();
        let bytes = serde_json::to_vec_pretty(&document).context("encoding phrase book")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        debug!(path = %self.path.display(), phrases = document.pairs.len(), "phrase book saved");
        Ok(())
    }
}

/// Factory producing a [`PhraseBook`] per bot directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhraseBookFactory;

#[async_trait]
impl BotFactory for PhraseBookFactory {
    async fn open(&self, name: &str, storage_path: &Path) -> Result<Arc<dyn DialogueEngine>> {
        let book = PhraseBook::load(storage_path)
            .await
            .with_context(|| format!("opening phrase book for bot {name}"))?;
        Ok(Arc::new(book))
    }
}
