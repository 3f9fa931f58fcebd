//! File-backed `BotDatabase`.
//!
//! # Design
//! - Bot rows live in `bots.json`, rewritten through a temp file on each insert.
//! - Chat logs and study rows are append-only JSON Lines files.
//! - Bot rows are cached in memory; log rows are read back on demand.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DataError, Result};
use crate::model::{BotRow, ChatLogEntry, StudyEntry};
use crate::store::BotDatabase;

const BOTS_FILE: &str = "bots.json";
const CHAT_LOG_FILE: &str = "chat_logs.jsonl";
const STUDY_FILE: &str = "study.jsonl";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BotTable {
    next_id: i64,
    bots: Vec<BotRow>,
}

/// `BotDatabase` stored as JSON files under one directory.
#[derive(Debug)]
pub struct JsonBotDatabase {
    dir: PathBuf,
    bots: Mutex<BotTable>,
    appends: Mutex<()>,
}

impl JsonBotDatabase {
    /// Open the database directory, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or `bots.json`
    /// exists but cannot be read or decoded.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| DataError::Io {
                operation: "database.create_dir",
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(BOTS_FILE);
        let table = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<BotTable>(&bytes)
                .map_err(|source| DataError::Corrupt {
                    path: path.clone(),
                    source,
                })?,
            Err(err) if err.kind() == ErrorKind::NotFound => BotTable::default(),
            Err(source) => {
                return Err(DataError::Io {
                    operation: "bots.read",
                    path,
                    source,
                });
            }
        };

        info!(dir = %dir.display(), bots = table.bots.len(), "json database opened");
        Ok(Self {
            dir,
            bots: Mutex::new(table),
            appends: Mutex::new(()),
        })
    }

    /// Directory holding the database files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_bots(&self, table: &BotTable) -> Result<()> {
        let path = self.dir.join(BOTS_FILE);
        let bytes = serde_json::to_vec_pretty(table).map_err(|source| DataError::Encode {
            operation: "bots.encode",
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)
            .await
            .map_err(|source| DataError::Io {
                operation: "bots.write_tmp",
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| DataError::Io {
                operation: "bots.rename",
                path,
                source,
            })
    }

    async fn append_row<T: Serialize + Sync>(&self, file: &str, row: &T) -> Result<()> {
        let mut line = serde_json::to_vec(row).map_err(|source| DataError::Encode {
            operation: "rows.encode",
            source,
        })?;
        line.push(b'\n');

        let path = self.dir.join(file);
        let _appending = self.appends.lock().await;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| DataError::Io {
                operation: "rows.open",
                path: path.clone(),
                source,
            })?;
        handle
            .write_all(&line)
            .await
            .map_err(|source| DataError::Io {
                operation: "rows.append",
                path,
                source,
            })
    }

    async fn read_rows<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>> {
        let path = self.dir.join(file);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DataError::Io {
                    operation: "rows.read",
                    path,
                    source,
                });
            }
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| DataError::Corrupt {
                    path: path.clone(),
                    source,
                })
            })
            .collect()
    }
}

#[async_trait]
impl BotDatabase for JsonBotDatabase {
    async fn insert_bot(&self, name: &str) -> Result<i64> {
        let mut table = self.bots.lock().await;
        if table.bots.iter().any(|row| row.name == name) {
            return Err(DataError::Duplicate {
                name: name.to_string(),
            });
        }

        let mut next = table.clone();
        next.next_id += 1;
        let id = next.next_id;
        next.bots.push(BotRow {
            id,
            name: name.to_string(),
        });
        self.write_bots(&next).await?;
        *table = next;
        debug!(bot = %name, id, "bot row inserted");
        Ok(id)
    }

    async fn fetch_all_bots(&self) -> Result<Vec<BotRow>> {
        let mut rows = self.bots.lock().await.bots.clone();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn record_chat(&self, entry: ChatLogEntry) -> Result<()> {
        self.append_row(CHAT_LOG_FILE, &entry).await
    }

    async fn record_study(&self, entry: StudyEntry) -> Result<()> {
        self.append_row(STUDY_FILE, &entry).await
    }

    async fn chat_logs(&self, bot_id: i64) -> Result<Vec<ChatLogEntry>> {
        let rows: Vec<ChatLogEntry> = self.read_rows(CHAT_LOG_FILE).await?;
        Ok(rows.into_iter().filter(|row| row.bot_id == bot_id).collect())
    }

    async fn study_entries(&self, bot_id: i64) -> Result<Vec<StudyEntry>> {
        let rows: Vec<StudyEntry> = self.read_rows(STUDY_FILE).await?;
        Ok(rows.into_iter().filter(|row| row.bot_id == bot_id).collect())
    }
}
