//! Temporary server trees and runtime dependency bundles.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use mocabot_config::{ServerSettings, ensure_layout};
use mocabot_data::BotDatabase;
use mocabot_runtime::{BotFactory, RuntimeDeps};
use mocabot_telemetry::{Metrics, SecurityLog};
use serde_json::Value;
use tempfile::TempDir;

use crate::mocks::{EchoFactory, MemoryBotDatabase, RecordingSecurityLog};

/// A server root in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TestTree {
    dir: TempDir,
    settings: ServerSettings,
}

impl TestTree {
    /// Create a tree with the default layout already on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory or layout cannot be created.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let settings = ServerSettings::rooted_at(dir.path());
        ensure_layout(&settings)?;
        Ok(Self { dir, settings })
    }

    /// Root of the tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Settings rooted at this tree.
    #[must_use]
    pub const fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Mutable settings, for tests that tune limits or intervals.
    pub const fn settings_mut(&mut self) -> &mut ServerSettings {
        &mut self.settings
    }

    /// Create the storage directory of bot `name` and return its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create_bot_dir(&self, name: &str) -> Result<PathBuf> {
        let path = self.settings.bot_dir(name);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Overwrite `path` with pretty-printed `value`, as an operator editing by hand would.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded or written.
    pub fn write_json(&self, path: &Path, value: &Value) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(value)?)?;
        Ok(())
    }

    /// Runtime dependencies over this tree with caller-supplied collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics registry cannot be built.
    pub fn deps_with(
        &self,
        database: Arc<dyn BotDatabase>,
        factory: Arc<dyn BotFactory>,
        security: Arc<dyn SecurityLog>,
    ) -> Result<RuntimeDeps> {
        Ok(RuntimeDeps {
            settings: self.settings.clone(),
            database,
            factory,
            security,
            metrics: Metrics::new()?,
        })
    }
}

/// In-memory collaborators handed to a runtime, kept for later assertions.
#[derive(Debug, Default, Clone)]
pub struct Doubles {
    /// Bot, chat log, and study rows.
    pub database: Arc<MemoryBotDatabase>,
    /// Engine factory.
    pub factory: Arc<EchoFactory>,
    /// Security log entries.
    pub security: Arc<RecordingSecurityLog>,
}

impl Doubles {
    /// Runtime dependencies over `tree` using these doubles.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics registry cannot be built.
    pub fn deps(&self, tree: &TestTree) -> Result<RuntimeDeps> {
        tree.deps_with(
            self.database.clone(),
            self.factory.clone(),
            self.security.clone(),
        )
    }
}
