use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use mocabot_config::{ServerSettings, ensure_layout, load_settings};
use mocabot_data::JsonBotDatabase;
use mocabot_runtime::{PhraseBookFactory, Runtime, RuntimeDeps};
use mocabot_telemetry::{FileSecurityLog, LogFormat, LoggingConfig, Metrics, init_logging};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// Environment variable naming the server root.
pub const HOME_ENV: &str = "MOCABOT_HOME";

/// Dependencies required to bootstrap the `MocaBot` server.
pub(crate) struct BootstrapDependencies {
    settings: ServerSettings,
}

impl BootstrapDependencies {
    /// Resolve the server root and load its settings from the process environment.
    pub(crate) fn from_env() -> AppResult<Self> {
        let root = resolve_root(std::env::var_os(HOME_ENV))?;
        let settings =
            load_settings(&root).map_err(|err| AppError::config("settings.load", err))?;
        Ok(Self { settings })
    }
}

fn resolve_root(value: Option<OsString>) -> AppResult<PathBuf> {
    match value.filter(|value| !value.is_empty()) {
        Some(value) => Ok(PathBuf::from(value)),
        None => std::env::current_dir().map_err(|source| AppError::Io {
            operation: "root.current_dir",
            path: None,
            source,
        }),
    }
}

/// Entry point for the `MocaBot` boot sequence.
///
/// # Errors
///
/// Returns an error if settings cannot be loaded, logging cannot be
/// installed, or runtime startup fails.
pub async fn run_app() -> AppResult<()> {
    let dependencies = BootstrapDependencies::from_env()?;
    let settings = &dependencies.settings;
    init_logging(&LoggingConfig {
        level: &settings.log_level,
        format: LogFormat::from_setting(settings.log_format.as_deref()),
    })
    .map_err(|err| AppError::telemetry("telemetry.init", err))?;

    Box::pin(run_app_with(dependencies, shutdown_signal())).await
}

/// Boot sequence over injected dependencies; returns once `shutdown` resolves
/// and the background tasks have stopped.
pub(crate) async fn run_app_with(
    dependencies: BootstrapDependencies,
    shutdown: impl Future<Output = ()> + Send,
) -> AppResult<()> {
    let BootstrapDependencies { settings } = dependencies;
    info!(root = %settings.root.display(), "MocaBot bootstrap starting");

    ensure_layout(&settings).map_err(|err| AppError::config("layout.ensure", err))?;
    let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
    let security = FileSecurityLog::open(settings.security_log_file())
        .map_err(|err| AppError::telemetry("security_log.open", err))?;
    let database = JsonBotDatabase::open(settings.data_dir.clone())
        .await
        .map_err(|err| AppError::data("database.open", err))?;

    let runtime = Runtime::initialize(RuntimeDeps {
        settings,
        database: Arc::new(database),
        factory: Arc::new(PhraseBookFactory),
        security: Arc::new(security),
        metrics,
    })
    .await
    .map_err(|err| AppError::runtime("runtime.initialize", err))?;

    let scheduler = runtime.start_background();
    info!(
        bots = runtime.registry().len(),
        tasks = scheduler.tasks().len(),
        "MocaBot runtime ready"
    );

    shutdown.await;
    info!("shutdown requested; stopping background tasks");
    scheduler.shutdown().await;
    info!("MocaBot shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
}
