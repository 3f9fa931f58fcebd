#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Shared runtime state for the `MocaBot` server.
//!
//! Layout: `context.rs` (the `Runtime` handed to request handlers),
//! `registry.rs` (bot registry and id cache), `engine.rs` (dialogue engine
//! seam and the phrase-book engine), `rate.rs` (rate gates), `anomaly.rs`
//! (flood detection), `reload.rs` (store reconciliation and the rebuild
//! handler), `scheduler.rs` (non-overlapping periodic tasks).

pub mod anomaly;
pub mod context;
pub mod engine;
pub mod error;
pub mod rate;
pub mod registry;
pub mod reload;
pub mod scheduler;

pub use anomaly::{AnomalyDetector, AnomalySweep};
pub use context::{
    DOS_DETECT_TASK, DialogueRequest, Runtime, RuntimeDeps, STORE_RELOAD_TASK, StudyRequest,
    THROTTLE_PURGE_TASK, validate_bot_name,
};
pub use engine::{BotFactory, DialogueEngine, PhraseBook, PhraseBookFactory, Reply};
pub use error::{RuntimeError, RuntimeResult};
pub use rate::{PurgeExpired, RateGate};
pub use registry::{BotRecord, BotRegistry, IdNameCache, RebuildReport, RegistrySnapshot};
pub use reload::{RebuildOnFlag, StoreReloadTask};
pub use scheduler::{PeriodicTask, Scheduler, TaskHandle, TaskState};
