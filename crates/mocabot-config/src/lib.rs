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

//! File-backed configuration for the `MocaBot` server.
//!
//! Layout: `model.rs` (bootstrap settings), `loader.rs` (settings file + env
//! overrides), `validate.rs` (field validation), `document.rs` (JSON documents
//! and their diffs), `store.rs` (`WatchedStore` with manual reload).

pub mod defaults;
pub mod document;
pub mod error;
pub mod loader;
pub mod model;
pub mod store;
pub mod validate;

pub use document::{Document, JsonMap, KeyChange, ListChange};
pub use error::{ConfigError, ConfigResult};
pub use loader::{ensure_layout, load_settings, load_settings_with};
pub use model::{DialogueLimit, ServerSettings};
pub use store::{ListStore, MapStore, ReloadOutcome, StoreOptions, WatchedStore};
