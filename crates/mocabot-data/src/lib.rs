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

//! Persistence for bots, chat logs, and study history.
//!
//! Layout: `model.rs` (rows), `store.rs` (`BotDatabase` contract), `json.rs`
//! (file-backed implementation), `error.rs` (error types).

pub mod error;
pub mod json;
pub mod model;
pub mod store;

pub use error::{DataError, Result as DataResult};
pub use json::JsonBotDatabase;
pub use model::{BotRow, ChatLogEntry, StudyEntry};
pub use store::BotDatabase;
