//! Feature flag bus for the `MocaBot` runtime.
//!
//! Flags are JSON scalars persisted in a [`mocabot_config::MapStore`]. Handlers
//! register under a unique id and run in registration order whenever a flag's
//! value changes, either through [`FlagBus::set`] or when a reload of the flag
//! file picks up an external edit. A failing or panicking handler is logged and
//! counted; it never stops the handlers after it.

pub mod error;
pub mod flags;

pub use error::{FlagError, FlagResult};
pub use flags::{DispatchReport, FlagBus, FlagChange, FlagHandler, FlagReload};
