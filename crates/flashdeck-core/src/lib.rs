//! # flashdeck-core - Core Domain Types
//!
//! Foundation crate for flashdeck. Provides device identity types, the events
//! transport adapters report, the notifications registry listeners receive,
//! logging setup and error handling.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing, toml).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Device`], [`DeviceId`], [`Transport`] - Transport-scoped device identity
//! - [`OnlineState`], [`ChangeMask`] - Mutable device state
//! - [`OperationKind`] - Long-running operation classes (flash, sync)
//! - [`ArgumentSet`], [`CommandSpec`] - External command vectors
//!
//! ### Events (`events`)
//! - [`DeviceEvent`] - Presence change reported by a transport adapter
//! - [`EventSink`] - Ingestion point adapters feed
//! - [`DeviceNotification`] - The five listener notifications
//! - [`ProcessEvent`], [`ProcessExit`] - Streamed process output and outcome
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with a `fatal` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use flashdeck_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod prelude;
pub mod types;

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result};
pub use events::{DeviceEvent, DeviceNotification, EventSink, ProcessEvent, ProcessExit};
pub use types::{
    ArgumentSet, ChangeMask, CommandSpec, Device, DeviceId, OnlineState, OperationKind, Transport,
};
