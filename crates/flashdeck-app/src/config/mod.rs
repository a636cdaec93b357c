//! Configuration file parsing for flashdeck
//!
//! Reads `.flashdeck/config.toml` (or an explicit path). Nothing is ever
//! written back.

pub mod settings;
pub mod types;

pub use settings::{config_path, load_settings, load_settings_from};
pub use types::*;
