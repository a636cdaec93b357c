//! Application error types with rich context

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{OperationKind, Transport};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    // ─────────────────────────────────────────────────────────────
    // Process Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Command vector has no executable")]
    EmptyCommand,

    #[error("Failed to start '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("'{program}' did not finish within {after:?} and was killed")]
    Timeout { program: String, after: Duration },

    // ─────────────────────────────────────────────────────────────
    // Device Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Debug bridge unavailable: {reason}")]
    BridgeUnavailable { reason: String },

    #[error("A {kind} operation is already running")]
    AlreadyRunning { kind: OperationKind },

    #[error("{kind} requires a {expected} device, but {serial} is a {found} device")]
    WrongTransport {
        kind: OperationKind,
        serial: String,
        expected: Transport,
        found: Transport,
    },

    #[error("No {transport} device with serial {serial}")]
    UnknownDevice { transport: Transport, serial: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    // ─────────────────────────────────────────────────────────────
    // Channel Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn spawn(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Spawn {
            program: program.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(program: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            program: program.into(),
            after,
        }
    }

    pub fn bridge_unavailable(reason: impl Into<String>) -> Self {
        Self::BridgeUnavailable {
            reason: reason.into(),
        }
    }

    pub fn already_running(kind: OperationKind) -> Self {
        Self::AlreadyRunning { kind }
    }

    pub fn unknown_device(transport: Transport, serial: impl Into<String>) -> Self {
        Self::UnknownDevice {
            transport,
            serial: serial.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this error leaves nothing to run
    ///
    /// A missing bridge is not fatal: bootloader tracking keeps working.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::ConfigNotFound { .. } | Error::Toml(_)
        )
    }
}
