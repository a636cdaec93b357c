//! Headless output - NDJSON events on stdout
//!
//! Every CLI subcommand reports what happens as newline-delimited JSON, one
//! event per line, so scripts can follow device changes and operation output
//! without scraping text. Logs go to the log file, never to stdout.
//!
//! # Example Output
//!
//! ```json
//! {"event":"device_connected","serial":"R58M123ABC","model":"Pixel 7","state":"online","timestamp":1704700001000}
//! {"event":"fastboot_device_connected","serial":"R58M123ABC","timestamp":1704700002000}
//! {"event":"output","operation":"flash","stream":"stdout","line":"Sending 'boot' (65536 KB)","timestamp":1704700003000}
//! {"event":"operation_completed","operation":"flash","success":true,"exit_code":0,"cancelled":false,"timestamp":1704700004000}
//! ```

pub mod runner;

use chrono::Utc;
use serde::Serialize;
use std::io::{self, Write};
use tracing::error;

use flashdeck_app::{ProcessOutput, SessionEvent};
use flashdeck_core::{Device, DeviceNotification, Error, OnlineState, OperationKind, ProcessExit};

/// Events emitted on stdout
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// A bridge device appeared
    DeviceConnected {
        serial: String,
        model: Option<String>,
        state: String,
        timestamp: i64,
    },

    /// A bridge device went away
    DeviceDisconnected { serial: String, timestamp: i64 },

    /// A bridge device changed; `mask` holds the raw change bits
    DeviceChanged {
        serial: String,
        mask: u32,
        state: String,
        timestamp: i64,
    },

    FastbootDeviceConnected { serial: String, timestamp: i64 },

    FastbootDeviceDisconnected { serial: String, timestamp: i64 },

    /// Snapshot of both transports
    DeviceList {
        bridge: Vec<String>,
        fastboot: Vec<String>,
        timestamp: i64,
    },

    /// A flash or sync operation was started
    OperationStarted {
        operation: String,
        serial: String,
        timestamp: i64,
    },

    /// One line of operation output
    Output {
        operation: String,
        stream: String,
        line: String,
        timestamp: i64,
    },

    /// A flash or sync operation finished
    OperationCompleted {
        operation: String,
        success: bool,
        exit_code: Option<i32>,
        cancelled: bool,
        timestamp: i64,
    },

    /// Result of a one-shot command (root, remount, reboot)
    CommandResult {
        command: String,
        serial: String,
        exit_code: Option<i32>,
        stdout: Vec<String>,
        stderr: Vec<String>,
        timestamp: i64,
    },

    /// Error occurred
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        // Write to stdout with newline (NDJSON format)
        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn device_list(bridge: &[Device], fastboot: Vec<String>) -> Self {
        Self::DeviceList {
            bridge: bridge.iter().map(Device::display_name).collect(),
            fastboot,
            timestamp: Self::now(),
        }
    }

    pub fn operation_started(kind: OperationKind, serial: &str) -> Self {
        Self::OperationStarted {
            operation: kind.to_string(),
            serial: serial.to_string(),
            timestamp: Self::now(),
        }
    }

    /// Map a session event of operation `kind`
    pub fn from_session(kind: OperationKind, event: &SessionEvent) -> Self {
        let operation = kind.to_string();
        match event {
            SessionEvent::Output(line) => Self::Output {
                operation,
                stream: "stdout".to_string(),
                line: line.clone(),
                timestamp: Self::now(),
            },
            SessionEvent::Error(line) => Self::Output {
                operation,
                stream: "stderr".to_string(),
                line: line.clone(),
                timestamp: Self::now(),
            },
            SessionEvent::Completed { success, exit } => Self::OperationCompleted {
                operation,
                success: *success,
                exit_code: exit.code(),
                cancelled: *exit == ProcessExit::Cancelled,
                timestamp: Self::now(),
            },
        }
    }

    pub fn command_result(command: &str, serial: &str, output: ProcessOutput) -> Self {
        Self::CommandResult {
            command: command.to_string(),
            serial: serial.to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout_lines,
            stderr: output.stderr_lines,
            timestamp: Self::now(),
        }
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            fatal,
            timestamp: Self::now(),
        }
    }

    pub fn from_error(error: &Error) -> Self {
        Self::error(error.to_string(), error.is_fatal())
    }
}

fn state_name(state: OnlineState) -> String {
    match state {
        OnlineState::Online => "online".to_string(),
        OnlineState::Offline => "offline".to_string(),
    }
}

impl From<&DeviceNotification> for HeadlessEvent {
    fn from(notification: &DeviceNotification) -> Self {
        let timestamp = Self::now();
        match notification {
            DeviceNotification::DeviceConnected { device } => Self::DeviceConnected {
                serial: device.serial.clone(),
                model: device.model.clone(),
                state: state_name(device.online_state),
                timestamp,
            },
            DeviceNotification::DeviceDisconnected { device } => Self::DeviceDisconnected {
                serial: device.serial.clone(),
                timestamp,
            },
            DeviceNotification::DeviceChanged { device, mask } => Self::DeviceChanged {
                serial: device.serial.clone(),
                mask: mask.bits(),
                state: state_name(device.online_state),
                timestamp,
            },
            DeviceNotification::FastbootDeviceConnected { serial } => {
                Self::FastbootDeviceConnected {
                    serial: serial.clone(),
                    timestamp,
                }
            }
            DeviceNotification::FastbootDeviceDisconnected { serial } => {
                Self::FastbootDeviceDisconnected {
                    serial: serial.clone(),
                    timestamp,
                }
            }
        }
    }
}
