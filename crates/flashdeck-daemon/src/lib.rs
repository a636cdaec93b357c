//! # flashdeck-daemon - External Tool and Transport Plumbing
//!
//! Runs the device tools (`adb`, `fastboot`) as child processes and turns what
//! the two transports report into [`flashdeck_core::DeviceEvent`]s.
//!
//! Depends on [`flashdeck_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Process Management
//! - [`ProcessRunner`] - Blocking and streaming process execution
//! - [`CancelHandle`] - Termination handle for a streamed process
//! - [`ProcessOutput`] - Captured output of a blocking run
//!
//! ### Device Discovery
//! - [`FastbootPoller`] - Periodic bootloader enumeration with diffing
//! - [`parse_serials()`] - Parse `fastboot devices` output
//! - [`BridgeAdapter`] - Forwards [`BridgeClient`] notifications
//! - [`AdbCliBridge`] - [`BridgeClient`] backed by `adb devices -l`
//!
//! ### Commands and Tools
//! - [`DeviceCommand`], [`ToolPaths`] - Command vectors per operation
//! - [`ToolAvailability`] - Locate adb and fastboot

pub mod adb;
pub mod bridge;
pub mod commands;
pub mod fastboot;
pub mod process;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tool_availability;

// Public API re-exports
pub use adb::{parse_devices, AdbCliBridge};
pub use bridge::{BridgeAdapter, BridgeChange, BridgeClient, BridgeDevice, BridgeDeviceState};
pub use commands::{DeviceCommand, ToolPaths};
pub use fastboot::{parse_serials, FastbootPoller, PollerConfig};
pub use process::{CancelHandle, ProcessOutput, ProcessRunner, DEFAULT_GRACE_PERIOD};
pub use tool_availability::{ToolAvailability, ToolOverrides};
