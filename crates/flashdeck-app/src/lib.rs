//! flashdeck-app - Device tracking and command orchestration for flashdeck
//!
//! This crate owns the device registry that merges both transports, the
//! command session that runs flash and sync operations, configuration loading,
//! and the [`DeviceManager`] that wires them to the daemon layer.

pub mod config;
pub mod device_manager;
pub mod registry;
pub mod session;

// Re-export primary types
pub use config::{load_settings, load_settings_from, Settings};
pub use device_manager::DeviceManager;
pub use registry::{ChannelListener, DeviceListener, DeviceRegistry, ListenerId};
pub use session::{CommandSession, SessionEvent};

// Re-export daemon types for the CLI
pub use flashdeck_daemon::{BridgeClient, ProcessOutput, ToolAvailability};
