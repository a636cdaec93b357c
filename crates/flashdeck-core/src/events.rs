//! Domain event definitions

use serde::Serialize;

use crate::types::{ChangeMask, Device, DeviceId, Transport};

// ─────────────────────────────────────────────────────────
// Device events (adapter → registry)
// ─────────────────────────────────────────────────────────

/// A presence change observed by one transport adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(Device),
    Disconnected { transport: Transport, serial: String },
    Changed { device: Device, mask: ChangeMask },
}

impl DeviceEvent {
    pub fn disconnected(transport: Transport, serial: impl Into<String>) -> Self {
        DeviceEvent::Disconnected {
            transport,
            serial: serial.into(),
        }
    }

    /// Registry key the event applies to
    pub fn device_id(&self) -> DeviceId {
        match self {
            DeviceEvent::Connected(device) => device.id(),
            DeviceEvent::Disconnected { transport, serial } => {
                DeviceId::new(*transport, serial.clone())
            }
            DeviceEvent::Changed { device, .. } => device.id(),
        }
    }
}

/// Ingestion point shared by every transport adapter
///
/// Implementations must serialize concurrent calls; adapters call this from
/// their own tasks.
pub trait EventSink: Send + Sync {
    fn ingest(&self, event: DeviceEvent);
}

impl EventSink for std::sync::mpsc::Sender<DeviceEvent> {
    fn ingest(&self, event: DeviceEvent) {
        if self.send(event).is_err() {
            tracing::debug!("device event receiver dropped");
        }
    }
}

// ─────────────────────────────────────────────────────────
// Listener notifications (registry → listeners)
// ─────────────────────────────────────────────────────────

/// The five notification kinds delivered to registry listeners
///
/// Bridge and bootloader devices get separate variants so listeners never
/// have to derive the transport from the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceNotification {
    DeviceConnected { device: Device },
    DeviceDisconnected { device: Device },
    DeviceChanged { device: Device, mask: ChangeMask },
    FastbootDeviceConnected { serial: String },
    FastbootDeviceDisconnected { serial: String },
}

impl DeviceNotification {
    /// Notification announcing that `device` is present
    pub fn connected(device: &Device) -> Self {
        match device.transport {
            Transport::Bridge => DeviceNotification::DeviceConnected {
                device: device.clone(),
            },
            Transport::Bootloader => DeviceNotification::FastbootDeviceConnected {
                serial: device.serial.clone(),
            },
        }
    }

    /// Notification announcing that `device` is gone
    pub fn disconnected(device: &Device) -> Self {
        match device.transport {
            Transport::Bridge => DeviceNotification::DeviceDisconnected {
                device: device.clone(),
            },
            Transport::Bootloader => DeviceNotification::FastbootDeviceDisconnected {
                serial: device.serial.clone(),
            },
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            DeviceNotification::DeviceConnected { .. }
            | DeviceNotification::DeviceDisconnected { .. }
            | DeviceNotification::DeviceChanged { .. } => Transport::Bridge,
            DeviceNotification::FastbootDeviceConnected { .. }
            | DeviceNotification::FastbootDeviceDisconnected { .. } => Transport::Bootloader,
        }
    }

    pub fn serial(&self) -> &str {
        match self {
            DeviceNotification::DeviceConnected { device }
            | DeviceNotification::DeviceDisconnected { device }
            | DeviceNotification::DeviceChanged { device, .. } => &device.serial,
            DeviceNotification::FastbootDeviceConnected { serial }
            | DeviceNotification::FastbootDeviceDisconnected { serial } => serial,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Process events (runner → caller)
// ─────────────────────────────────────────────────────────

/// How a streamed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum ProcessExit {
    /// Process exited on its own with this code
    Code(i32),
    /// Process ended without an exit code (killed by a signal)
    Terminated,
    /// Cancellation was requested before the exit was reported
    Cancelled,
    /// The executable could not be started
    SpawnFailed,
}

impl ProcessExit {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessExit::Code(code) => Some(*code),
            _ => None,
        }
    }
}

/// Output and termination events of a streamed process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout, without the trailing newline
    Stdout(String),
    /// One line of stderr, or a spawn/read failure description
    Stderr(String),
    /// Always the last event, sent exactly once
    Exited(ProcessExit),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_for_bridge_device() {
        let device = Device::bridge("ABC123");
        assert_eq!(
            DeviceNotification::connected(&device),
            DeviceNotification::DeviceConnected {
                device: device.clone()
            }
        );
        assert_eq!(
            DeviceNotification::disconnected(&device).transport(),
            Transport::Bridge
        );
    }

    #[test]
    fn test_notification_for_bootloader_device() {
        let device = Device::bootloader("ABC123");
        assert_eq!(
            DeviceNotification::connected(&device),
            DeviceNotification::FastbootDeviceConnected {
                serial: "ABC123".to_string()
            }
        );
        assert_eq!(DeviceNotification::disconnected(&device).serial(), "ABC123");
    }

    #[test]
    fn test_event_device_id() {
        let event = DeviceEvent::disconnected(Transport::Bootloader, "XYZ");
        assert_eq!(event.device_id(), DeviceId::bootloader("XYZ"));
    }

    #[test]
    fn test_process_exit_success() {
        assert!(ProcessExit::Code(0).is_success());
        assert!(!ProcessExit::Code(1).is_success());
        assert!(!ProcessExit::Cancelled.is_success());
        assert!(!ProcessExit::SpawnFailed.is_success());
        assert_eq!(ProcessExit::Code(7).code(), Some(7));
        assert_eq!(ProcessExit::Terminated.code(), None);
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (tx, rx) = std::sync::mpsc::channel();
        tx.ingest(DeviceEvent::Connected(Device::bootloader("A")));
        assert_eq!(
            rx.recv().unwrap(),
            DeviceEvent::Connected(Device::bootloader("A"))
        );
    }

    #[test]
    fn test_notification_serializes_with_kind_tag() {
        let json = serde_json::to_value(DeviceNotification::FastbootDeviceConnected {
            serial: "A".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "fastboot_device_connected");
        assert_eq!(json["serial"], "A");
    }
}
