//! Debug bridge integration
//!
//! The bridge client (the adb server connection) pushes device additions,
//! removals and changes. [`BridgeClient`] abstracts that client and
//! [`BridgeAdapter`] forwards what it reports into an [`EventSink`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flashdeck_core::prelude::*;
use flashdeck_core::{ChangeMask, Device, DeviceEvent, EventSink, OnlineState, Transport};

/// Device state as reported by the bridge server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeDeviceState {
    Online,
    Offline,
    Unauthorized,
    Recovery,
    Other(String),
}

impl BridgeDeviceState {
    /// Parse the state column of `adb devices`
    pub fn parse(state: &str) -> Self {
        match state {
            "device" => Self::Online,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "recovery" => Self::Recovery,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the device accepts bridge commands in this state
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online | Self::Recovery)
    }
}

impl fmt::Display for BridgeDeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "device"),
            Self::Offline => write!(f, "offline"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Recovery => write!(f, "recovery"),
            Self::Other(state) => write!(f, "{}", state),
        }
    }
}

/// Device object handed out by the bridge client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDevice {
    pub serial: String,
    pub state: BridgeDeviceState,
    pub model: Option<String>,
}

impl BridgeDevice {
    pub fn new(serial: impl Into<String>, state: BridgeDeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Translate into the registry's device representation
    pub fn to_device(&self) -> Device {
        let state = if self.state.is_online() {
            OnlineState::Online
        } else {
            OnlineState::Offline
        };

        Device {
            transport: Transport::Bridge,
            serial: self.serial.clone(),
            online_state: state,
            capability_mask: ChangeMask::NONE,
            model: self.model.clone(),
        }
    }
}

/// Change pushed by the bridge client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeChange {
    Added(BridgeDevice),
    Removed(BridgeDevice),
    Changed(BridgeDevice, ChangeMask),
}

impl BridgeChange {
    fn into_event(self) -> DeviceEvent {
        match self {
            BridgeChange::Added(device) => DeviceEvent::Connected(device.to_device()),
            BridgeChange::Removed(device) => {
                DeviceEvent::disconnected(Transport::Bridge, device.serial)
            }
            BridgeChange::Changed(device, mask) => {
                let mut translated = device.to_device();
                translated.capability_mask = mask;
                DeviceEvent::Changed {
                    device: translated,
                    mask,
                }
            }
        }
    }
}

/// Connection to the bridge server
pub trait BridgeClient: Send + Sync {
    /// Whether the connection to the bridge server is established
    fn is_connected(&self) -> bool;

    /// Devices currently known to the bridge server
    fn devices(&self) -> Vec<BridgeDevice>;

    /// Stream of subsequent changes
    fn subscribe(&self) -> mpsc::UnboundedReceiver<BridgeChange>;
}

/// Forwards bridge client notifications into an [`EventSink`]
pub struct BridgeAdapter {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl BridgeAdapter {
    /// Ingest the client's current devices and forward every later change.
    ///
    /// Fails with [`Error::BridgeUnavailable`] when the client is not
    /// connected; the attach is not retried. Must be called from within a
    /// tokio runtime.
    pub fn attach(client: Arc<dyn BridgeClient>, sink: Arc<dyn EventSink>) -> Result<Self> {
        if !client.is_connected() {
            warn!("Bridge server not connected, bridge devices will not be tracked");
            return Err(Error::bridge_unavailable(
                "bridge client has no server connection",
            ));
        }

        // Subscribe before listing so nothing between the two is lost; the
        // registry collapses any duplicate Connected.
        let mut changes = client.subscribe();

        let initial = client.devices();
        info!("Bridge attached with {} device(s)", initial.len());
        for device in initial {
            sink.ingest(DeviceEvent::Connected(device.to_device()));
        }

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(change) => {
                            debug!("Bridge change: {:?}", change);
                            sink.ingest(change.into_event());
                        }
                        None => {
                            warn!("Bridge client closed its change stream");
                            break;
                        }
                    },
                }
            }
            debug!("Bridge forwarding stopped");
        });

        Ok(Self { shutdown, task })
    }

    /// Whether changes are still being forwarded
    pub fn is_attached(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop forwarding and wait for the forwarding task to end.
    pub async fn detach(mut self) {
        self.shutdown.cancel();
        if let Err(e) = (&mut self.task).await {
            error!("Bridge forwarding task failed: {}", e);
        }
    }
}

impl Drop for BridgeAdapter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
