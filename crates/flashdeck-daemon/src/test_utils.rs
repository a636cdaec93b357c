//! Test utilities for daemon types
//!
//! Provides an in-memory [`BridgeClient`] and helpers for creating test
//! devices.

use std::sync::Mutex;

use tokio::sync::mpsc;

use flashdeck_core::{ChangeMask, Device, Transport};

use crate::bridge::{BridgeChange, BridgeClient, BridgeDevice, BridgeDeviceState};

/// Creates a test device on the given transport.
///
/// # Arguments
/// * `transport` - Transport the device is reachable through
/// * `serial` - Device serial
pub fn test_device(transport: Transport, serial: &str) -> Device {
    match transport {
        Transport::Bridge => Device::bridge(serial),
        Transport::Bootloader => Device::bootloader(serial),
    }
}

/// Creates an online bridge device as the bridge client reports it.
pub fn test_bridge_device(serial: &str) -> BridgeDevice {
    BridgeDevice::new(serial, BridgeDeviceState::Online)
}

/// Bridge client driven by the test
///
/// Changes pushed through [`FakeBridge::add`], [`FakeBridge::remove`] and
/// [`FakeBridge::change`] update the device list and are broadcast to every
/// subscriber.
#[derive(Debug, Default)]
pub struct FakeBridge {
    connected: bool,
    devices: Mutex<Vec<BridgeDevice>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BridgeChange>>>,
}

impl FakeBridge {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Default::default()
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<BridgeDevice>) -> Self {
        Self {
            connected: true,
            devices: Mutex::new(devices),
            ..Default::default()
        }
    }

    pub fn add(&self, device: BridgeDevice) {
        self.devices.lock().unwrap().push(device.clone());
        self.broadcast(BridgeChange::Added(device));
    }

    pub fn remove(&self, serial: &str) {
        let removed = {
            let mut devices = self.devices.lock().unwrap();
            let index = devices.iter().position(|d| d.serial == serial);
            index.map(|i| devices.remove(i))
        };
        let device = removed.unwrap_or_else(|| test_bridge_device(serial));
        self.broadcast(BridgeChange::Removed(device));
    }

    pub fn change(&self, device: BridgeDevice, mask: ChangeMask) {
        {
            let mut devices = self.devices.lock().unwrap();
            match devices.iter_mut().find(|d| d.serial == device.serial) {
                Some(existing) => *existing = device.clone(),
                None => devices.push(device.clone()),
            }
        }
        self.broadcast(BridgeChange::Changed(device, mask));
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn broadcast(&self, change: BridgeChange) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

impl BridgeClient for FakeBridge {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn devices(&self) -> Vec<BridgeDevice> {
        self.devices.lock().unwrap().clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BridgeChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_per_transport() {
        let device = test_device(Transport::Bootloader, "ABC");
        assert_eq!(device.transport, Transport::Bootloader);
        assert_eq!(device.serial, "ABC");
    }

    #[test]
    fn test_fake_bridge_tracks_devices() {
        let bridge = FakeBridge::connected();
        let mut rx = bridge.subscribe();

        bridge.add(test_bridge_device("A"));
        bridge.add(test_bridge_device("B"));
        bridge.remove("A");

        assert_eq!(bridge.devices(), vec![test_bridge_device("B")]);
        assert_eq!(
            rx.try_recv().unwrap(),
            BridgeChange::Added(test_bridge_device("A"))
        );
        assert_eq!(bridge.subscriber_count(), 1);

        drop(rx);
        assert_eq!(bridge.subscriber_count(), 0);
    }
}
