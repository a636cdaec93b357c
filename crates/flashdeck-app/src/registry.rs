//! Device registry
//!
//! Single source of truth for which devices are present on which transport.
//! Adapters feed [`DeviceEvent`]s through [`EventSink::ingest`]; the registry
//! updates its map and notifies listeners in subscription order.
//!
//! Every mutation, replay and dispatch happens under one lock. Listeners are
//! therefore called with the lock held and must not call back into the
//! registry; use a [`ChannelListener`] to hand notifications to async code.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use flashdeck_core::prelude::*;
use flashdeck_core::{
    ChangeMask, Device, DeviceEvent, DeviceId, DeviceNotification, EventSink, Transport,
};

/// Receives device notifications
///
/// Every method defaults to doing nothing. A returned error is logged and
/// does not affect other listeners.
pub trait DeviceListener: Send + Sync {
    fn device_connected(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    fn device_disconnected(&self, _device: &Device) -> Result<()> {
        Ok(())
    }

    fn device_changed(&self, _device: &Device, _mask: ChangeMask) -> Result<()> {
        Ok(())
    }

    fn fastboot_device_connected(&self, _serial: &str) -> Result<()> {
        Ok(())
    }

    fn fastboot_device_disconnected(&self, _serial: &str) -> Result<()> {
        Ok(())
    }
}

/// Route a notification to the matching listener method
pub fn dispatch(listener: &dyn DeviceListener, notification: &DeviceNotification) -> Result<()> {
    match notification {
        DeviceNotification::DeviceConnected { device } => listener.device_connected(device),
        DeviceNotification::DeviceDisconnected { device } => listener.device_disconnected(device),
        DeviceNotification::DeviceChanged { device, mask } => {
            listener.device_changed(device, *mask)
        }
        DeviceNotification::FastbootDeviceConnected { serial } => {
            listener.fastboot_device_connected(serial)
        }
        DeviceNotification::FastbootDeviceDisconnected { serial } => {
            listener.fastboot_device_disconnected(serial)
        }
    }
}

/// Forwards notifications into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<DeviceNotification>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeviceNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notification: DeviceNotification) -> Result<()> {
        self.tx
            .send(notification)
            .map_err(|_| Error::ChannelClosed)
    }
}

impl DeviceListener for ChannelListener {
    fn device_connected(&self, device: &Device) -> Result<()> {
        self.send(DeviceNotification::DeviceConnected {
            device: device.clone(),
        })
    }

    fn device_disconnected(&self, device: &Device) -> Result<()> {
        self.send(DeviceNotification::DeviceDisconnected {
            device: device.clone(),
        })
    }

    fn device_changed(&self, device: &Device, mask: ChangeMask) -> Result<()> {
        self.send(DeviceNotification::DeviceChanged {
            device: device.clone(),
            mask,
        })
    }

    fn fastboot_device_connected(&self, serial: &str) -> Result<()> {
        self.send(DeviceNotification::FastbootDeviceConnected {
            serial: serial.to_string(),
        })
    }

    fn fastboot_device_disconnected(&self, serial: &str) -> Result<()> {
        self.send(DeviceNotification::FastbootDeviceDisconnected {
            serial: serial.to_string(),
        })
    }
}

/// Handle returned by [`DeviceRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Inner {
    devices: BTreeMap<DeviceId, Device>,
    listeners: Vec<(ListenerId, Arc<dyn DeviceListener>)>,
    next_id: u64,
}

impl Inner {
    fn notify(&self, notification: &DeviceNotification) {
        for (id, listener) in &self.listeners {
            deliver(*id, listener.as_ref(), notification);
        }
    }
}

/// Call one listener, containing both error returns and panics
fn deliver(id: ListenerId, listener: &dyn DeviceListener, notification: &DeviceNotification) {
    match catch_unwind(AssertUnwindSafe(|| dispatch(listener, notification))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            "Listener {:?} failed on {:?} for {}: {}",
            id,
            notification,
            notification.serial(),
            e
        ),
        Err(_) => error!(
            "Listener {:?} panicked on {:?} for {}",
            id,
            notification,
            notification.serial()
        ),
    }
}

/// Thread-safe device map with listener fan-out
#[derive(Default)]
pub struct DeviceRegistry {
    inner: Mutex<Inner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Listener panics are caught before they can poison the lock, so a
        // poisoned guard still holds a consistent map.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener and replay the current devices to it
    ///
    /// Bridge devices are replayed before bootloader devices. Registration
    /// and replay are atomic with respect to ingestion.
    pub fn subscribe(&self, listener: Arc<dyn DeviceListener>) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;

        for device in inner.devices.values() {
            deliver(id, listener.as_ref(), &DeviceNotification::connected(device));
        }

        debug!(
            "Listener {:?} subscribed, replayed {} device(s)",
            id,
            inner.devices.len()
        );
        inner.listeners.push((id, listener));
        id
    }

    /// Subscribe a new [`ChannelListener`] and return its receiving end
    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<DeviceNotification>) {
        let (listener, rx) = ChannelListener::new();
        (self.subscribe(Arc::new(listener)), rx)
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        before != inner.listeners.len()
    }

    /// Apply an event and notify listeners
    ///
    /// Returns the notification that was delivered, or `None` when the event
    /// was redundant.
    pub fn apply(&self, event: DeviceEvent) -> Option<DeviceNotification> {
        let mut inner = self.lock();

        let notification = match event {
            DeviceEvent::Connected(device) => {
                let id = device.id();
                match inner.devices.get_mut(&id) {
                    Some(existing) => {
                        // A repeated connect only notifies what it changed
                        let mut mask = ChangeMask::NONE;
                        if existing.online_state != device.online_state {
                            mask = mask | ChangeMask::STATE;
                        }
                        if existing.model != device.model {
                            mask = mask | ChangeMask::BUILD_INFO;
                        }
                        *existing = device.clone();

                        if mask.is_empty() || device.transport == Transport::Bootloader {
                            trace!("{} already known", id);
                            None
                        } else {
                            debug!("{} reconnected with changes ({:#x})", id, mask.bits());
                            Some(DeviceNotification::DeviceChanged { device, mask })
                        }
                    }
                    None => {
                        info!("Device connected: {}", id);
                        let notification = DeviceNotification::connected(&device);
                        inner.devices.insert(id, device);
                        Some(notification)
                    }
                }
            }
            DeviceEvent::Disconnected { transport, serial } => {
                let id = DeviceId::new(transport, serial);
                match inner.devices.remove(&id) {
                    Some(device) => {
                        info!("Device disconnected: {}", id);
                        Some(DeviceNotification::disconnected(&device))
                    }
                    None => {
                        trace!("Disconnect for unknown {}, ignored", id);
                        None
                    }
                }
            }
            DeviceEvent::Changed { device, mask } => {
                if device.transport == Transport::Bootloader {
                    warn!(
                        "Ignoring change for bootloader device {}; bootloader devices carry no change bits",
                        device.serial
                    );
                    return None;
                }

                let id = device.id();
                if inner.devices.contains_key(&id) {
                    debug!("Device changed: {} ({:#x})", id, mask.bits());
                    inner.devices.insert(id, device.clone());
                    Some(DeviceNotification::DeviceChanged { device, mask })
                } else {
                    info!("Device connected (first seen through a change): {}", id);
                    let notification = DeviceNotification::connected(&device);
                    inner.devices.insert(id, device);
                    Some(notification)
                }
            }
        };

        if let Some(notification) = &notification {
            inner.notify(notification);
        }
        notification
    }

    /// Every device, bridge devices first
    pub fn snapshot(&self) -> Vec<Device> {
        self.lock().devices.values().cloned().collect()
    }

    pub fn bridge_devices(&self) -> Vec<Device> {
        self.devices_on(Transport::Bridge)
    }

    pub fn fastboot_serials(&self) -> Vec<String> {
        self.devices_on(Transport::Bootloader)
            .into_iter()
            .map(|device| device.serial)
            .collect()
    }

    fn devices_on(&self, transport: Transport) -> Vec<Device> {
        self.lock()
            .devices
            .values()
            .filter(|device| device.transport == transport)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.lock().devices.get(id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.lock().devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl EventSink for DeviceRegistry {
    fn ingest(&self, event: DeviceEvent) {
        self.apply(event);
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("DeviceRegistry")
            .field("devices", &inner.devices.keys().collect::<Vec<_>>())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashdeck_core::OnlineState;

    /// Records every notification it receives
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<DeviceNotification>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<DeviceNotification> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }

        fn push(&self, notification: DeviceNotification) -> Result<()> {
            self.seen.lock().unwrap().push(notification);
            Ok(())
        }
    }

    impl DeviceListener for Recorder {
        fn device_connected(&self, device: &Device) -> Result<()> {
            self.push(DeviceNotification::DeviceConnected {
                device: device.clone(),
            })
        }

        fn device_disconnected(&self, device: &Device) -> Result<()> {
            self.push(DeviceNotification::DeviceDisconnected {
                device: device.clone(),
            })
        }

        fn device_changed(&self, device: &Device, mask: ChangeMask) -> Result<()> {
            self.push(DeviceNotification::DeviceChanged {
                device: device.clone(),
                mask,
            })
        }

        fn fastboot_device_connected(&self, serial: &str) -> Result<()> {
            self.push(DeviceNotification::FastbootDeviceConnected {
                serial: serial.to_string(),
            })
        }

        fn fastboot_device_disconnected(&self, serial: &str) -> Result<()> {
            self.push(DeviceNotification::FastbootDeviceDisconnected {
                serial: serial.to_string(),
            })
        }
    }

    struct Failing;

    impl DeviceListener for Failing {
        fn device_connected(&self, _device: &Device) -> Result<()> {
            Err(Error::ChannelClosed)
        }

        fn fastboot_device_connected(&self, _serial: &str) -> Result<()> {
            Err(Error::ChannelClosed)
        }
    }

    struct Panicking;

    impl DeviceListener for Panicking {
        fn device_connected(&self, _device: &Device) -> Result<()> {
            panic!("listener bug");
        }
    }

    fn connected(device: Device) -> DeviceEvent {
        DeviceEvent::Connected(device)
    }

    #[test]
    fn test_late_subscriber_gets_current_devices_only() {
        let registry = DeviceRegistry::new();
        registry.ingest(connected(Device::bridge("A")));
        registry.ingest(connected(Device::bridge("B")));
        registry.ingest(DeviceEvent::disconnected(Transport::Bridge, "A"));

        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        assert_eq!(
            recorder.take(),
            vec![DeviceNotification::DeviceConnected {
                device: Device::bridge("B")
            }]
        );
    }

    #[test]
    fn test_replay_orders_bridge_before_bootloader() {
        let registry = DeviceRegistry::new();
        registry.ingest(connected(Device::bootloader("AAA")));
        registry.ingest(connected(Device::bridge("ZZZ")));

        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        assert_eq!(
            recorder.take(),
            vec![
                DeviceNotification::DeviceConnected {
                    device: Device::bridge("ZZZ")
                },
                DeviceNotification::FastbootDeviceConnected {
                    serial: "AAA".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_same_serial_on_both_transports() {
        let registry = DeviceRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        registry.ingest(connected(Device::bridge("ABC123")));
        registry.ingest(connected(Device::bootloader("ABC123")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.bridge_devices(), vec![Device::bridge("ABC123")]);
        assert_eq!(registry.fastboot_serials(), vec!["ABC123".to_string()]);
        assert_eq!(recorder.take().len(), 2);

        registry.ingest(DeviceEvent::disconnected(Transport::Bootloader, "ABC123"));
        assert!(registry.contains(&DeviceId::bridge("ABC123")));
        assert!(!registry.contains(&DeviceId::bootloader("ABC123")));
    }

    #[test]
    fn test_redundant_events_not_forwarded() {
        let registry = DeviceRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        assert!(registry.apply(connected(Device::bridge("A"))).is_some());
        assert!(registry.apply(connected(Device::bridge("A"))).is_none());
        assert!(registry
            .apply(DeviceEvent::disconnected(Transport::Bridge, "unknown"))
            .is_none());

        assert_eq!(recorder.take().len(), 1);
    }

    #[test]
    fn test_duplicate_connect_with_new_state_notifies_change() {
        let registry = DeviceRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        registry.ingest(connected(Device::bridge("A")));
        let offline = Device::bridge("A").with_state(OnlineState::Offline);
        registry.ingest(connected(offline.clone()));

        let device = registry.get(&DeviceId::bridge("A")).unwrap();
        assert_eq!(device.online_state, OnlineState::Offline);
        assert_eq!(
            recorder.take(),
            vec![
                DeviceNotification::DeviceConnected {
                    device: Device::bridge("A")
                },
                DeviceNotification::DeviceChanged {
                    device: offline,
                    mask: ChangeMask::STATE
                },
            ]
        );

        // Same state and model again: nothing to tell
        registry.ingest(connected(
            Device::bridge("A").with_state(OnlineState::Offline),
        ));
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_duplicate_connect_with_model_notifies_build_info() {
        let registry = DeviceRegistry::new();
        registry.ingest(connected(Device::bridge("A")));

        let notification = registry.apply(connected(Device::bridge("A").with_model("Pixel 8")));
        assert_eq!(
            notification,
            Some(DeviceNotification::DeviceChanged {
                device: Device::bridge("A").with_model("Pixel 8"),
                mask: ChangeMask::BUILD_INFO
            })
        );
    }

    #[test]
    fn test_changed_for_known_and_unknown_device() {
        let registry = DeviceRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        let device = Device::bridge("A").with_model("Pixel 8");
        registry.ingest(DeviceEvent::Changed {
            device: device.clone(),
            mask: ChangeMask::BUILD_INFO,
        });
        registry.ingest(DeviceEvent::Changed {
            device: device.clone(),
            mask: ChangeMask::STATE,
        });

        assert_eq!(
            recorder.take(),
            vec![
                DeviceNotification::DeviceConnected {
                    device: device.clone()
                },
                DeviceNotification::DeviceChanged {
                    device,
                    mask: ChangeMask::STATE
                },
            ]
        );
    }

    #[test]
    fn test_changed_for_bootloader_ignored() {
        let registry = DeviceRegistry::new();
        registry.ingest(connected(Device::bootloader("X")));
        assert!(registry
            .apply(DeviceEvent::Changed {
                device: Device::bootloader("X"),
                mask: ChangeMask::STATE,
            })
            .is_none());
    }

    #[test]
    fn test_listeners_notified_in_subscription_order() {
        let registry = DeviceRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl DeviceListener for Tagged {
            fn fastboot_device_connected(&self, _serial: &str) -> Result<()> {
                self.1.lock().unwrap().push(self.0);
                Ok(())
            }
        }

        registry.subscribe(Arc::new(Tagged("first", order.clone())));
        registry.subscribe(Arc::new(Tagged("second", order.clone())));
        registry.subscribe(Arc::new(Tagged("third", order.clone())));

        registry.ingest(connected(Device::bootloader("X")));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_and_panicking_listeners_isolated() {
        let registry = DeviceRegistry::new();
        registry.subscribe(Arc::new(Failing));
        registry.subscribe(Arc::new(Panicking));
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        registry.ingest(connected(Device::bridge("A")));
        registry.ingest(connected(Device::bootloader("B")));

        assert_eq!(recorder.take().len(), 2);
        assert_eq!(registry.len(), 2);

        // Still usable after a listener panicked under the lock
        registry.ingest(DeviceEvent::disconnected(Transport::Bridge, "A"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_panicking_listener_during_replay() {
        let registry = DeviceRegistry::new();
        registry.ingest(connected(Device::bridge("A")));

        registry.subscribe(Arc::new(Panicking));
        assert_eq!(registry.listener_count(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = DeviceRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let id = registry.subscribe(recorder.clone());

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));

        registry.ingest(connected(Device::bridge("A")));
        assert!(recorder.take().is_empty());
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let registry = DeviceRegistry::new();
        registry.ingest(connected(Device::bootloader("X")));

        let (_id, mut rx) = registry.subscribe_channel();
        registry.ingest(DeviceEvent::disconnected(Transport::Bootloader, "X"));

        assert_eq!(
            rx.recv().await,
            Some(DeviceNotification::FastbootDeviceConnected {
                serial: "X".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(DeviceNotification::FastbootDeviceDisconnected {
                serial: "X".to_string()
            })
        );
    }

    #[test]
    fn test_closed_channel_listener_reports_error() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);
        assert!(matches!(
            listener.fastboot_device_connected("X"),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn test_concurrent_ingest_and_subscribe_is_consistent() {
        let registry = Arc::new(DeviceRegistry::new());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let serial = format!("dev-{}-{}", t, i % 5);
                        registry.ingest(connected(Device::bootloader(serial.clone())));
                        if i % 2 == 0 {
                            registry.ingest(DeviceEvent::disconnected(
                                Transport::Bootloader,
                                serial,
                            ));
                        }
                    }
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(1));
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());

        for writer in writers {
            writer.join().unwrap();
        }

        // Replaying what the listener saw must reproduce the final map:
        // nothing dropped, nothing delivered twice.
        let mut present = std::collections::BTreeSet::new();
        for notification in recorder.take() {
            match notification {
                DeviceNotification::FastbootDeviceConnected { serial } => {
                    assert!(present.insert(serial), "duplicate connect");
                }
                DeviceNotification::FastbootDeviceDisconnected { serial } => {
                    assert!(present.remove(&serial), "disconnect without connect");
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        let expected: std::collections::BTreeSet<_> =
            registry.fastboot_serials().into_iter().collect();
        assert_eq!(present, expected);
    }
}
