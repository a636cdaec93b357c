//! Bridge client backed by the `adb` executable
//!
//! Periodically runs `adb devices -l`, keeps the last device list and
//! broadcasts additions, removals and state changes to subscribers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use flashdeck_core::prelude::*;
use flashdeck_core::{ArgumentSet, ChangeMask, CommandSpec};

use crate::bridge::{BridgeChange, BridgeClient, BridgeDevice, BridgeDeviceState};
use crate::process::ProcessRunner;

/// Parse `adb devices -l` output
///
/// Device lines look like
/// `emulator-5554  device product:sdk model:Android_SDK device:generic`.
pub fn parse_devices<S: AsRef<str>>(lines: &[S]) -> Vec<BridgeDevice> {
    lines
        .iter()
        .map(|line| line.as_ref().trim())
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with("List of devices")
                && !line.starts_with('*')
                && !line.starts_with("adb server")
        })
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = BridgeDeviceState::parse(fields.next()?);

            let model = fields
                .find_map(|field| field.strip_prefix("model:"))
                .map(|model| model.replace('_', " "));

            let device = BridgeDevice::new(serial, state);
            Some(match model {
                Some(model) => device.with_model(model),
                None => device,
            })
        })
        .collect()
}

#[derive(Default)]
struct Shared {
    devices: BTreeMap<String, BridgeDevice>,
    subscribers: Vec<mpsc::UnboundedSender<BridgeChange>>,
}

/// [`BridgeClient`] that polls `adb devices -l`
pub struct AdbCliBridge {
    argv: ArgumentSet,
    runner: ProcessRunner,
    timeout: Duration,
    connected: AtomicBool,
    shared: Mutex<Shared>,
    shutdown: CancellationToken,
}

impl AdbCliBridge {
    /// Run the first listing and start polling every `interval`
    ///
    /// The first listing decides [`BridgeClient::is_connected`]; a failure is
    /// not an error here, the adapter reports it when attaching.
    pub async fn connect(
        adb: ArgumentSet,
        runner: ProcessRunner,
        interval: Duration,
        timeout: Duration,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            argv: adb.extend(["devices", "-l"]),
            runner,
            timeout,
            connected: AtomicBool::new(false),
            shared: Mutex::new(Shared::default()),
            shutdown: CancellationToken::new(),
        });

        let connected = bridge.refresh().await;
        bridge.connected.store(connected, Ordering::SeqCst);

        if connected {
            // The task holds a weak reference so dropping the bridge stops it.
            let weak = Arc::downgrade(&bridge);
            let shutdown = bridge.shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(bridge) = weak.upgrade() else { break };
                            let ok = bridge.refresh().await;
                            bridge.connected.store(ok, Ordering::SeqCst);
                        }
                    }
                }
                debug!("adb polling stopped");
            });
        } else {
            warn!("'{}' failed, no bridge server available", bridge.argv);
        }

        bridge
    }

    /// Stop polling
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one listing and broadcast the differences; returns whether the
    /// listing succeeded
    ///
    /// A failed listing counts as an empty one, so every known device is
    /// reported removed.
    async fn refresh(&self) -> bool {
        let spec = CommandSpec::new(self.argv.clone());
        let (ok, devices) = match self.runner.run_blocking(&spec, Some(self.timeout)).await {
            Ok(output) if output.success() => (true, parse_devices(&output.stdout_lines)),
            Ok(output) => {
                debug!(
                    "'{}' exited with {:?}, treating as no devices",
                    self.argv, output.exit_code
                );
                (false, Vec::new())
            }
            Err(e) => {
                debug!("'{}' failed, treating as no devices: {}", self.argv, e);
                (false, Vec::new())
            }
        };

        let mut shared = self.lock();
        let current: BTreeMap<String, BridgeDevice> = devices
            .into_iter()
            .map(|device| (device.serial.clone(), device))
            .collect();

        let mut changes = Vec::new();
        for (serial, previous) in &shared.devices {
            match current.get(serial) {
                None => changes.push(BridgeChange::Removed(previous.clone())),
                Some(device) if device != previous => {
                    let mut mask = ChangeMask::NONE;
                    if device.state != previous.state {
                        mask = mask | ChangeMask::STATE;
                    }
                    if device.model != previous.model {
                        mask = mask | ChangeMask::BUILD_INFO;
                    }
                    changes.push(BridgeChange::Changed(device.clone(), mask));
                }
                Some(_) => {}
            }
        }
        for (serial, device) in &current {
            if !shared.devices.contains_key(serial) {
                changes.push(BridgeChange::Added(device.clone()));
            }
        }

        shared.devices = current;
        for change in changes {
            shared
                .subscribers
                .retain(|tx| tx.send(change.clone()).is_ok());
        }

        ok
    }
}

impl BridgeClient for AdbCliBridge {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn devices(&self) -> Vec<BridgeDevice> {
        self.lock().devices.values().cloned().collect()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<BridgeChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}

impl Drop for AdbCliBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
