//! Device manager: wires the poller, the bridge adapter, the registry and the
//! command session together

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flashdeck_core::prelude::*;
use flashdeck_core::{
    ArgumentSet, Device, DeviceId, DeviceNotification, EventSink, OperationKind, Transport,
};
use flashdeck_daemon::{
    AdbCliBridge, BridgeAdapter, BridgeClient, DeviceCommand, FastbootPoller, PollerConfig,
    ProcessOutput, ProcessRunner, ToolAvailability, ToolPaths,
};

use crate::config::Settings;
use crate::registry::{DeviceListener, DeviceRegistry, ListenerId};
use crate::session::{CommandSession, SessionEvent};

/// Entry point for everything device related
pub struct DeviceManager {
    registry: Arc<DeviceRegistry>,
    session: CommandSession,
    runner: ProcessRunner,
    tools: ToolPaths,
    availability: ToolAvailability,
    bridge_interval: Duration,
    bridge_timeout: Duration,
    shutdown: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
    /// The adapter and the client it forwards from, kept alive together
    bridge: Mutex<Option<(BridgeAdapter, Arc<dyn BridgeClient>)>>,
}

impl DeviceManager {
    /// Resolve the tools and start polling for bootloader devices
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(settings: &Settings) -> Result<Self> {
        settings.validate()?;

        let availability = ToolAvailability::check(&settings.tools.overrides());
        for message in [
            availability.adb_unavailable_message(),
            availability.fastboot_unavailable_message(),
        ]
        .into_iter()
        .flatten()
        {
            warn!("{}", message);
        }
        let tools = availability.tool_paths();

        let runner = ProcessRunner::new(settings.process.grace_period());

        let session = CommandSession::new(runner.clone())
            .with_simple_timeout(settings.process.simple_timeout())
            .with_product_env_var(settings.product.env_var.clone());
        if let Some(dir) = &settings.product.out_dir {
            session.set_product_out(Some(dir.as_path()));
        }

        let command = match &settings.poller.command {
            Some(argv) => ArgumentSet::new(argv.iter().cloned())?,
            None => tools.enumerate_command()?,
        };
        let config = PollerConfig::new(command)
            .with_interval(settings.poller.interval())
            .with_timeout(settings.poller.timeout())
            .with_disconnect_after_misses(settings.poller.disconnect_after_misses);

        let registry = Arc::new(DeviceRegistry::new());
        let shutdown = CancellationToken::new();

        let sink: Arc<dyn EventSink> = registry.clone();
        let poller = FastbootPoller::new(config, runner.clone(), sink).spawn(shutdown.clone());

        info!("Device manager started");

        Ok(Self {
            registry,
            session,
            runner,
            tools,
            availability,
            bridge_interval: settings.poller.interval(),
            bridge_timeout: settings.poller.timeout(),
            shutdown,
            poller: Mutex::new(Some(poller)),
            bridge: Mutex::new(None),
        })
    }

    /// Start tracking bridge devices through `client`
    ///
    /// Fails with [`Error::BridgeUnavailable`] when the client is not
    /// connected; bootloader tracking keeps working either way.
    pub fn attach_bridge(&self, client: Arc<dyn BridgeClient>) -> Result<()> {
        let sink: Arc<dyn EventSink> = self.registry.clone();
        let adapter = BridgeAdapter::attach(client.clone(), sink)?;

        let mut bridge = self.bridge.lock().unwrap_or_else(|e| e.into_inner());
        if bridge.replace((adapter, client)).is_some() {
            debug!("Previous bridge adapter replaced");
        }
        Ok(())
    }

    /// Attach a bridge client that polls the resolved `adb`
    pub async fn attach_adb(&self) -> Result<()> {
        let adb = ArgumentSet::new([self.tools.adb.to_string_lossy().into_owned()])?;
        let client = AdbCliBridge::connect(
            adb,
            self.runner.clone(),
            self.bridge_interval,
            self.bridge_timeout,
        )
        .await;
        self.attach_bridge(client)
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn tool_availability(&self) -> &ToolAvailability {
        &self.availability
    }

    pub fn subscribe(&self, listener: Arc<dyn DeviceListener>) -> ListenerId {
        self.registry.subscribe(listener)
    }

    pub fn subscribe_channel(&self) -> (ListenerId, mpsc::UnboundedReceiver<DeviceNotification>) {
        self.registry.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Bridge devices currently connected
    pub fn devices(&self) -> Vec<Device> {
        self.registry.bridge_devices()
    }

    /// Serials of devices currently in bootloader mode
    pub fn fastboot_devices(&self) -> Vec<String> {
        self.registry.fastboot_serials()
    }

    /// Wait until a device is present, for at most `limit`
    pub async fn wait_for(&self, id: &DeviceId, limit: Duration) -> Result<Device> {
        // Subscribing replays the current devices, so a device that is
        // already present arrives first thing.
        let (listener, mut rx) = self.registry.subscribe_channel();

        let found = tokio::time::timeout(limit, async {
            while let Some(notification) = rx.recv().await {
                let is_match = matches!(
                    &notification,
                    DeviceNotification::DeviceConnected { .. }
                        | DeviceNotification::FastbootDeviceConnected { .. }
                ) && notification.transport() == id.transport
                    && notification.serial() == id.serial;
                if is_match {
                    return true;
                }
            }
            false
        })
        .await;

        self.registry.unsubscribe(listener);

        match (found, self.registry.get(id)) {
            (Ok(true), Some(device)) => Ok(device),
            _ => Err(Error::unknown_device(id.transport, id.serial.clone())),
        }
    }

    pub fn set_product_out(&self, dir: Option<&Path>) {
        self.session.set_product_out(dir);
    }

    fn device(&self, transport: Transport, serial: &str) -> Result<Device> {
        self.registry
            .get(&DeviceId::new(transport, serial))
            .ok_or_else(|| Error::unknown_device(transport, serial))
    }

    /// Flash the bootloader device `serial`; `wipe` erases userdata first
    pub fn flash(
        &self,
        serial: &str,
        wipe: bool,
        args: Vec<String>,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        let device = self.device(Transport::Bootloader, serial)?;
        let argv = DeviceCommand::Flash { wipe, args }.argv(&self.tools, serial)?;
        self.session.start(OperationKind::Flash, &device, argv)
    }

    /// Sync the whole system, or one partition, to the bridge device `serial`
    pub fn sync(
        &self,
        serial: &str,
        partition: Option<String>,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        let device = self.device(Transport::Bridge, serial)?;
        let argv = DeviceCommand::Sync { partition }.argv(&self.tools, serial)?;
        self.session.start(OperationKind::Sync, &device, argv)
    }

    pub fn stop_flash(&self) -> bool {
        self.session.stop(OperationKind::Flash)
    }

    pub fn stop_sync(&self) -> bool {
        self.session.stop(OperationKind::Sync)
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.session.is_running(kind)
    }

    async fn run_simple(&self, command: DeviceCommand, serial: &str) -> Result<ProcessOutput> {
        self.device(command.required_transport(), serial)?;
        let argv = command.argv(&self.tools, serial)?;
        info!("{} on {}", command.name(), serial);
        self.session.run_simple(argv).await
    }

    pub async fn adb_root(&self, serial: &str) -> Result<ProcessOutput> {
        self.run_simple(DeviceCommand::Root, serial).await
    }

    pub async fn adb_remount(&self, serial: &str) -> Result<ProcessOutput> {
        self.run_simple(DeviceCommand::Remount, serial).await
    }

    /// Reboot a bootloader device into the OS
    pub async fn reboot(&self, serial: &str) -> Result<ProcessOutput> {
        self.run_simple(DeviceCommand::Reboot, serial).await
    }

    /// Reboot a bridge device into the bootloader
    pub async fn reboot_bootloader(&self, serial: &str) -> Result<ProcessOutput> {
        self.run_simple(DeviceCommand::RebootBootloader, serial).await
    }

    /// Stop running operations, the poller and the bridge forwarding
    pub async fn shutdown(&self) {
        info!("Device manager shutting down");
        self.session.stop_all();
        self.shutdown.cancel();

        let poller = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(poller) = poller {
            if let Err(e) = poller.await {
                error!("Bootloader poller failed: {}", e);
            }
        }

        let bridge = self
            .bridge
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((adapter, _client)) = bridge {
            adapter.detach().await;
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
