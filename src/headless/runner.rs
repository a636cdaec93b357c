//! Headless runner - event loops behind each CLI subcommand
//!
//! Subscribes to the device manager and turns notifications and operation
//! output into [`HeadlessEvent`]s.

use std::future::Future;
use std::time::Duration;

use flashdeck_app::{DeviceManager, ProcessOutput, SessionEvent};
use flashdeck_core::prelude::*;
use flashdeck_core::{DeviceId, OperationKind};
use tokio::sync::mpsc;

use super::HeadlessEvent;

/// Resolves on the first Ctrl-C; never resolves if the handler cannot be
/// installed
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Print device notifications until `interrupt` resolves
pub async fn watch(manager: &DeviceManager, interrupt: impl Future<Output = ()>) -> Result<()> {
    // Subscribing replays the devices already known, so the stream starts
    // with the current state.
    let (listener, mut rx) = manager.subscribe_channel();
    info!("Watching devices");

    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("Interrupted, stopping watch");
                break;
            }
            notification = rx.recv() => match notification {
                Some(notification) => HeadlessEvent::from(&notification).emit(),
                None => break,
            },
        }
    }

    manager.unsubscribe(listener);
    Ok(())
}

/// Give discovery `settle` to report, then print one snapshot
pub async fn list_devices(manager: &DeviceManager, settle: Duration) {
    tokio::time::sleep(settle).await;
    HeadlessEvent::device_list(&manager.devices(), manager.fastboot_devices()).emit();
}

/// Wait for the target device, then stream a flash or sync operation
///
/// Returns whether the operation completed successfully. When `interrupt`
/// resolves the operation is stopped; the stopped operation still reports its
/// completion.
pub async fn run_operation(
    manager: &DeviceManager,
    kind: OperationKind,
    serial: &str,
    wait: Duration,
    interrupt: impl Future<Output = ()>,
    start: impl FnOnce(&DeviceManager) -> Result<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Result<bool> {
    let id = DeviceId::new(kind.required_transport(), serial);
    manager.wait_for(&id, wait).await?;

    let mut rx = start(manager)?;
    HeadlessEvent::operation_started(kind, serial).emit();

    // Created once so an interrupt arriving while an event is emitted is
    // still seen on the next iteration.
    tokio::pin!(interrupt);
    let mut success = false;
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = &mut interrupt, if !interrupted => {
                warn!("Interrupted, stopping {}", kind);
                interrupted = true;
                match kind {
                    OperationKind::Flash => manager.stop_flash(),
                    OperationKind::Sync => manager.stop_sync(),
                };
            }
            event = rx.recv() => match event {
                Some(event) => {
                    if let SessionEvent::Completed { success: ok, .. } = &event {
                        success = *ok;
                    }
                    HeadlessEvent::from_session(kind, &event).emit();
                }
                None => break,
            },
        }
    }

    Ok(success)
}

/// Wait for the target device, then run a one-shot command and print its
/// result
///
/// Returns whether the command exited with status 0.
pub async fn run_command(
    manager: &DeviceManager,
    name: &str,
    id: DeviceId,
    wait: Duration,
    command: impl Future<Output = Result<ProcessOutput>>,
) -> Result<bool> {
    manager.wait_for(&id, wait).await?;

    let output = command.await?;
    let success = output.success();
    HeadlessEvent::command_result(name, &id.serial, output).emit();
    Ok(success)
}
