//! Long-running device operations
//!
//! [`CommandSession`] runs at most one flash and one sync at a time, streams
//! their output as [`SessionEvent`]s and reports a single
//! [`SessionEvent::Completed`] per operation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use flashdeck_core::prelude::*;
use flashdeck_core::{ArgumentSet, CommandSpec, Device, OperationKind, ProcessEvent, ProcessExit};
use flashdeck_daemon::{CancelHandle, ProcessOutput, ProcessRunner};

/// Default limit for root/remount/reboot
pub const DEFAULT_SIMPLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default variable carrying the product output directory
pub const DEFAULT_PRODUCT_ENV_VAR: &str = "ANDROID_PRODUCT_OUT";

/// Progress of one long-running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A stdout line
    Output(String),
    /// A stderr line or a failure description
    Error(String),
    /// Always last, exactly once; `success` is false for non-zero exits and
    /// for every stopped operation
    Completed { success: bool, exit: ProcessExit },
}

struct ActiveOperation {
    id: u64,
    serial: String,
    handle: CancelHandle,
    /// Set by stop/replace; read by the forwarder under the table lock
    stopped: CancellationToken,
}

type ActiveTable = Arc<Mutex<HashMap<OperationKind, ActiveOperation>>>;

fn lock_table(table: &ActiveTable) -> MutexGuard<'_, HashMap<OperationKind, ActiveOperation>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
struct ProductEnv {
    out_dir: Option<PathBuf>,
    env_var: String,
}

/// Runs device commands, enforcing one active operation per kind
pub struct CommandSession {
    runner: ProcessRunner,
    simple_timeout: Duration,
    product: Mutex<ProductEnv>,
    active: ActiveTable,
    next_id: AtomicU64,
}

impl Default for CommandSession {
    fn default() -> Self {
        Self::new(ProcessRunner::default())
    }
}

impl CommandSession {
    pub fn new(runner: ProcessRunner) -> Self {
        Self {
            runner,
            simple_timeout: DEFAULT_SIMPLE_TIMEOUT,
            product: Mutex::new(ProductEnv {
                out_dir: None,
                env_var: DEFAULT_PRODUCT_ENV_VAR.to_string(),
            }),
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_simple_timeout(mut self, timeout: Duration) -> Self {
        self.simple_timeout = timeout;
        self
    }

    pub fn with_product_env_var(self, name: impl Into<String>) -> Self {
        self.lock_product().env_var = name.into();
        self
    }

    fn lock_product(&self) -> MutexGuard<'_, ProductEnv> {
        self.product.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Directory every later command runs in, also exported through the
    /// product variable. `None` clears it.
    pub fn set_product_out(&self, dir: Option<&Path>) {
        let mut product = self.lock_product();
        match dir {
            Some(dir) => info!("Product output directory: {}", dir.display()),
            None => info!("Product output directory cleared"),
        }
        product.out_dir = dir.map(Path::to_path_buf);
    }

    pub fn product_out(&self) -> Option<PathBuf> {
        self.lock_product().out_dir.clone()
    }

    fn command_spec(&self, argv: ArgumentSet) -> CommandSpec {
        let product = self.lock_product().clone();
        let spec = CommandSpec::new(argv);
        match product.out_dir {
            Some(dir) => spec
                .current_dir(&dir)
                .env(product.env_var, dir.to_string_lossy()),
            None => spec,
        }
    }

    /// Start a long-running operation on `device`
    ///
    /// Fails with [`Error::AlreadyRunning`] if an operation of the same kind
    /// is active and with [`Error::WrongTransport`] if `device` is not on the
    /// transport the kind requires. Must be called from within a tokio
    /// runtime.
    pub fn start(
        &self,
        kind: OperationKind,
        device: &Device,
        argv: ArgumentSet,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        check_transport(kind, device)?;

        let mut active = lock_table(&self.active);
        if active.contains_key(&kind) {
            warn!("Rejected {} on {}: already running", kind, device.serial);
            return Err(Error::already_running(kind));
        }

        Ok(self.launch(&mut active, kind, device, argv))
    }

    /// Stop the active operation of `kind`, if any, and start a new one
    pub fn replace(
        &self,
        kind: OperationKind,
        device: &Device,
        argv: ArgumentSet,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        check_transport(kind, device)?;

        let mut active = lock_table(&self.active);
        if let Some(previous) = active.remove(&kind) {
            info!(
                "Replacing {} on {} with a new one on {}",
                kind, previous.serial, device.serial
            );
            previous.stopped.cancel();
            previous.handle.cancel();
        }

        Ok(self.launch(&mut active, kind, device, argv))
    }

    fn launch(
        &self,
        active: &mut HashMap<OperationKind, ActiveOperation>,
        kind: OperationKind,
        device: &Device,
        argv: ArgumentSet,
    ) -> mpsc::UnboundedReceiver<SessionEvent> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let spec = self.command_spec(argv);

        info!("Starting {} #{} on {}: {}", kind, id, device.serial, spec.argv);

        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let handle = self.runner.run_streaming(&spec, process_tx);
        let stopped = CancellationToken::new();

        active.insert(
            kind,
            ActiveOperation {
                id,
                serial: device.serial.clone(),
                handle,
                stopped: stopped.clone(),
            },
        );

        tokio::spawn(forward(
            process_rx,
            session_tx,
            self.active.clone(),
            kind,
            id,
            stopped,
        ));

        session_rx
    }

    /// Stop the active operation of `kind`
    ///
    /// Returns `false` (and does nothing) if none is active. Otherwise the
    /// operation's receiver gets exactly one `Completed { success: false }`.
    pub fn stop(&self, kind: OperationKind) -> bool {
        let active = lock_table(&self.active);
        match active.get(&kind) {
            Some(operation) => {
                info!("Stopping {} on {}", kind, operation.serial);
                operation.stopped.cancel();
                operation.handle.cancel();
                true
            }
            None => {
                debug!("Stop {}: nothing running", kind);
                false
            }
        }
    }

    /// Stop every active operation
    pub fn stop_all(&self) {
        let active = lock_table(&self.active);
        for (kind, operation) in active.iter() {
            info!("Stopping {} on {}", kind, operation.serial);
            operation.stopped.cancel();
            operation.handle.cancel();
        }
    }

    pub fn is_running(&self, kind: OperationKind) -> bool {
        lock_table(&self.active).contains_key(&kind)
    }

    /// Serial of the device the active operation of `kind` targets
    pub fn active_serial(&self, kind: OperationKind) -> Option<String> {
        lock_table(&self.active)
            .get(&kind)
            .map(|operation| operation.serial.clone())
    }

    /// Run a short command to completion (root, remount, reboot)
    pub async fn run_simple(&self, argv: ArgumentSet) -> Result<ProcessOutput> {
        let spec = self.command_spec(argv);
        let output = self
            .runner
            .run_blocking(&spec, Some(self.simple_timeout))
            .await?;

        if !output.success() {
            warn!(
                "'{}' exited with {:?}: {}",
                spec.argv,
                output.exit_code,
                output.stderr_lines.join(" ")
            );
        }

        Ok(output)
    }
}

fn check_transport(kind: OperationKind, device: &Device) -> Result<()> {
    let expected = kind.required_transport();
    if device.transport == expected {
        Ok(())
    } else {
        Err(Error::WrongTransport {
            kind,
            serial: device.serial.clone(),
            expected,
            found: device.transport,
        })
    }
}

/// Translate process events into session events and retire the operation
async fn forward(
    mut process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    active: ActiveTable,
    kind: OperationKind,
    id: u64,
    stopped: CancellationToken,
) {
    // Keep draining after the receiver is gone so the entry is still retired.
    while let Some(event) = process_rx.recv().await {
        match event {
            ProcessEvent::Stdout(line) => {
                let _ = session_tx.send(SessionEvent::Output(line));
            }
            ProcessEvent::Stderr(line) => {
                let _ = session_tx.send(SessionEvent::Error(line));
            }
            ProcessEvent::Exited(exit) => {
                let success = {
                    let mut table = lock_table(&active);
                    if table.get(&kind).is_some_and(|operation| operation.id == id) {
                        table.remove(&kind);
                    }
                    // Read under the lock so a concurrent stop is either fully
                    // before this point or finds the entry gone.
                    exit.is_success() && !stopped.is_cancelled()
                };

                if success {
                    info!("{} #{} completed", kind, id);
                } else {
                    info!("{} #{} failed: {:?}", kind, id, exit);
                }

                let _ = session_tx.send(SessionEvent::Completed { success, exit });
                return;
            }
        }
    }

    // The runner always sends Exited before dropping its sender.
    error!("{} #{} ended without an exit event", kind, id);
    let mut table = lock_table(&active);
    if table.get(&kind).is_some_and(|operation| operation.id == id) {
        table.remove(&kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh(script: &str) -> ArgumentSet {
        ArgumentSet::new(["sh", "-c", script]).unwrap()
    }

    fn flash_device() -> Device {
        Device::bootloader("ABC123")
    }

    fn sync_device() -> Device {
        Device::bridge("ABC123")
    }

    /// Drain a session receiver until it closes
    async fn drain(mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            match timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => return events,
                Err(_) => panic!("session did not finish: {:?}", events),
            }
        }
    }

    fn completions(events: &[SessionEvent]) -> Vec<(bool, ProcessExit)> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Completed { success, exit } => Some((*success, *exit)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_flash() {
        let session = CommandSession::default();
        let rx = session
            .start(
                OperationKind::Flash,
                &flash_device(),
                sh("echo 'writing system'; echo 'OKAY' >&2"),
            )
            .unwrap();

        let events = drain(rx).await;
        assert!(events.contains(&SessionEvent::Output("writing system".to_string())));
        assert!(events.contains(&SessionEvent::Error("OKAY".to_string())));
        assert_eq!(
            events.last(),
            Some(&SessionEvent::Completed {
                success: true,
                exit: ProcessExit::Code(0)
            })
        );
        assert!(!session.is_running(OperationKind::Flash));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let session = CommandSession::default();
        let rx = session
            .start(OperationKind::Sync, &sync_device(), sh("exit 1"))
            .unwrap();

        assert_eq!(completions(&drain(rx).await), vec![(false, ProcessExit::Code(1))]);
    }

    #[tokio::test]
    async fn test_second_flash_rejected_sync_allowed() {
        let session = CommandSession::default();
        let _flash = session
            .start(OperationKind::Flash, &flash_device(), sh("exec sleep 30"))
            .unwrap();

        let second = session.start(OperationKind::Flash, &flash_device(), sh("true"));
        assert!(matches!(
            second,
            Err(Error::AlreadyRunning {
                kind: OperationKind::Flash
            })
        ));

        let sync = session.start(OperationKind::Sync, &sync_device(), sh("exit 0"));
        assert!(sync.is_ok());
        assert!(session.is_running(OperationKind::Flash));
        assert_eq!(
            session.active_serial(OperationKind::Flash).as_deref(),
            Some("ABC123")
        );

        session.stop_all();
    }

    #[tokio::test]
    async fn test_stop_yields_single_failed_completion() {
        let session = CommandSession::default();
        let rx = session
            .start(
                OperationKind::Flash,
                &flash_device(),
                sh("echo started; exec sleep 30"),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(session.stop(OperationKind::Flash));

        let events = drain(rx).await;
        assert_eq!(
            completions(&events),
            vec![(false, ProcessExit::Cancelled)]
        );
        assert!(!session.is_running(OperationKind::Flash));
    }

    #[tokio::test]
    async fn test_stop_immediately_after_start() {
        let session = CommandSession::default();
        let rx = session
            .start(OperationKind::Sync, &sync_device(), sh("exec sleep 30"))
            .unwrap();
        assert!(session.stop(OperationKind::Sync));
        session.stop(OperationKind::Sync);

        let events = drain(rx).await;
        let done = completions(&events);
        assert_eq!(done.len(), 1);
        assert!(!done[0].0);
    }

    #[tokio::test]
    async fn test_stop_racing_natural_exit() {
        let session = CommandSession::default();
        for _ in 0..20 {
            let rx = session
                .start(OperationKind::Flash, &flash_device(), sh("exit 0"))
                .unwrap();
            let stopped = session.stop(OperationKind::Flash);

            let done = completions(&drain(rx).await);
            assert_eq!(done.len(), 1);
            if stopped {
                assert!(!done[0].0, "stopped operation reported success");
            }
        }
    }

    #[tokio::test]
    async fn test_stop_without_operation_is_noop() {
        let session = CommandSession::default();
        assert!(!session.stop(OperationKind::Flash));
    }

    #[tokio::test]
    async fn test_stopping_flash_leaves_sync_running() {
        let session = CommandSession::default();
        let flash = session
            .start(OperationKind::Flash, &flash_device(), sh("exec sleep 30"))
            .unwrap();
        let sync = session
            .start(
                OperationKind::Sync,
                &sync_device(),
                sh("sleep 0.3; echo synced"),
            )
            .unwrap();

        session.stop(OperationKind::Flash);
        assert!(!completions(&drain(flash).await)[0].0);

        let sync_events = drain(sync).await;
        assert!(sync_events.contains(&SessionEvent::Output("synced".to_string())));
        assert_eq!(completions(&sync_events), vec![(true, ProcessExit::Code(0))]);
    }

    #[tokio::test]
    async fn test_replace_cancels_previous() {
        let session = CommandSession::default();
        let old = session
            .start(OperationKind::Flash, &flash_device(), sh("exec sleep 30"))
            .unwrap();
        let new = session
            .replace(OperationKind::Flash, &flash_device(), sh("echo fresh"))
            .unwrap();

        assert!(!completions(&drain(old).await)[0].0);

        let new_events = drain(new).await;
        assert!(new_events.contains(&SessionEvent::Output("fresh".to_string())));
        assert_eq!(completions(&new_events), vec![(true, ProcessExit::Code(0))]);
        assert!(!session.is_running(OperationKind::Flash));
    }

    #[tokio::test]
    async fn test_wrong_transport_rejected() {
        let session = CommandSession::default();
        let result = session.start(OperationKind::Flash, &sync_device(), sh("true"));
        assert!(matches!(
            result,
            Err(Error::WrongTransport {
                kind: OperationKind::Flash,
                ..
            })
        ));
        assert!(!session.is_running(OperationKind::Flash));
    }

    #[tokio::test]
    async fn test_spawn_failure_completes_with_failure() {
        let session = CommandSession::default();
        let rx = session
            .start(
                OperationKind::Flash,
                &flash_device(),
                ArgumentSet::new(["flashdeck-no-such-fastboot", "flashall"]).unwrap(),
            )
            .unwrap();

        let events = drain(rx).await;
        assert!(matches!(events[0], SessionEvent::Error(_)));
        assert_eq!(
            completions(&events),
            vec![(false, ProcessExit::SpawnFailed)]
        );

        // The failed attempt does not block the next one
        assert!(session
            .start(OperationKind::Flash, &flash_device(), sh("true"))
            .is_ok());
    }

    #[tokio::test]
    async fn test_product_out_sets_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let session = CommandSession::default().with_product_env_var("PRODUCT_DIR");
        session.set_product_out(Some(dir.path()));

        let output = session
            .run_simple(sh("echo \"$PRODUCT_DIR\"; pwd"))
            .await
            .unwrap();

        assert_eq!(output.stdout_lines[0], dir.path().to_string_lossy());
        assert_eq!(
            Path::new(&output.stdout_lines[1]).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );

        session.set_product_out(None);
        assert!(session.product_out().is_none());
    }

    #[tokio::test]
    async fn test_run_simple_timeout() {
        let session =
            CommandSession::default().with_simple_timeout(Duration::from_millis(200));
        let result = session.run_simple(sh("exec sleep 30")).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_dropped_receiver_still_retires_operation() {
        let session = CommandSession::default();
        let rx = session
            .start(OperationKind::Sync, &sync_device(), sh("echo a; echo b"))
            .unwrap();
        drop(rx);

        timeout(Duration::from_secs(5), async {
            while session.is_running(OperationKind::Sync) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
