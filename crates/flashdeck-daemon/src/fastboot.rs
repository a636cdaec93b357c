//! Bootloader device discovery by periodic enumeration
//!
//! Devices in bootloader mode cannot push notifications, so the poller runs
//! the enumeration command on a fixed interval and diffs the reported serial
//! set against the previous tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use flashdeck_core::prelude::*;
use flashdeck_core::{ArgumentSet, CommandSpec, Device, DeviceEvent, EventSink, Transport};

use crate::process::ProcessRunner;

/// Default interval between enumeration runs
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default limit for a single enumeration run
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Poller tuning
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Enumeration command, normally `fastboot devices`
    pub command: ArgumentSet,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive ticks a serial must be missing before it is reported gone
    pub disconnect_after_misses: u32,
}

impl PollerConfig {
    pub fn new(command: ArgumentSet) -> Self {
        Self {
            command,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
            disconnect_after_misses: 1,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_disconnect_after_misses(mut self, misses: u32) -> Self {
        self.disconnect_after_misses = misses;
        self
    }
}

/// Parse enumeration output into a set of serials
///
/// Each device line is `SERIAL<tab>fastboot`; only the first token matters.
pub fn parse_serials<S: AsRef<str>>(lines: &[S]) -> BTreeSet<String> {
    lines
        .iter()
        .map(|line| line.as_ref().trim())
        .filter(|line| !line.is_empty())
        .filter(|line| {
            !line.starts_with("List of devices") && !line.starts_with('*') && !line.starts_with('<')
        })
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Polls the bootloader enumeration command and feeds presence changes into
/// an [`EventSink`]
pub struct FastbootPoller {
    config: PollerConfig,
    runner: ProcessRunner,
    sink: Arc<dyn EventSink>,
    /// Serials reported connected, with their current miss count
    known: BTreeMap<String, u32>,
}

impl FastbootPoller {
    pub fn new(config: PollerConfig, runner: ProcessRunner, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            runner,
            sink,
            known: BTreeMap::new(),
        }
    }

    /// Serials currently considered connected
    pub fn known_serials(&self) -> impl Iterator<Item = &str> {
        self.known.keys().map(String::as_str)
    }

    /// Run one enumeration, ingest the resulting events and return them.
    pub async fn poll_once(&mut self) -> Vec<DeviceEvent> {
        let current = self.enumerate().await;
        let events = self.diff(&current);

        for event in &events {
            self.sink.ingest(event.clone());
        }

        events
    }

    async fn enumerate(&self) -> BTreeSet<String> {
        let spec = CommandSpec::new(self.config.command.clone());

        match self
            .runner
            .run_blocking(&spec, Some(self.config.timeout))
            .await
        {
            Ok(output) if output.success() => parse_serials(&output.stdout_lines),
            Ok(output) => {
                debug!(
                    "'{}' exited with {:?}, treating as no devices: {}",
                    self.config.command,
                    output.exit_code,
                    output.stderr_lines.join(" ")
                );
                BTreeSet::new()
            }
            Err(e) => {
                debug!("Bootloader enumeration failed, treating as no devices: {}", e);
                BTreeSet::new()
            }
        }
    }

    fn diff(&mut self, current: &BTreeSet<String>) -> Vec<DeviceEvent> {
        let threshold = self.config.disconnect_after_misses.max(1);
        let mut events = Vec::new();

        let mut gone = Vec::new();
        for (serial, misses) in self.known.iter_mut() {
            if current.contains(serial) {
                *misses = 0;
            } else {
                *misses += 1;
                if *misses >= threshold {
                    gone.push(serial.clone());
                }
            }
        }

        for serial in gone {
            self.known.remove(&serial);
            info!("Bootloader device gone: {}", serial);
            events.push(DeviceEvent::disconnected(Transport::Bootloader, serial));
        }

        for serial in current {
            if !self.known.contains_key(serial) {
                self.known.insert(serial.clone(), 0);
                info!("Bootloader device found: {}", serial);
                events.push(DeviceEvent::Connected(Device::bootloader(serial.clone())));
            }
        }

        events
    }

    /// Poll on the configured interval until `shutdown` is cancelled.
    ///
    /// Ticks run sequentially, so enumerations never overlap; ticks missed
    /// while a slow enumeration runs are skipped.
    pub fn spawn(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                "Bootloader poller started: '{}' every {:?}",
                self.config.command, self.config.interval
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = self.poll_once() => {}
                        }
                    }
                }
            }

            info!("Bootloader poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn cat_command(path: &std::path::Path) -> ArgumentSet {
        let script = format!("cat '{}'", path.display());
        ArgumentSet::new(["sh", "-c", script.as_str()]).unwrap()
    }

    fn poller_for(command: ArgumentSet) -> (FastbootPoller, mpsc::Receiver<DeviceEvent>) {
        let (tx, rx) = mpsc::channel();
        let poller = FastbootPoller::new(
            PollerConfig::new(command),
            ProcessRunner::default(),
            Arc::new(tx),
        );
        (poller, rx)
    }

    #[test]
    fn test_parse_serials_takes_first_token() {
        let lines = vec![
            "ABC123\tfastboot",
            "emulator-5554    fastboot",
            "",
            "   ",
        ];
        let serials = parse_serials(&lines);
        assert_eq!(
            serials.into_iter().collect::<Vec<_>>(),
            vec!["ABC123", "emulator-5554"]
        );
    }

    #[test]
    fn test_parse_serials_ignores_banners() {
        let lines = vec![
            "List of devices attached",
            "* daemon not running; starting now at tcp:5037",
            "< waiting for any device >",
            "XYZ\tfastboot",
        ];
        let serials = parse_serials(&lines);
        assert_eq!(serials.len(), 1);
        assert!(serials.contains("XYZ"));
    }

    #[tokio::test]
    async fn test_poll_reports_connect_and_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let listing = dir.path().join("devices.txt");
        std::fs::write(&listing, "A\tfastboot\nB\tfastboot\n").unwrap();

        let (mut poller, rx) = poller_for(cat_command(&listing));

        let events = poller.poll_once().await;
        assert_eq!(
            events,
            vec![
                DeviceEvent::Connected(Device::bootloader("A")),
                DeviceEvent::Connected(Device::bootloader("B")),
            ]
        );
        assert_eq!(rx.try_iter().count(), 2);

        // Unchanged set: nothing to report
        assert!(poller.poll_once().await.is_empty());

        std::fs::write(&listing, "B\tfastboot\nC\tfastboot\n").unwrap();
        let events = poller.poll_once().await;
        assert_eq!(
            events,
            vec![
                DeviceEvent::disconnected(Transport::Bootloader, "A"),
                DeviceEvent::Connected(Device::bootloader("C")),
            ]
        );
        assert_eq!(poller.known_serials().collect::<Vec<_>>(), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_failed_poll_disconnects_all_known_devices() {
        let dir = tempfile::tempdir().unwrap();
        let listing = dir.path().join("devices.txt");
        std::fs::write(&listing, "A\tfastboot\nB\tfastboot\n").unwrap();

        let (mut poller, _rx) = poller_for(cat_command(&listing));
        assert_eq!(poller.poll_once().await.len(), 2);

        // cat fails with a non-zero exit once the file is gone
        std::fs::remove_file(&listing).unwrap();
        let events = poller.poll_once().await;
        assert_eq!(
            events,
            vec![
                DeviceEvent::disconnected(Transport::Bootloader, "A"),
                DeviceEvent::disconnected(Transport::Bootloader, "B"),
            ]
        );
        assert_eq!(poller.known_serials().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_tool_yields_empty_set() {
        let command = ArgumentSet::new(["flashdeck-no-such-fastboot", "devices"]).unwrap();
        let (mut poller, rx) = poller_for(command);

        assert!(poller.poll_once().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_debounce_delays_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let listing = dir.path().join("devices.txt");
        std::fs::write(&listing, "A\tfastboot\n").unwrap();

        let (tx, _rx) = mpsc::channel();
        let mut poller = FastbootPoller::new(
            PollerConfig::new(cat_command(&listing)).with_disconnect_after_misses(2),
            ProcessRunner::default(),
            Arc::new(tx),
        );
        assert_eq!(poller.poll_once().await.len(), 1);

        std::fs::write(&listing, "").unwrap();
        assert!(poller.poll_once().await.is_empty());

        // Back before the threshold: the miss count resets
        std::fs::write(&listing, "A\tfastboot\n").unwrap();
        assert!(poller.poll_once().await.is_empty());

        std::fs::write(&listing, "").unwrap();
        assert!(poller.poll_once().await.is_empty());
        assert_eq!(
            poller.poll_once().await,
            vec![DeviceEvent::disconnected(Transport::Bootloader, "A")]
        );
    }

    #[tokio::test]
    async fn test_spawned_poller_runs_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let listing = dir.path().join("devices.txt");
        std::fs::write(&listing, "A\tfastboot\n").unwrap();

        let (tx, rx) = mpsc::channel();
        let poller = FastbootPoller::new(
            PollerConfig::new(cat_command(&listing)).with_interval(Duration::from_millis(20)),
            ProcessRunner::default(),
            Arc::new(tx),
        );

        let shutdown = CancellationToken::new();
        let task = poller.spawn(shutdown.clone());

        let first = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, DeviceEvent::Connected(Device::bootloader("A")));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
