//! External tool process management
//!
//! [`ProcessRunner`] launches one external process per call. It holds no state
//! shared between calls: every call owns its child handle exclusively.
//!
//! Two modes are offered:
//! - [`ProcessRunner::run_blocking`] waits for exit and returns all output.
//! - [`ProcessRunner::run_streaming`] returns a [`CancelHandle`] immediately and
//!   delivers [`ProcessEvent`]s as the process produces output.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use flashdeck_core::prelude::*;
use flashdeck_core::{CommandSpec, ProcessEvent, ProcessExit};

/// Time a process gets to exit after the termination signal before it is killed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Captured result of a blocking run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Handle to a streamed process
///
/// Cloning the handle shares the same cancellation state.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    /// Cancelled when termination is requested
    token: CancellationToken,
    /// Cancelled by the supervisor once `Exited` has been sent
    finished: CancellationToken,
    pid: Option<u32>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            finished: CancellationToken::new(),
            pid: None,
        }
    }

    /// Request termination. Idempotent, and a no-op once the process exited.
    pub fn cancel(&self) {
        if self.finished.is_cancelled() {
            debug!("cancel ignored, process {:?} already exited", self.pid);
            return;
        }
        self.token.cancel();
    }

    /// Whether termination was requested before the process exited
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the `Exited` event has been sent
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wait until the `Exited` event has been sent
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// OS process id, `None` if the process never started
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Spawns external tools
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ProcessRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Run a process to completion and capture everything it printed.
    ///
    /// A non-zero exit is not an error; it is reported in
    /// [`ProcessOutput::exit_code`]. When `limit` elapses the process is killed
    /// and [`Error::Timeout`] is returned.
    pub async fn run_blocking(
        &self,
        spec: &CommandSpec,
        limit: Option<Duration>,
    ) -> Result<ProcessOutput> {
        debug!("Running: {}", spec.argv);

        let mut command = build_command(spec);
        let child = command.spawn().map_err(|e| spawn_error(spec, e))?;

        // The future owns the child; dropping it on timeout kills the process
        // through kill_on_drop.
        let wait = child.wait_with_output();
        let output = match limit {
            Some(limit) => timeout(limit, wait).await.map_err(|_| {
                warn!("'{}' timed out after {:?}, killed", spec.argv, limit);
                Error::timeout(spec.program(), limit)
            })??,
            None => wait.await?,
        };

        let result = ProcessOutput {
            exit_code: output.status.code(),
            stdout_lines: split_lines(&output.stdout),
            stderr_lines: split_lines(&output.stderr),
        };

        debug!(
            "'{}' exited with {:?} ({} stdout / {} stderr lines)",
            spec.program(),
            result.exit_code,
            result.stdout_lines.len(),
            result.stderr_lines.len()
        );

        Ok(result)
    }

    /// Start a process and stream its output into `events`.
    ///
    /// Never blocks and never fails: a spawn failure is delivered as a
    /// `Stderr` line followed by `Exited(SpawnFailed)`. `Exited` is always the
    /// last event and is sent exactly once, after both output streams have
    /// been drained.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_streaming(
        &self,
        spec: &CommandSpec,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> CancelHandle {
        let mut handle = CancelHandle::new();

        info!("Starting: {}", spec.argv);

        let mut child = match build_command(spec).spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = spawn_error(spec, e);
                warn!("{}", err);
                let _ = events.send(ProcessEvent::Stderr(err.to_string()));
                let _ = events.send(ProcessEvent::Exited(ProcessExit::SpawnFailed));
                handle.finished.cancel();
                return handle;
            }
        };

        handle.pid = child.id();
        info!("'{}' started with PID: {:?}", spec.program(), handle.pid);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                ProcessEvent::Stdout,
                events.clone(),
                handle.token.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                ProcessEvent::Stderr,
                events.clone(),
                handle.token.clone(),
            ));
        }

        tokio::spawn(supervise(
            child,
            readers,
            events,
            handle.clone(),
            self.grace_period,
            spec.program().to_string(),
        ));

        handle
    }

    /// Request termination of a streamed process
    pub fn cancel(&self, handle: &CancelHandle) {
        handle.cancel();
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut command = Command::new(spec.program());
    command
        .args(spec.argv.args())
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &spec.work_dir {
        command.current_dir(dir);
    }

    command
}

fn spawn_error(spec: &CommandSpec, e: io::Error) -> Error {
    if let Some(dir) = spec.work_dir.as_ref().filter(|dir| !dir.is_dir()) {
        return Error::spawn(
            spec.program(),
            format!("working directory {} does not exist", dir.display()),
        );
    }

    if e.kind() == io::ErrorKind::NotFound {
        Error::spawn(spec.program(), "executable not found")
    } else {
        Error::spawn(spec.program(), e.to_string())
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

fn decode_line(buf: &[u8]) -> String {
    let line = String::from_utf8_lossy(buf);
    line.trim_end_matches('\n').trim_end_matches('\r').to_string()
}

/// Forward lines from one output pipe until EOF or cancellation.
fn spawn_reader<R>(
    stream: R,
    wrap: fn(String) -> ProcessEvent,
    events: mpsc::UnboundedSender<ProcessEvent>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                result = reader.read_until(b'\n', &mut buf) => result,
                _ = token.cancelled() => break,
            };

            match read {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    trace!("output: {}", line);
                    if events.send(wrap(line)).is_err() {
                        debug!("process event channel closed");
                        break;
                    }
                }
                Err(e) => {
                    let _ = events.send(ProcessEvent::Stderr(format!(
                        "output stream closed early: {}",
                        e
                    )));
                    break;
                }
            }
        }
    })
}

/// Background task: owns `child`, waits for it (or terminates it), drains the
/// readers and sends the single `Exited` event.
async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    handle: CancelHandle,
    grace_period: Duration,
    program: String,
) {
    let status = tokio::select! {
        biased;
        result = child.wait() => result,
        _ = handle.token.cancelled() => terminate(&mut child, grace_period, &program).await,
    };

    for reader in readers {
        if let Err(e) = reader.await {
            error!("output reader for '{}' panicked: {}", program, e);
        }
    }

    // Cancellation observed before the exit is reported wins, even if the
    // process happened to exit on its own in the meantime.
    let exit = if handle.token.is_cancelled() {
        ProcessExit::Cancelled
    } else {
        match status {
            Ok(status) => exit_from_status(status),
            Err(e) => {
                error!("Error waiting for '{}': {}", program, e);
                let _ = events.send(ProcessEvent::Stderr(format!(
                    "lost track of '{}': {}",
                    program, e
                )));
                ProcessExit::Terminated
            }
        }
    };

    info!("'{}' finished: {:?}", program, exit);
    let _ = events.send(ProcessEvent::Exited(exit));
    handle.finished.cancel();
}

fn exit_from_status(status: ExitStatus) -> ProcessExit {
    match status.code() {
        Some(code) => ProcessExit::Code(code),
        None => ProcessExit::Terminated,
    }
}

/// Termination signal first, kill after the grace period.
async fn terminate(
    child: &mut Child,
    grace_period: Duration,
    program: &str,
) -> io::Result<ExitStatus> {
    info!("Cancelling '{}', requesting termination", program);
    request_termination(child);

    match timeout(grace_period, child.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "'{}' still running {:?} after termination request, killing",
                program, grace_period
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed ({}), killing instead", pid, e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    // No cooperative signal available; TerminateProcess is the only option.
    let _ = child.start_kill();
}
