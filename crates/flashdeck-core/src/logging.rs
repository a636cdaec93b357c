//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/flashdeck/logs/` so that stdout stays
/// free for NDJSON output. Log level is controlled by the `FLASHDECK_LOG`
/// environment variable.
///
/// # Examples
/// ```bash
/// FLASHDECK_LOG=debug flashdeck watch
/// FLASHDECK_LOG=flashdeck_daemon=trace flashdeck flash -s ABC123 flashall
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "flashdeck.log");

    // Default to info for our crates, allow override via FLASHDECK_LOG
    let env_filter = EnvFilter::try_from_env("FLASHDECK_LOG").unwrap_or_else(|_| {
        EnvFilter::new("flashdeck=info,flashdeck_core=info,flashdeck_app=info,flashdeck_daemon=info,warn")
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("flashdeck starting");
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(())
}

/// Get the log directory path
fn get_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("flashdeck").join("logs")
}
