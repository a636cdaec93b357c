//! flashdeck - Track bridge and bootloader devices and run flashing tools
//!
//! This is the binary entry point. Device logic lives in the workspace crates;
//! every subcommand reports through NDJSON events on stdout.

mod headless;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

use flashdeck_app::{load_settings, load_settings_from, DeviceManager};
use flashdeck_core::{DeviceId, OperationKind};

use headless::{runner, HeadlessEvent};

/// flashdeck - Track bridge and bootloader devices and run flashing tools
#[derive(Parser, Debug)]
#[command(name = "flashdeck")]
#[command(about = "Track adb and fastboot devices and run flash/sync operations", long_about = None)]
struct Args {
    /// Settings file (defaults to .flashdeck/config.toml in the current directory)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Product output directory passed to flash and sync
    #[arg(long, value_name = "DIR", global = true)]
    product_out: Option<PathBuf>,

    /// Seconds to wait for the target device to show up
    #[arg(long, value_name = "SECS", default_value_t = 30, global = true)]
    wait: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print device notifications until interrupted
    Watch,

    /// Print the devices currently visible on both transports
    Devices,

    /// Flash a device in bootloader mode
    Flash {
        #[arg(short, long)]
        serial: String,

        /// Erase userdata before flashing
        #[arg(short, long)]
        wipe: bool,

        /// Arguments passed to fastboot, e.g. `flashall`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Sync the build to a running device
    Sync {
        #[arg(short, long)]
        serial: String,

        /// Single partition to sync (system, vendor, ...)
        partition: Option<String>,
    },

    /// Restart adbd with root permissions
    Root {
        #[arg(short, long)]
        serial: String,
    },

    /// Remount partitions read-write
    Remount {
        #[arg(short, long)]
        serial: String,
    },

    /// Reboot a bootloader device into the OS
    Reboot {
        #[arg(short, long)]
        serial: String,
    },

    /// Reboot a running device into the bootloader
    RebootBootloader {
        #[arg(short, long)]
        serial: String,
    },
}

impl Command {
    /// Whether the command needs bridge devices tracked
    fn uses_bridge(&self) -> bool {
        !matches!(self, Command::Flash { .. } | Command::Reboot { .. })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    flashdeck_core::logging::init()?;

    let settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            load_settings(&cwd)
        }
    };

    let manager = DeviceManager::start(&settings)?;
    if let Some(dir) = &args.product_out {
        manager.set_product_out(Some(dir.as_path()));
    }

    if args.command.uses_bridge() {
        if let Err(e) = manager.attach_adb().await {
            HeadlessEvent::from_error(&e).emit();
        }
    }

    let wait = Duration::from_secs(args.wait);
    let settle = settings.poller.interval() * 2;
    let outcome = run(&manager, args.command, wait, settle).await;

    manager.shutdown().await;

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            HeadlessEvent::from_error(&e).emit();
            std::process::exit(1);
        }
    }
}

/// Run one subcommand; `Ok(false)` means the device command itself failed
async fn run(
    manager: &DeviceManager,
    command: Command,
    wait: Duration,
    settle: Duration,
) -> flashdeck_core::Result<bool> {
    match command {
        Command::Watch => runner::watch(manager, runner::ctrl_c()).await.map(|_| true),
        Command::Devices => {
            runner::list_devices(manager, settle).await;
            Ok(true)
        }
        Command::Flash { serial, wipe, args } => {
            runner::run_operation(
                manager,
                OperationKind::Flash,
                &serial,
                wait,
                runner::ctrl_c(),
                |m| m.flash(&serial, wipe, args),
            )
            .await
        }
        Command::Sync { serial, partition } => {
            runner::run_operation(
                manager,
                OperationKind::Sync,
                &serial,
                wait,
                runner::ctrl_c(),
                |m| m.sync(&serial, partition),
            )
            .await
        }
        Command::Root { serial } => {
            let id = DeviceId::bridge(serial.as_str());
            runner::run_command(manager, "root", id, wait, manager.adb_root(&serial)).await
        }
        Command::Remount { serial } => {
            let id = DeviceId::bridge(serial.as_str());
            runner::run_command(manager, "remount", id, wait, manager.adb_remount(&serial)).await
        }
        Command::Reboot { serial } => {
            let id = DeviceId::bootloader(serial.as_str());
            runner::run_command(manager, "reboot", id, wait, manager.reboot(&serial)).await
        }
        Command::RebootBootloader { serial } => {
            let id = DeviceId::bridge(serial.as_str());
            let command = manager.reboot_bootloader(&serial);
            runner::run_command(manager, "reboot-bootloader", id, wait, command).await
        }
    }
}
