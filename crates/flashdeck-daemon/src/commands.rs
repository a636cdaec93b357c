//! Command vectors for the device tools
//!
//! Every operation is expressed as an [`ArgumentSet`] built from the resolved
//! tool paths and the target serial. Caller-supplied arguments are passed
//! through unvalidated.

use std::path::{Path, PathBuf};

use flashdeck_core::prelude::*;
use flashdeck_core::{ArgumentSet, Transport};

/// Executables used to reach devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub adb: PathBuf,
    pub fastboot: PathBuf,
}

impl Default for ToolPaths {
    /// Bare names, resolved through `PATH` at spawn time
    fn default() -> Self {
        Self {
            adb: PathBuf::from("adb"),
            fastboot: PathBuf::from("fastboot"),
        }
    }
}

impl ToolPaths {
    pub fn new(adb: impl Into<PathBuf>, fastboot: impl Into<PathBuf>) -> Self {
        Self {
            adb: adb.into(),
            fastboot: fastboot.into(),
        }
    }

    /// Tool serving the given transport
    pub fn for_transport(&self, transport: Transport) -> &Path {
        match transport {
            Transport::Bridge => &self.adb,
            Transport::Bootloader => &self.fastboot,
        }
    }

    /// `fastboot devices`
    pub fn enumerate_command(&self) -> Result<ArgumentSet> {
        ArgumentSet::new([path_arg(&self.fastboot), "devices".to_string()])
    }
}

/// One device operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Flash images from the product directory; `wipe` erases userdata
    Flash { wipe: bool, args: Vec<String> },
    /// Push changed files of the whole system or one partition
    Sync { partition: Option<String> },
    /// Restart adbd with root permissions
    Root,
    /// Remount system partitions writable
    Remount,
    /// Reboot a bootloader device into the OS
    Reboot,
    /// Reboot a running device into the bootloader
    RebootBootloader,
}

impl DeviceCommand {
    /// Short name used in logs and CLI output
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Flash { .. } => "flash",
            DeviceCommand::Sync { .. } => "sync",
            DeviceCommand::Root => "root",
            DeviceCommand::Remount => "remount",
            DeviceCommand::Reboot => "reboot",
            DeviceCommand::RebootBootloader => "reboot-bootloader",
        }
    }

    /// Transport the target device must be on
    pub fn required_transport(&self) -> Transport {
        match self {
            DeviceCommand::Flash { .. } | DeviceCommand::Reboot => Transport::Bootloader,
            DeviceCommand::Sync { .. }
            | DeviceCommand::Root
            | DeviceCommand::Remount
            | DeviceCommand::RebootBootloader => Transport::Bridge,
        }
    }

    /// Build the full command vector for `serial`
    pub fn argv(&self, tools: &ToolPaths, serial: &str) -> Result<ArgumentSet> {
        let tool = path_arg(tools.for_transport(self.required_transport()));
        let base = ArgumentSet::new([tool, "-s".to_string(), serial.to_string()])?;

        let argv = match self {
            DeviceCommand::Flash { wipe, args } => {
                let base = if *wipe { base.extend(["-w"]) } else { base };
                base.extend(args.iter().cloned())
            }
            DeviceCommand::Sync { partition } => base.extend(
                std::iter::once("sync".to_string()).chain(partition.iter().cloned()),
            ),
            DeviceCommand::Root => base.extend(["root"]),
            DeviceCommand::Remount => base.extend(["remount"]),
            DeviceCommand::Reboot => base.extend(["reboot"]),
            DeviceCommand::RebootBootloader => base.extend(["reboot", "bootloader"]),
        };

        Ok(argv)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
