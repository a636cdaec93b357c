//! Core domain type definitions

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────
// Device identity
// ─────────────────────────────────────────────────────────

/// Transport through which a device is reachable
///
/// Ordering puts bridge devices before bootloader devices, which is also the
/// order snapshots are replayed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Debug bridge (adb): push-based device list, device is running its OS
    Bridge,
    /// Bootloader mode (fastboot): discovered by polling only
    Bootloader,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Bridge => write!(f, "bridge"),
            Transport::Bootloader => write!(f, "bootloader"),
        }
    }
}

/// Registry key: a serial is only unique within its transport
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    pub transport: Transport,
    pub serial: String,
}

impl DeviceId {
    pub fn new(transport: Transport, serial: impl Into<String>) -> Self {
        Self {
            transport,
            serial: serial.into(),
        }
    }

    pub fn bridge(serial: impl Into<String>) -> Self {
        Self::new(Transport::Bridge, serial)
    }

    pub fn bootloader(serial: impl Into<String>) -> Self {
        Self::new(Transport::Bootloader, serial)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.serial)
    }
}

/// Whether the device currently accepts commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineState {
    #[default]
    Online,
    Offline,
}

/// Opaque change bits reported by the bridge client
///
/// Bootloader devices never carry any bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeMask(u32);

impl ChangeMask {
    pub const NONE: ChangeMask = ChangeMask(0);
    /// Device state (online/offline/unauthorized) changed
    pub const STATE: ChangeMask = ChangeMask(0x0001);
    /// Set of debuggable clients on the device changed
    pub const CLIENT_LIST: ChangeMask = ChangeMask(0x0002);
    /// Build properties became available
    pub const BUILD_INFO: ChangeMask = ChangeMask(0x0004);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: ChangeMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: ChangeMask) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for ChangeMask {
    type Output = ChangeMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// A device observed on one transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub transport: Transport,
    pub serial: String,
    #[serde(default)]
    pub online_state: OnlineState,
    #[serde(default)]
    pub capability_mask: ChangeMask,
    /// Model name reported by the bridge client, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Device {
    /// A freshly observed bridge device
    pub fn bridge(serial: impl Into<String>) -> Self {
        Self {
            transport: Transport::Bridge,
            serial: serial.into(),
            online_state: OnlineState::Online,
            capability_mask: ChangeMask::NONE,
            model: None,
        }
    }

    /// A device seen in the bootloader enumeration output
    pub fn bootloader(serial: impl Into<String>) -> Self {
        Self {
            transport: Transport::Bootloader,
            serial: serial.into(),
            online_state: OnlineState::Online,
            capability_mask: ChangeMask::NONE,
            model: None,
        }
    }

    pub fn with_state(mut self, state: OnlineState) -> Self {
        self.online_state = state;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn id(&self) -> DeviceId {
        DeviceId::new(self.transport, self.serial.clone())
    }

    pub fn is_online(&self) -> bool {
        self.online_state == OnlineState::Online
    }

    /// Get a display string for the device
    pub fn display_name(&self) -> String {
        match (&self.transport, &self.model) {
            (Transport::Bootloader, _) => format!("fastboot {}", self.serial),
            (Transport::Bridge, Some(model)) => format!("{} ({})", model, self.serial),
            (Transport::Bridge, None) => self.serial.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Operations and command vectors
// ─────────────────────────────────────────────────────────

/// Class of long-running operation; at most one of each runs at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Flash,
    Sync,
}

impl OperationKind {
    /// Transport the target device must be reachable through
    pub fn required_transport(&self) -> Transport {
        match self {
            OperationKind::Flash => Transport::Bootloader,
            OperationKind::Sync => Transport::Bridge,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Flash => write!(f, "flash"),
            OperationKind::Sync => write!(f, "sync"),
        }
    }
}

/// Ordered command vector; the first element is the executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentSet(Vec<String>);

impl ArgumentSet {
    /// Build a command vector, rejecting an empty or blank executable name
    pub fn new<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Ok(Self(argv)),
            _ => Err(Error::EmptyCommand),
        }
    }

    pub fn program(&self) -> &str {
        &self.0[0]
    }

    pub fn args(&self) -> &[String] {
        &self.0[1..]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Append more arguments after the existing ones
    pub fn extend<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for ArgumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// Everything needed to launch one external process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: ArgumentSet,
    pub work_dir: Option<PathBuf>,
    /// Variables set on top of the inherited environment
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(argv: ArgumentSet) -> Self {
        Self {
            argv,
            work_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn program(&self) -> &str {
        self.argv.program()
    }
}

impl From<ArgumentSet> for CommandSpec {
    fn from(argv: ArgumentSet) -> Self {
        Self::new(argv)
    }
}
