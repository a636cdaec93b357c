//! Configuration types for flashdeck
//!
//! Defines `Settings` (`.flashdeck/config.toml`) and its sections.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use flashdeck_core::prelude::*;
use flashdeck_daemon::ToolOverrides;

/// Application settings (.flashdeck/config.toml)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub poller: PollerSettings,

    #[serde(default)]
    pub process: ProcessSettings,

    #[serde(default)]
    pub tools: ToolSettings,

    #[serde(default)]
    pub product: ProductSettings,
}

impl Settings {
    /// Reject values that would make the poller or sessions misbehave
    pub fn validate(&self) -> Result<()> {
        if self.poller.interval_ms == 0 {
            return Err(Error::config("poller.interval_ms must be greater than 0"));
        }
        if self.poller.timeout_ms == 0 {
            return Err(Error::config("poller.timeout_ms must be greater than 0"));
        }
        if self.poller.disconnect_after_misses == 0 {
            return Err(Error::config(
                "poller.disconnect_after_misses must be at least 1",
            ));
        }
        if let Some(command) = &self.poller.command {
            if command.first().map_or(true, |p| p.trim().is_empty()) {
                return Err(Error::config("poller.command needs an executable"));
            }
        }
        if self.product.env_var.trim().is_empty() {
            return Err(Error::config("product.env_var must not be empty"));
        }
        Ok(())
    }
}

/// Bootloader enumeration settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PollerSettings {
    /// Interval between enumerations in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Enumeration command; defaults to `<fastboot> devices`
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Limit for a single enumeration in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive empty polls before a device is reported gone
    #[serde(default = "default_misses")]
    pub disconnect_after_misses: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            command: None,
            timeout_ms: default_poll_timeout_ms(),
            disconnect_after_misses: default_misses(),
        }
    }
}

impl PollerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_ms() -> u64 {
    5000
}

fn default_misses() -> u32 {
    1
}

/// Child process settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessSettings {
    /// Time between the termination request and the kill, in milliseconds
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Limit for root/remount/reboot in milliseconds
    #[serde(default = "default_simple_timeout_ms")]
    pub simple_timeout_ms: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            simple_timeout_ms: default_simple_timeout_ms(),
        }
    }
}

impl ProcessSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn simple_timeout(&self) -> Duration {
        Duration::from_millis(self.simple_timeout_ms)
    }
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_simple_timeout_ms() -> u64 {
    60_000
}

/// Tool location settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ToolSettings {
    /// SDK directory containing `platform-tools/`
    #[serde(default)]
    pub android_home: Option<PathBuf>,

    #[serde(default)]
    pub adb: Option<PathBuf>,

    #[serde(default)]
    pub fastboot: Option<PathBuf>,
}

impl ToolSettings {
    pub fn overrides(&self) -> ToolOverrides {
        ToolOverrides {
            android_home: self.android_home.clone(),
            adb: self.adb.clone(),
            fastboot: self.fastboot.clone(),
        }
    }
}

/// Build output settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProductSettings {
    /// Directory holding the images to flash
    #[serde(default)]
    pub out_dir: Option<PathBuf>,

    /// Variable the tools read the product directory from
    #[serde(default = "default_env_var")]
    pub env_var: String,
}

impl Default for ProductSettings {
    fn default() -> Self {
        Self {
            out_dir: None,
            env_var: default_env_var(),
        }
    }
}

fn default_env_var() -> String {
    "ANDROID_PRODUCT_OUT".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.poller.interval(), Duration::from_secs(1));
        assert_eq!(settings.poller.disconnect_after_misses, 1);
        assert_eq!(settings.process.grace_period(), Duration::from_secs(3));
        assert_eq!(settings.product.env_var, "ANDROID_PRODUCT_OUT");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings: Settings = toml::from_str("[poller]\ninterval_ms = 250\n").unwrap();
        assert_eq!(settings.poller.interval_ms, 250);
        assert_eq!(settings.poller.timeout_ms, 5000);
        assert_eq!(settings.process, ProcessSettings::default());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut settings = Settings::default();
        settings.poller.interval_ms = 0;
        assert!(matches!(settings.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let mut settings = Settings::default();
        settings.poller.command = Some(vec![]);
        assert!(settings.validate().is_err());

        settings.poller.command = Some(vec!["fastboot".to_string(), "devices".to_string()]);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_tool_overrides() {
        let settings: Settings =
            toml::from_str("[tools]\nandroid_home = \"/opt/sdk\"\nadb = \"/usr/bin/adb\"\n")
                .unwrap();
        let overrides = settings.tools.overrides();
        assert_eq!(overrides.android_home, Some(PathBuf::from("/opt/sdk")));
        assert_eq!(overrides.adb, Some(PathBuf::from("/usr/bin/adb")));
        assert!(overrides.fastboot.is_none());
    }
}
