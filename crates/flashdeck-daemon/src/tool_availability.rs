//! Locating `adb` and `fastboot`
//!
//! Resolution order for each tool: explicit setting, configured SDK
//! directory, `$ANDROID_HOME`, `$ANDROID_SDK_ROOT` (each under
//! `platform-tools/`), then a `PATH` lookup.

use std::path::{Path, PathBuf};

use crate::commands::ToolPaths;

/// Explicit locations taken from configuration
#[derive(Debug, Clone, Default)]
pub struct ToolOverrides {
    pub android_home: Option<PathBuf>,
    pub adb: Option<PathBuf>,
    pub fastboot: Option<PathBuf>,
}

/// Result of looking up the device tools (run once at startup)
#[derive(Debug, Clone, Default)]
pub struct ToolAvailability {
    /// Path to adb if found
    pub adb: Option<PathBuf>,

    /// Path to fastboot if found
    pub fastboot: Option<PathBuf>,
}

impl ToolAvailability {
    pub fn check(overrides: &ToolOverrides) -> Self {
        let adb = find_tool("adb", overrides.adb.as_deref(), overrides);
        let fastboot = find_tool("fastboot", overrides.fastboot.as_deref(), overrides);

        match &adb {
            Some(path) => tracing::debug!("adb: {}", path.display()),
            None => tracing::warn!("adb not found"),
        }
        match &fastboot {
            Some(path) => tracing::debug!("fastboot: {}", path.display()),
            None => tracing::warn!("fastboot not found"),
        }

        Self { adb, fastboot }
    }

    /// Resolved paths, with bare names for tools that were not found
    pub fn tool_paths(&self) -> ToolPaths {
        let defaults = ToolPaths::default();
        ToolPaths {
            adb: self.adb.clone().unwrap_or(defaults.adb),
            fastboot: self.fastboot.clone().unwrap_or(defaults.fastboot),
        }
    }

    /// Get user-friendly message for a missing adb
    pub fn adb_unavailable_message(&self) -> Option<&'static str> {
        if self.adb.is_some() {
            None
        } else {
            Some("adb not found. Set ANDROID_HOME or add platform-tools to PATH.")
        }
    }

    /// Get user-friendly message for a missing fastboot
    pub fn fastboot_unavailable_message(&self) -> Option<&'static str> {
        if self.fastboot.is_some() {
            None
        } else {
            Some("fastboot not found. Set ANDROID_HOME or add platform-tools to PATH.")
        }
    }
}

/// SDK directories to search, in priority order
fn sdk_roots(overrides: &ToolOverrides) -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Some(home) = &overrides.android_home {
        roots.push(home.clone());
    }

    for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Some(value) = std::env::var_os(var).filter(|v| !v.is_empty()) {
            roots.push(PathBuf::from(value));
        }
    }

    roots
}

fn find_tool(name: &str, explicit: Option<&Path>, overrides: &ToolOverrides) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
    sdk_roots(overrides)
        .into_iter()
        .map(|root| root.join("platform-tools").join(&file_name))
        .find(|candidate| candidate.is_file())
        .or_else(|| {
            which::which(name)
                .inspect_err(|e| tracing::debug!("{} not on PATH: {}", name, e))
                .ok()
        })
}
