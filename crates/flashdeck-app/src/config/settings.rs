//! Settings parser for .flashdeck/config.toml

use super::types::Settings;
use flashdeck_core::prelude::*;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const FLASHDECK_DIR: &str = ".flashdeck";

/// Default config location for a project directory
pub fn config_path(project_path: &Path) -> PathBuf {
    project_path.join(FLASHDECK_DIR).join(CONFIG_FILENAME)
}

/// Load settings from `<project>/.flashdeck/config.toml`
///
/// A missing, unreadable, malformed or invalid file yields the defaults.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = config_path(project_path);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match load_settings_from(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Ignoring {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Load settings from an explicit file
///
/// Unlike [`load_settings`], problems are reported to the caller.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = toml::from_str(&content)?;
    settings.validate()?;

    debug!("Loaded settings from {:?}", path);
    Ok(settings)
}
