//! Application configuration management utilities.

use camino::{Utf8Path, Utf8PathBuf};
use directories_next::ProjectDirs;
use mons_overlay::PlatformOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;

/// Application-wide configuration stored in config.toml.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub overlay: PlatformOptions,
}

/// Returns the platform configuration directory for mons.
pub fn config_dir() -> Option<Utf8PathBuf> {
    let dirs = ProjectDirs::from("", "", "mons")?;
    Utf8PathBuf::from_path_buf(dirs.config_dir().to_path_buf()).ok()
}

/// Returns the default configuration file path (config.toml).
pub fn default_config_path() -> Option<Utf8PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Loads the application configuration from config.toml.
/// Returns default configuration if file doesn't exist or cannot be parsed.
pub fn load_config() -> AppConfig {
    default_config_path()
        .map(|path| load_config_from(&path))
        .unwrap_or_default()
}

/// Loads configuration from `path`, falling back to defaults.
pub fn load_config_from(path: &Utf8Path) -> AppConfig {
    let Ok(content) = fs::read_to_string(path) else {
        return AppConfig::default();
    };
    match toml::from_str(&content) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Ignoring unparsable config {}: {}", path, e);
            AppConfig::default()
        }
    }
}

/// Saves the application configuration to config.toml.
pub fn save_config(cfg: &AppConfig) -> io::Result<()> {
    match default_config_path() {
        Some(path) => save_config_to(&path, cfg),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "Could not determine config path",
        )),
    }
}

/// Saves configuration to `path`, creating its parent directory.
pub fn save_config_to(path: &Utf8Path, cfg: &AppConfig) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(cfg).map_err(io::Error::other)?;
    fs::write(path, content)
}

/// Loads existing configuration or creates a new one with defaults.
pub fn load_or_create_config() -> io::Result<(AppConfig, Utf8PathBuf)> {
    let path = default_config_path().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "Could not determine config path")
    })?;

    if path.exists() {
        let content = fs::read_to_string(&path)?;
        let cfg =
            toml::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((cfg, path))
    } else {
        let cfg = AppConfig::default();
        save_config_to(&path, &cfg)?;
        Ok((cfg, path))
    }
}
