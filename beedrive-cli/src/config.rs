//! Configuration file support for beedrive.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BEEDRIVE_*)
//! 3. Local config file (./beedrive.toml)
//! 4. Global config file (~/.config/beedrive/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Status wait used when neither the command line nor a config file sets one.
const DEFAULT_STATUS_TIMEOUT_SECS: u64 = 10;

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial number of the preferred printer.
    pub serial: Option<String>,
}

/// Transfer and control defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// How long status queries wait for an answer.
    pub status_timeout_secs: Option<u64>,
    /// Nozzle temperature used by `print` when none is given.
    pub heat_temperature: Option<f64>,
    /// Version string recorded after a firmware flash.
    pub firmware_version: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new("beedrive.toml")) {
            debug!("Loaded local config from beedrive.toml");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "beedrive").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Status wait in effect.
    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(
            self.transfer
                .status_timeout_secs
                .unwrap_or(DEFAULT_STATUS_TIMEOUT_SECS),
        )
    }

    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.transfer.status_timeout_secs.is_some() {
            self.transfer.status_timeout_secs = other.transfer.status_timeout_secs;
        }
        if other.transfer.heat_temperature.is_some() {
            self.transfer.heat_temperature = other.transfer.heat_temperature;
        }
        if other.transfer.firmware_version.is_some() {
            self.transfer.firmware_version = other.transfer.firmware_version;
        }
    }
}
