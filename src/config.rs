use crate::alerts::{DEFAULT_ALERT_HISTORY_CAPACITY, DEFAULT_COOLDOWN};
use crate::probes::sensor_tree::DEFAULT_ENDPOINT_URL;
use crate::store::{DEFAULT_HISTORY_CAPACITY, DEFAULT_WINDOW_CAPACITY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Service configuration. Unlike [`crate::settings::Settings`] it is read once at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    #[serde(default = "default_alert_history_capacity")]
    pub alert_history_capacity: usize,
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,
    #[serde(default)]
    pub monitor_endpoint: MonitorEndpointConfig,
    #[serde(default = "default_vendor_cli_timeout_ms")]
    pub vendor_cli_timeout_ms: u64,
    #[serde(default = "default_device_refresh_secs")]
    pub device_refresh_secs: u64,
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
    /// Allows the cleanup diagnostic to delete files in the temp and cache directories.
    #[serde(default)]
    pub allow_disk_cleanup: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorEndpointConfig {
    #[serde(default = "default_endpoint_enabled")]
    pub enabled: bool,
    #[serde(default = "default_endpoint_url")]
    pub url: String,
    #[serde(default = "default_endpoint_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for MonitorEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_endpoint_enabled(),
            url: default_endpoint_url(),
            timeout_ms: default_endpoint_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            history_capacity: default_history_capacity(),
            window_capacity: default_window_capacity(),
            alert_history_capacity: default_alert_history_capacity(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
            monitor_endpoint: MonitorEndpointConfig::default(),
            vendor_cli_timeout_ms: default_vendor_cli_timeout_ms(),
            device_refresh_secs: default_device_refresh_secs(),
            settings_path: None,
            allow_disk_cleanup: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`Config::load_from_file`], but a missing file means built-in defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if !path.as_ref().exists() {
            let cfg = Self::default();
            cfg.validate()?;
            return Ok(cfg);
        }
        Self::load_from_file(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.history_capacity < 1 {
            return Err(ConfigError::Validation(
                "history_capacity must be >= 1".to_string(),
            ));
        }
        if self.window_capacity < 1 || self.window_capacity > self.history_capacity {
            return Err(ConfigError::Validation(
                "window_capacity must be within 1..=history_capacity".to_string(),
            ));
        }
        if self.alert_history_capacity < 1 {
            return Err(ConfigError::Validation(
                "alert_history_capacity must be >= 1".to_string(),
            ));
        }
        if self.monitor_endpoint.enabled {
            if self.monitor_endpoint.url.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "monitor_endpoint.url must not be empty".to_string(),
                ));
            }
            if self.monitor_endpoint.timeout_ms == 0 {
                return Err(ConfigError::Validation(
                    "monitor_endpoint.timeout_ms must be > 0".to_string(),
                ));
            }
        }
        if self.vendor_cli_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "vendor_cli_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.device_refresh_secs < 1 {
            return Err(ConfigError::Validation(
                "device_refresh_secs must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn default_listen() -> String {
    "127.0.0.1:9108".to_string()
}

const fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

const fn default_window_capacity() -> usize {
    DEFAULT_WINDOW_CAPACITY
}

const fn default_alert_history_capacity() -> usize {
    DEFAULT_ALERT_HISTORY_CAPACITY
}

const fn default_alert_cooldown_secs() -> u64 {
    DEFAULT_COOLDOWN.as_secs()
}

const fn default_endpoint_enabled() -> bool {
    true
}

fn default_endpoint_url() -> String {
    DEFAULT_ENDPOINT_URL.to_string()
}

const fn default_endpoint_timeout_ms() -> u64 {
    2000
}

const fn default_vendor_cli_timeout_ms() -> u64 {
    3000
}

const fn default_device_refresh_secs() -> u64 {
    3
}
