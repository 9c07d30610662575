use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// User-adjustable options, persisted as a flat YAML mapping.
///
/// Every key is optional on disk; missing keys take the default and unknown keys are ignored.
/// A key holding a wrong-typed or out-of-range value also falls back to its default alone.
/// `poll_interval` is only read when the sampler starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub poll_interval: u64,
    pub cpu_temp_threshold: f64,
    pub gpu_temp_threshold: f64,
    pub ram_threshold: f64,
    pub disk_threshold: f64,
    pub popup_alerts: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: 2000,
            cpu_temp_threshold: 80.0,
            gpu_temp_threshold: 85.0,
            ram_threshold: 90.0,
            disk_threshold: 90.0,
            popup_alerts: true,
        }
    }
}

impl Settings {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hostwatch")
            .join("settings.yaml")
    }

    /// A missing file yields defaults; an unreadable file or a document that is not a YAML
    /// mapping is an error. Bad individual values are dropped with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = match fs::read_to_string(path_ref) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path_display,
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let doc: Option<Mapping> =
            serde_yaml::from_str(&text).map_err(|source| SettingsError::Corrupt {
                path: path_display,
                source,
            })?;
        Ok(doc.map(merge_over_defaults).unwrap_or_default())
    }

    /// Startup load: any failure falls back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(error = %err, "settings unusable, falling back to defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = serde_yaml::to_string(self)?;
        if let Some(parent) = path_ref.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: path_display.clone(),
                source,
            })?;
        }
        fs::write(path_ref, text).map_err(|source| SettingsError::Write {
            path: path_display.clone(),
            source,
        })?;
        info!(path = %path_display, "settings saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.poll_interval < 100 {
            return Err(SettingsError::Validation(
                "poll_interval must be >= 100 ms".to_string(),
            ));
        }
        for (name, value) in [
            ("ram_threshold", self.ram_threshold),
            ("disk_threshold", self.disk_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(SettingsError::Validation(format!(
                    "{name} must be within 0..100"
                )));
            }
        }
        for (name, value) in [
            ("cpu_temp_threshold", self.cpu_temp_threshold),
            ("gpu_temp_threshold", self.gpu_temp_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(SettingsError::Validation(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

/// Applies each key on its own so one bad value cannot discard the rest.
fn merge_over_defaults(doc: Mapping) -> Settings {
    let mut settings = Settings::default();
    for (key, value) in doc {
        let name = key.as_str().unwrap_or("<non-string key>").to_string();
        let mut single = Mapping::new();
        single.insert(key, value);
        let patch: SettingsPatch = match serde_yaml::from_value(Value::Mapping(single)) {
            Ok(patch) => patch,
            Err(err) => {
                warn!(key = %name, error = %err, "ignoring unreadable settings value");
                continue;
            }
        };
        match patch.apply(&settings) {
            Ok(next) => settings = next,
            Err(err) => warn!(key = %name, error = %err, "ignoring invalid settings value"),
        }
    }
    settings
}

/// Partial update, as sent by a consumer. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub poll_interval: Option<u64>,
    pub cpu_temp_threshold: Option<f64>,
    pub gpu_temp_threshold: Option<f64>,
    pub ram_threshold: Option<f64>,
    pub disk_threshold: Option<f64>,
    pub popup_alerts: Option<bool>,
}

impl SettingsPatch {
    pub fn apply(&self, base: &Settings) -> Result<Settings, SettingsError> {
        let next = Settings {
            poll_interval: self.poll_interval.unwrap_or(base.poll_interval),
            cpu_temp_threshold: self.cpu_temp_threshold.unwrap_or(base.cpu_temp_threshold),
            gpu_temp_threshold: self.gpu_temp_threshold.unwrap_or(base.gpu_temp_threshold),
            ram_threshold: self.ram_threshold.unwrap_or(base.ram_threshold),
            disk_threshold: self.disk_threshold.unwrap_or(base.disk_threshold),
            popup_alerts: self.popup_alerts.unwrap_or(base.popup_alerts),
        };
        next.validate()?;
        Ok(next)
    }
}
