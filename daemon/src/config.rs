//! Configuration management (TOML)

use crate::detector::ThresholdProfile;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub detection: ThresholdProfile,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub sample_interval_ms: u64,
    pub notifications: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
    /// Cycles a terminated process's history is kept for inspection.
    pub retention_cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub termination_grace_cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Names that may never be terminated (case-insensitive).
    pub critical_processes: Vec<String>,
    pub terminate_timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            notifications: true,
            socket_path: None,
            database_path: None,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: crate::history::DEFAULT_CAPACITY,
            retention_cycles: crate::registry::DEFAULT_RETENTION_CYCLES,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            termination_grace_cycles: crate::registry::DEFAULT_GRACE_CYCLES,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            critical_processes: [
                "systemd",
                "init",
                "kthreadd",
                "systemd-journald",
                "systemd-logind",
                "dbus-daemon",
                "sshd",
                "Xorg",
                "Xwayland",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            terminate_timeout_ms: 3000,
        }
    }
}

impl ControlConfig {
    pub fn is_critical(&self, name: &str) -> bool {
        self.critical_processes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.sample_interval_ms == 0 {
            return Err(ConfigError::invalid("sample_interval_ms", "must be greater than 0"));
        }
        if self.history.capacity == 0 {
            return Err(ConfigError::invalid("history.capacity", "must be greater than 0"));
        }
        self.detection.validate()?;
        // A shorter series could never hold enough points to flag or clear
        if self.history.capacity < self.detection.consecutive_samples as usize {
            return Err(ConfigError::invalid(
                "history.capacity",
                format!(
                    "must be at least consecutive_samples ({})",
                    self.detection.consecutive_samples
                ),
            ));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.general.sample_interval_ms)
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "procwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }
}
