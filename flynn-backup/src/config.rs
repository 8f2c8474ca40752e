//! Configuration management for the backup tool.
//!
//! Loads configuration from an optional TOML file. Command line flags and
//! environment variables are applied on top by the binary.

use crate::archive::spool::{SpoolOptions, DEFAULT_SPILL_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller base URL
    #[serde(default = "default_controller_url")]
    pub url: String,

    /// Controller auth key
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Bytes a dump may buffer in memory before spilling to disk (default: 8MB)
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: usize,

    /// Directory for spill files (default: system temp dir)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Abort the whole run after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_controller_url() -> String {
    "http://controller.discoverd".to_string()
}

fn default_spill_threshold() -> usize {
    DEFAULT_SPILL_THRESHOLD
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: default_controller_url(),
            key: String::new(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            spill_threshold: default_spill_threshold(),
            temp_dir: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn spool_options(&self) -> SpoolOptions {
        SpoolOptions {
            spill_threshold: self.archive.spill_threshold,
            temp_dir: self.archive.temp_dir.clone(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.backup.timeout_secs.filter(|&secs| secs > 0).map(Duration::from_secs)
    }
}
