//! Configuration management for the command line
//!
//! Layers, lowest precedence first: built-in defaults, `config/default`,
//! the file passed with `--config`, then `ENSEMBLE_COORD_*` environment
//! variables with `__` between nested keys
//! (`ENSEMBLE_COORD_COORDINATION__HEARTBEAT_TIMEOUT_SECONDS=90`).

use crate::{Error, Result};
use clap::ValueEnum;
use ensemble_coord_core::config::CoordinationSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "ENSEMBLE_COORD";

/// Directory used as the shared store when nothing else is configured
pub const DEFAULT_STORAGE_ROOT: &str = ".ensemble-coord";

/// CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub coordination: CoordinationSettings,
    pub logging: LoggingConfig,
}

/// Location of the shared store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Also write a daily-rolling log file
    pub file: bool,
    /// Directory for log files, defaults to the platform data directory
    pub file_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: false,
            file_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Where log files go when file logging is on
    pub fn log_dir(&self) -> Option<PathBuf> {
        if !self.file {
            return None;
        }
        self.file_dir.clone().or_else(|| {
            dirs::data_local_dir().map(|dir| dir.join("ensemble-coord").join("logs"))
        })
    }
}

impl Config {
    /// Load configuration from the default file locations and environment
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load configuration, adding `path` above the default file locations
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with(Some(path.as_ref()))
    }

    fn load_with(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false));
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(Error::Configuration(
                "storage.root cannot be empty".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(Error::Configuration(
                "logging.level cannot be empty".to_string(),
            ));
        }
        self.coordination.validate()?;
        Ok(())
    }
}
