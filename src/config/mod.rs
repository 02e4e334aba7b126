//! Configuration module for the tus server
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.
//!
//! ```yaml
//! server:
//!   address: "127.0.0.1:5000"
//!   base_path: "/files"
//! storage:
//!   directory: "${TUS_DATA_DIR:-/tmp/tus-uploads}"
//! tus:
//!   max_size: 1073741824
//! metrics:
//!   enabled: true
//!   port: 9090
//! logging:
//!   level: "info"
//!   format: "json"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Default maximum upload size: 1 GiB
pub const DEFAULT_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tus: TusConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_path = &self.server.base_path;
        if !base_path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "server.base_path '{}' must start with '/'",
                base_path
            )));
        }
        if base_path.len() > 1 && base_path.ends_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "server.base_path '{}' must not end with '/'",
                base_path
            )));
        }
        if base_path == "/" {
            return Err(ConfigError::ValidationError(
                "server.base_path cannot be the root path".into(),
            ));
        }

        if self.storage.directory.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.directory cannot be empty".into(),
            ));
        }

        if self.tus.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "tus.max_size must be greater than zero".into(),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "logging.level cannot be empty".into(),
            ));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    /// Path of the upload collection; uploads live at `<base_path>/<id>`
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

fn default_base_path() -> String {
    "/files".to_string()
}

/// Backing storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_directory")]
    pub directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_directory(),
        }
    }
}

fn default_storage_directory() -> PathBuf {
    std::env::temp_dir().join("tus-uploads")
}

/// Protocol limits advertised through OPTIONS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TusConfig {
    /// Largest accepted `Upload-Length`, in bytes
    #[serde(default = "default_max_size")]
    pub max_size: u64,
}

impl Default for TusConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
        }
    }
}

fn default_max_size() -> u64 {
    DEFAULT_MAX_SIZE
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging configuration
///
/// `RUST_LOG`, when set, takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
