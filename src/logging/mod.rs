//! Logging setup
//!
//! Installs a `tracing` subscriber built from layers:
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, falling back to logging.level)
//!   └── Fmt Layer (json or pretty console output)
//! ```

use crate::config::{LogFormat, LoggingConfig};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Errors that can occur while installing the subscriber
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    InvalidFilter(String, String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}

/// Build the level filter: `RUST_LOG` wins over the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| LoggingError::InvalidFilter(config.level.clone(), e.to_string()))
}

/// Install the global subscriber
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), LoggingError> {
    let registry = tracing_subscriber::registry().with(env_filter(config)?);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init(),
    };

    result.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
