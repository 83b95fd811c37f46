//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("failed to read config file at {path}: {source}")]
    FileRead {
        /// Path that failed to read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML configuration
    #[error("failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// The WAL path is empty
    #[error("wal_file must not be empty")]
    EmptyWalFile,

    /// A queue capacity is zero
    #[error("invalid queue capacity: {name} must be positive")]
    InvalidQueueCapacity {
        /// Name of the offending setting
        name: &'static str,
    },

    /// The double-sign lookback exceeds the sane bound
    #[error("double_sign_check_height too large: {0} (max 10000)")]
    DoubleSignCheckTooLarge(u64),
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
