//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while resolving the process configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the config file.
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        /// The path that could not be parsed.
        path: PathBuf,
        /// The underlying TOML error.
        source: toml::de::Error,
    },

    /// A required key has no value in any layer.
    #[error("Missing required config key '{key}' (set it in the config file or via {env})")]
    MissingKey {
        /// The dotted config key.
        key: &'static str,
        /// The environment variable that can supply it.
        env: &'static str,
    },

    /// A key has a value that cannot be used.
    #[error("Invalid value '{value}' for config key '{key}': {reason}")]
    InvalidValue {
        /// The dotted config key.
        key: &'static str,
        /// The rejected value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Returns the config key (or file path) responsible for the error.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::ReadFile { path, .. } | Self::Parse { path, .. } => path.display().to_string(),
            Self::MissingKey { key, .. } | Self::InvalidValue { key, .. } => (*key).to_string(),
        }
    }

    pub(crate) fn invalid(key: &'static str, value: impl ToString, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
