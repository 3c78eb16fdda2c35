//! Server, resource and task errors.

use kiln_jobs::StoreError;
use kiln_types::KilnError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Fatal server errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A resource could not be acquired. Resources acquired before it have
    /// already been released.
    #[error("failed to acquire resource '{resource}': {source}")]
    Startup {
        /// Name of the resource that failed.
        resource: String,
        /// Why it failed.
        source: ResourceError,
    },
}

impl From<ServerError> for KilnError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Startup { resource, source } => Self::startup(resource, source.to_string()),
        }
    }
}

/// Errors raised while acquiring or releasing a resource.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// A filesystem operation failed.
    #[error("{action} '{path}': {source}")]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Another process holds the lock.
    #[error("'{path}' is locked by {}", .holder.map_or_else(|| "another process".to_string(), |pid| format!("pid {pid}")))]
    Locked {
        /// The lock file.
        path: PathBuf,
        /// PID recorded in the lock file, if readable.
        holder: Option<u32>,
    },

    /// A required artifact is missing or does not match its recorded checksum.
    #[error("artifact '{name}' at '{path}' is not usable: {reason}")]
    Artifact {
        /// Item name.
        name: String,
        /// Expected location.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// No download report exists to verify artifacts against.
    #[error("no download report found in '{0}', run download-files first")]
    NoReport(PathBuf),

    /// The report store could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serializing the server snapshot failed.
    #[error("failed to serialize server status: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ResourceError {
    /// Creates an I/O error for `action` on `path`.
    pub fn io(action: &'static str, path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io { action, path: path.as_ref().to_path_buf(), source }
    }
}

/// A failed run of a scheduled task.
#[derive(Error, Debug)]
pub enum TaskError {
    /// A filesystem operation failed.
    #[error("{action} '{path}': {source}")]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The report store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serializing output failed.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    /// Creates a free-form task failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
