//! Process configuration for the kiln process orchestrator.
//!
//! - [`ProcessConfig`] - Read-only configuration shared by every component
//! - [`ConfigLoader`] - Layered resolution from defaults, file and environment
//! - [`RetryPolicy`] - Per-item retry policy for download jobs
//! - [`ManifestLocation`] - Where the download source list comes from

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod error;
mod loader;

pub use config::{
    Backoff, ConsoleSettings, DownloadSettings, ManifestLocation, ProcessConfig, RetryPolicy,
    ServerSettings,
};
pub use error::{ConfigError, Result};
pub use loader::{CONFIG_FILE_ENV, ConfigLoader, DEFAULT_CONFIG_FILE, RECOGNIZED_KEYS, Resolved};
