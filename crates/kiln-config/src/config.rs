//! The resolved, read-only process configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// The same delay before every retry.
    #[default]
    Fixed,
    /// The delay doubles after every attempt, up to a cap.
    Exponential,
}

impl Backoff {
    /// Returns the backoff as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        }
    }
}

impl std::fmt::Display for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" | "exp" => Ok(Self::Exponential),
            _ => Err("expected 'fixed' or 'exponential'".to_string()),
        }
    }
}

/// Per-item retry policy for download jobs.
///
/// The default performs no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay growth strategy.
    pub backoff: Backoff,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns the delay to wait before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let millis = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                base.saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
            }
        };
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Returns the total number of attempts allowed (first try plus retries).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Where the download source list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLocation {
    /// An HTTP(S) endpoint serving the manifest.
    Remote(String),
    /// A manifest file on the local filesystem.
    Local(PathBuf),
}

impl FromStr for ManifestLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("manifest location is empty".to_string());
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            Ok(Self::Remote(s.to_string()))
        } else {
            Ok(Self::Local(PathBuf::from(s)))
        }
    }
}

impl std::fmt::Display for ManifestLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{url}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Settings for the `download-files` job.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Directory the fetched files land in.
    pub destination: PathBuf,
    /// Source list location. Required only by the download job.
    pub manifest: Option<ManifestLocation>,
    /// Maximum number of items fetched concurrently.
    pub workers: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Per-item retry policy.
    pub retry: RetryPolicy,
}

/// Settings for the server loop.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Bounded wait for in-flight tasks once draining starts.
    pub drain_timeout: Duration,
    /// Interval between status snapshot writes.
    pub status_interval: Duration,
    /// Age after which persisted job reports are pruned.
    pub report_retention: Duration,
    /// Refuse to start unless the required downloaded files are present.
    pub require_artifacts: bool,
}

/// Settings for the operator console.
#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    /// Persist readline history under the data directory.
    pub history: bool,
}

/// Process-wide configuration, assembled once at startup.
///
/// Read-only after construction; share it behind an `Arc` with every
/// component started in the process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Root directory for all persisted state.
    pub data_dir: PathBuf,
    /// Download job settings.
    pub downloads: DownloadSettings,
    /// Server loop settings.
    pub server: ServerSettings,
    /// Console settings.
    pub console: ConsoleSettings,
    /// Time allowed for cooperative shutdown before forced termination.
    pub grace_period: Duration,
    /// The config file the values were read from, if any.
    pub source_file: Option<PathBuf>,
}

impl ProcessConfig {
    /// Directory holding persisted job reports.
    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    /// Directory holding log files.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Path of the status snapshot written by the server loop.
    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.data_dir.join("server-status.json")
    }

    /// Path of the lock file guarding the data directory.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("kiln.lock")
    }

    /// Path of the console's readline history.
    #[must_use]
    pub fn history_file(&self) -> PathBuf {
        self.data_dir.join("console_history.txt")
    }

    /// Returns the data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Lists every recognized option with its effective value.
    ///
    /// Logged at startup and shown by the console `config` command.
    #[must_use]
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let retry = &self.downloads.retry;
        vec![
            ("data_dir", self.data_dir.display().to_string()),
            (
                "downloads.destination",
                self.downloads.destination.display().to_string(),
            ),
            (
                "downloads.manifest",
                self.downloads
                    .manifest
                    .as_ref()
                    .map_or_else(|| "<unset>".to_string(), ToString::to_string),
            ),
            ("downloads.workers", self.downloads.workers.to_string()),
            (
                "downloads.request_timeout_secs",
                self.downloads.request_timeout.as_secs().to_string(),
            ),
            ("retry.max_retries", retry.max_retries.to_string()),
            ("retry.backoff", retry.backoff.to_string()),
            (
                "retry.base_delay_ms",
                retry.base_delay.as_millis().to_string(),
            ),
            ("retry.max_delay_ms", retry.max_delay.as_millis().to_string()),
            (
                "shutdown.grace_period_secs",
                self.grace_period.as_secs().to_string(),
            ),
            (
                "server.drain_timeout_secs",
                self.server.drain_timeout.as_secs().to_string(),
            ),
            (
                "server.status_interval_secs",
                self.server.status_interval.as_secs().to_string(),
            ),
            (
                "server.report_retention_hours",
                (self.server.report_retention.as_secs() / 3600).to_string(),
            ),
            (
                "server.require_artifacts",
                self.server.require_artifacts.to_string(),
            ),
            ("console.history", self.console.history.to_string()),
        ]
    }

    /// Builds a configuration rooted at `data_dir` with every other value
    /// at its default.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            downloads: DownloadSettings {
                destination: data_dir.join("files"),
                manifest: None,
                workers: 4,
                request_timeout: Duration::from_secs(10),
                retry: RetryPolicy::default(),
            },
            server: ServerSettings {
                drain_timeout: Duration::from_secs(5),
                status_interval: Duration::from_secs(15),
                report_retention: Duration::from_secs(168 * 3600),
                require_artifacts: false,
            },
            console: ConsoleSettings { history: true },
            grace_period: Duration::from_secs(10),
            source_file: None,
            data_dir,
        }
    }
}
