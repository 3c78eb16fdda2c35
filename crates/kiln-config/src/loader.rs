//! Layered configuration loading: defaults, config file, environment.

use crate::config::{Backoff, ConsoleSettings, ManifestLocation, ProcessConfig, RetryPolicy};
use crate::error::{ConfigError, Result};
use directories::ProjectDirs;
use kiln_types::Mode;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_FILE_ENV: &str = "KILN_CONFIG";

/// Config file picked up from the working directory when nothing else is set.
pub const DEFAULT_CONFIG_FILE: &str = "kiln.toml";

/// Every recognized config key with the environment variable that overrides it.
pub const RECOGNIZED_KEYS: &[(&str, &str)] = &[
    ("data_dir", "KILN_DATA_DIR"),
    ("downloads.destination", "KILN_DOWNLOAD_DIR"),
    ("downloads.manifest", "KILN_MANIFEST"),
    ("downloads.workers", "KILN_WORKERS"),
    ("downloads.request_timeout_secs", "KILN_REQUEST_TIMEOUT_SECS"),
    ("retry.max_retries", "KILN_MAX_RETRIES"),
    ("retry.backoff", "KILN_BACKOFF"),
    ("retry.base_delay_ms", "KILN_RETRY_BASE_DELAY_MS"),
    ("retry.max_delay_ms", "KILN_RETRY_MAX_DELAY_MS"),
    ("shutdown.grace_period_secs", "KILN_GRACE_PERIOD_SECS"),
    ("server.drain_timeout_secs", "KILN_DRAIN_TIMEOUT_SECS"),
    ("server.status_interval_secs", "KILN_STATUS_INTERVAL_SECS"),
    ("server.report_retention_hours", "KILN_REPORT_RETENTION_HOURS"),
    ("server.require_artifacts", "KILN_REQUIRE_ARTIFACTS"),
    ("console.history", "KILN_CONSOLE_HISTORY"),
];

fn env_name(key: &str) -> &'static str {
    RECOGNIZED_KEYS
        .iter()
        .find(|(k, _)| *k == key)
        .map_or("KILN_*", |&(_, env)| env)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    data_dir: Option<PathBuf>,
    downloads: RawDownloads,
    retry: RawRetry,
    shutdown: RawShutdown,
    server: RawServer,
    console: RawConsole,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDownloads {
    destination: Option<PathBuf>,
    manifest: Option<String>,
    workers: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRetry {
    max_retries: Option<u32>,
    backoff: Option<String>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawShutdown {
    grace_period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawServer {
    drain_timeout_secs: Option<u64>,
    status_interval_secs: Option<u64>,
    report_retention_hours: Option<u64>,
    require_artifacts: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConsole {
    history: Option<bool>,
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, value, e))
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean")),
    }
}

impl RawConfig {
    /// Applies a single string-valued setting from the environment or CLI.
    fn set(&mut self, key: &'static str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = Some(PathBuf::from(value)),
            "downloads.destination" => self.downloads.destination = Some(PathBuf::from(value)),
            "downloads.manifest" => self.downloads.manifest = Some(value.to_string()),
            "downloads.workers" => self.downloads.workers = Some(parse_num(key, value)?),
            "downloads.request_timeout_secs" => {
                self.downloads.request_timeout_secs = Some(parse_num(key, value)?);
            }
            "retry.max_retries" => self.retry.max_retries = Some(parse_num(key, value)?),
            "retry.backoff" => self.retry.backoff = Some(value.to_string()),
            "retry.base_delay_ms" => self.retry.base_delay_ms = Some(parse_num(key, value)?),
            "retry.max_delay_ms" => self.retry.max_delay_ms = Some(parse_num(key, value)?),
            "shutdown.grace_period_secs" => {
                self.shutdown.grace_period_secs = Some(parse_num(key, value)?);
            }
            "server.drain_timeout_secs" => {
                self.server.drain_timeout_secs = Some(parse_num(key, value)?);
            }
            "server.status_interval_secs" => {
                self.server.status_interval_secs = Some(parse_num(key, value)?);
            }
            "server.report_retention_hours" => {
                self.server.report_retention_hours = Some(parse_num(key, value)?);
            }
            "server.require_artifacts" => {
                self.server.require_artifacts = Some(parse_bool(key, value)?);
            }
            "console.history" => self.console.history = Some(parse_bool(key, value)?),
            _ => return Err(ConfigError::invalid(key, value, "unrecognized key")),
        }
        Ok(())
    }

    fn into_config(self, mode: Mode, source_file: Option<PathBuf>) -> Result<ProcessConfig> {
        let data_dir = self.data_dir.ok_or(ConfigError::MissingKey {
            key: "data_dir",
            env: env_name("data_dir"),
        })?;
        if data_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("data_dir", "", "must not be empty"));
        }

        let mut config = ProcessConfig::with_data_dir(&data_dir);
        config.source_file = source_file;

        if let Some(destination) = self.downloads.destination {
            config.downloads.destination = destination;
        }

        config.downloads.manifest = self
            .downloads
            .manifest
            .map(|m| {
                m.parse::<ManifestLocation>()
                    .map_err(|e| ConfigError::invalid("downloads.manifest", &m, e))
            })
            .transpose()?;
        if mode == Mode::DownloadFiles && config.downloads.manifest.is_none() {
            return Err(ConfigError::MissingKey {
                key: "downloads.manifest",
                env: env_name("downloads.manifest"),
            });
        }

        if let Some(workers) = self.downloads.workers {
            if workers == 0 {
                return Err(ConfigError::invalid("downloads.workers", 0, "must be at least 1"));
            }
            config.downloads.workers = usize::try_from(workers)
                .map_err(|e| ConfigError::invalid("downloads.workers", workers, e))?;
        }

        if let Some(secs) = self.downloads.request_timeout_secs {
            config.downloads.request_timeout = positive_secs("downloads.request_timeout_secs", secs)?;
        }

        config.downloads.retry = resolve_retry(self.retry)?;

        if let Some(secs) = self.shutdown.grace_period_secs {
            config.grace_period = positive_secs("shutdown.grace_period_secs", secs)?;
        }

        if let Some(secs) = self.server.drain_timeout_secs {
            config.server.drain_timeout = Duration::from_secs(secs);
        }
        config.server.drain_timeout = config
            .server
            .drain_timeout
            .min(drain_ceiling(config.grace_period));

        if let Some(secs) = self.server.status_interval_secs {
            config.server.status_interval = positive_secs("server.status_interval_secs", secs)?;
        }
        if let Some(hours) = self.server.report_retention_hours {
            config.server.report_retention = Duration::from_secs(hours.saturating_mul(3600));
        }
        if let Some(require) = self.server.require_artifacts {
            config.server.require_artifacts = require;
        }

        config.console = ConsoleSettings {
            history: self.console.history.unwrap_or(true),
        };

        Ok(config)
    }
}

/// Longest drain that still leaves a fifth of the grace period for releasing
/// resources.
fn drain_ceiling(grace_period: Duration) -> Duration {
    grace_period.saturating_sub(grace_period / 5)
}

fn positive_secs(key: &'static str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(ConfigError::invalid(key, secs, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

fn resolve_retry(raw: RawRetry) -> Result<RetryPolicy> {
    let mut policy = RetryPolicy::default();
    if let Some(max_retries) = raw.max_retries {
        policy.max_retries = max_retries;
    }
    if let Some(backoff) = raw.backoff {
        policy.backoff = backoff
            .parse::<Backoff>()
            .map_err(|e| ConfigError::invalid("retry.backoff", &backoff, e))?;
    }
    if let Some(ms) = raw.base_delay_ms {
        policy.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = raw.max_delay_ms {
        policy.max_delay = Duration::from_millis(ms);
    }
    if policy.max_delay < policy.base_delay {
        return Err(ConfigError::invalid(
            "retry.max_delay_ms",
            policy.max_delay.as_millis(),
            "must not be smaller than retry.base_delay_ms",
        ));
    }
    Ok(policy)
}

/// Collects dotted keys present in `table` that are not recognized.
fn unknown_keys(table: &toml::Table, prefix: &str, out: &mut Vec<String>) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        if RECOGNIZED_KEYS.iter().any(|(k, _)| *k == key) {
            continue;
        }
        let is_section = RECOGNIZED_KEYS
            .iter()
            .any(|(k, _)| k.starts_with(&format!("{key}.")));
        match value {
            toml::Value::Table(inner) if is_section => unknown_keys(inner, &key, out),
            _ => out.push(key),
        }
    }
}

/// A resolved configuration together with the keys that were ignored.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// The frozen process configuration.
    pub config: ProcessConfig,
    /// Unrecognized keys found in the config file.
    pub ignored_keys: Vec<String>,
}

/// Assembles a [`ProcessConfig`] from defaults, a config file and the
/// environment.
///
/// Loading reads files but never creates anything, so a failed resolution
/// leaves no trace on disk.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: HashMap<String, String>,
    overrides: Vec<(&'static str, String)>,
    working_dir: Option<PathBuf>,
}

impl ConfigLoader {
    /// Creates a loader with no file and an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a loader reading `KILN_*` variables from the process environment.
    #[must_use]
    pub fn from_process_env() -> Self {
        Self::new().with_env(std::env::vars().filter(|(k, _)| k.starts_with("KILN_")))
    }

    /// Uses the given environment instead of the process environment.
    #[must_use]
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = env.into_iter().collect();
        self
    }

    /// Reads values from an explicit config file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Directory searched for `kiln.toml` when no file is named.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds a command-line override, which wins over every other layer.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is not a recognized config key.
    pub fn with_override(mut self, key: &str, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let Some(&(key, _)) = RECOGNIZED_KEYS.iter().find(|(k, _)| *k == key) else {
            return Err(ConfigError::InvalidValue {
                key: "<override>",
                value: key.to_string(),
                reason: "unrecognized key".to_string(),
            });
        };
        self.overrides.push((key, value));
        Ok(self)
    }

    /// Returns the config file that will be read, if any.
    ///
    /// An explicitly named file is always returned (and must exist); the
    /// working-directory default is only returned when present.
    #[must_use]
    pub fn config_file(&self) -> Option<PathBuf> {
        if let Some(file) = &self.file {
            return Some(file.clone());
        }
        if let Some(file) = self.env.get(CONFIG_FILE_ENV).filter(|f| !f.is_empty()) {
            return Some(PathBuf::from(file));
        }
        let default = self
            .working_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
            .join(DEFAULT_CONFIG_FILE);
        default.is_file().then_some(default)
    }

    /// Resolves the configuration for `mode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, a
    /// required key is missing, or a value is invalid.
    pub fn load(&self, mode: Mode) -> Result<Resolved> {
        let file = self.config_file();
        let (mut raw, ignored_keys) = match &file {
            Some(path) => read_file(path)?,
            None => (RawConfig::default(), Vec::new()),
        };

        for &(key, env) in RECOGNIZED_KEYS {
            if let Some(value) = self.env.get(env) {
                raw.set(key, value)?;
            }
        }
        for (key, value) in &self.overrides {
            raw.set(*key, value)?;
        }

        let config = raw.into_config(mode, file)?;
        Ok(Resolved {
            config,
            ignored_keys,
        })
    }

    /// Suggested data directory for the current platform.
    #[must_use]
    pub fn suggested_data_dir() -> PathBuf {
        ProjectDirs::from("", "", "kiln").map_or_else(
            || PathBuf::from(".kiln"),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }
}

fn read_file(path: &Path) -> Result<(RawConfig, Vec<String>)> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let table: toml::Table = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut ignored = Vec::new();
    unknown_keys(&table, "", &mut ignored);
    ignored.sort();

    let raw: RawConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok((raw, ignored))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("kiln.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_missing_data_dir_is_fatal() {
        let temp = TempDir::new().unwrap();
        let err = ConfigLoader::new()
            .with_working_dir(temp.path())
            .load(Mode::Start)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { key: "data_dir", .. }));
        assert_eq!(err.key(), "data_dir");
    }

    #[test]
    fn test_env_only_configuration() {
        let temp = TempDir::new().unwrap();
        let resolved = ConfigLoader::new()
            .with_working_dir(temp.path())
            .with_env(env(&[("KILN_DATA_DIR", "/srv/kiln"), ("KILN_WORKERS", "8")]))
            .load(Mode::Start)
            .unwrap();

        let config = resolved.config;
        assert_eq!(config.data_dir, PathBuf::from("/srv/kiln"));
        assert_eq!(config.downloads.workers, 8);
        assert_eq!(config.downloads.destination, PathBuf::from("/srv/kiln/files"));
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert!(config.source_file.is_none());
    }

    #[test]
    fn test_file_values_and_env_precedence() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
data_dir = "/var/lib/kiln"

[downloads]
manifest = "https://models.example.com/manifest.json"
workers = 2

[retry]
max_retries = 3
backoff = "exponential"

[shutdown]
grace_period_secs = 20
"#,
        );

        let resolved = ConfigLoader::new()
            .with_file(&path)
            .with_env(env(&[("KILN_WORKERS", "6")]))
            .load(Mode::DownloadFiles)
            .unwrap();
        let config = resolved.config;

        assert_eq!(config.downloads.workers, 6);
        assert_eq!(config.downloads.retry.max_retries, 3);
        assert_eq!(config.downloads.retry.backoff, Backoff::Exponential);
        assert_eq!(config.grace_period, Duration::from_secs(20));
        assert_eq!(
            config.downloads.manifest,
            Some(ManifestLocation::Remote(
                "https://models.example.com/manifest.json".into()
            ))
        );
        assert_eq!(config.source_file, Some(path));
    }

    #[test]
    fn test_unknown_keys_are_ignored_and_reported() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
data_dir = "/var/lib/kiln"
livekit_url = "wss://example"

[downloads]
workers = 3
chunk_size = 12

[telemetry]
endpoint = "http://otel"
"#,
        );

        let resolved = ConfigLoader::new()
            .with_file(&path)
            .load(Mode::Start)
            .unwrap();
        assert_eq!(resolved.config.downloads.workers, 3);
        assert_eq!(
            resolved.ignored_keys,
            vec!["downloads.chunk_size", "livekit_url", "telemetry"]
        );
    }

    #[test]
    fn test_manifest_required_only_for_download_mode() {
        let temp = TempDir::new().unwrap();
        let loader = ConfigLoader::new()
            .with_working_dir(temp.path())
            .with_env(env(&[("KILN_DATA_DIR", "/srv/kiln")]));

        assert!(loader.load(Mode::Console).is_ok());
        let err = loader.load(Mode::DownloadFiles).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingKey {
                key: "downloads.manifest",
                env: "KILN_MANIFEST"
            }
        ));
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let temp = TempDir::new().unwrap();
        let base = ConfigLoader::new().with_working_dir(temp.path());

        let err = base
            .clone()
            .with_env(env(&[("KILN_DATA_DIR", "/srv"), ("KILN_WORKERS", "0")]))
            .load(Mode::Start)
            .unwrap_err();
        assert_eq!(err.key(), "downloads.workers");

        let err = base
            .clone()
            .with_env(env(&[("KILN_DATA_DIR", "/srv"), ("KILN_BACKOFF", "linear")]))
            .load(Mode::Start)
            .unwrap_err();
        assert_eq!(err.key(), "retry.backoff");

        let err = base
            .with_env(env(&[("KILN_DATA_DIR", "/srv"), ("KILN_GRACE_PERIOD_SECS", "soon")]))
            .load(Mode::Start)
            .unwrap_err();
        assert_eq!(err.key(), "shutdown.grace_period_secs");
    }

    #[test]
    fn test_drain_timeout_stays_below_grace_period() {
        let temp = TempDir::new().unwrap();
        let load = |grace: &str, drain: &str| {
            ConfigLoader::new()
                .with_working_dir(temp.path())
                .with_env(env(&[
                    ("KILN_DATA_DIR", "/srv"),
                    ("KILN_GRACE_PERIOD_SECS", grace),
                    ("KILN_DRAIN_TIMEOUT_SECS", drain),
                ]))
                .load(Mode::Start)
                .unwrap()
                .config
        };

        let config = load("2", "30");
        assert!(config.server.drain_timeout < config.grace_period);
        assert_eq!(config.server.drain_timeout, Duration::from_millis(1600));

        let config = load("2", "2");
        assert_eq!(config.server.drain_timeout, Duration::from_millis(1600));

        let config = load("10", "5");
        assert_eq!(config.server.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides_win_over_env() {
        let temp = TempDir::new().unwrap();
        let config = ConfigLoader::new()
            .with_working_dir(temp.path())
            .with_env(env(&[
                ("KILN_DATA_DIR", "/srv"),
                ("KILN_MANIFEST", "/etc/kiln/manifest.json"),
            ]))
            .with_override("downloads.manifest", "https://cdn.example.com/m.json")
            .unwrap()
            .load(Mode::DownloadFiles)
            .unwrap()
            .config;
        assert_eq!(
            config.downloads.manifest,
            Some(ManifestLocation::Remote("https://cdn.example.com/m.json".into()))
        );

        assert!(ConfigLoader::new().with_override("nope", "1").is_err());
    }

    #[test]
    fn test_default_file_in_working_dir() {
        let temp = TempDir::new().unwrap();
        write_config(&temp, "data_dir = \"/from/file\"\n");
        let loader = ConfigLoader::new().with_working_dir(temp.path());
        assert_eq!(loader.config_file(), Some(temp.path().join("kiln.toml")));
        assert_eq!(
            loader.load(Mode::Start).unwrap().config.data_dir,
            PathBuf::from("/from/file")
        );
    }

    #[test]
    fn test_load_creates_nothing() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("state");
        let config = ConfigLoader::new()
            .with_working_dir(temp.path())
            .with_env(vec![(
                "KILN_DATA_DIR".to_string(),
                data_dir.display().to_string(),
            )])
            .load(Mode::Start)
            .unwrap()
            .config;
        assert_eq!(config.data_dir, data_dir);
        assert!(!data_dir.exists());
    }
}
