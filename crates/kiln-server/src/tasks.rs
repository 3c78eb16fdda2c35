//! Built-in scheduled tasks.

use crate::resources::write_snapshot;
use crate::{ResourceError, ScheduledTask, TaskContext, TaskError};
use async_trait::async_trait;
use chrono::Utc;
use kiln_jobs::ReportStore;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Publishes the server snapshot to `server-status.json`.
#[derive(Debug)]
pub struct StatusSnapshot {
    interval: Duration,
}

impl StatusSnapshot {
    /// Creates the task with the given publishing interval.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl ScheduledTask for StatusSnapshot {
    fn name(&self) -> &str {
        "status-snapshot"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let path = ctx.config().status_file();
        write_snapshot(&path, &ctx.state().snapshot()).map_err(|e| match e {
            ResourceError::Serialize(e) => TaskError::Serialize(e),
            ResourceError::Io { action, path, source } => TaskError::Io { action, path, source },
            other => TaskError::msg(other.to_string()),
        })
    }
}

/// Deletes job reports older than the configured retention.
#[derive(Debug)]
pub struct ReportRetention {
    retention: Duration,
}

impl ReportRetention {
    /// Runs hourly.
    pub const INTERVAL: Duration = Duration::from_secs(60 * 60);

    /// Creates the task with the given retention.
    #[must_use]
    pub const fn new(retention: Duration) -> Self {
        Self { retention }
    }
}

#[async_trait]
impl ScheduledTask for ReportRetention {
    fn name(&self) -> &str {
        "report-retention"
    }

    fn interval(&self) -> Duration {
        Self::INTERVAL
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| TaskError::msg(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now() - retention;
        let store = ReportStore::open(ctx.config().reports_dir());

        let pruned = tokio::task::spawn_blocking(move || store.prune(cutoff))
            .await
            .map_err(|e| TaskError::msg(e.to_string()))??;

        if pruned.is_empty() {
            debug!("no reports past retention");
        } else {
            info!(count = pruned.len(), "pruned old job reports");
        }
        Ok(())
    }
}

/// Requests a reload when the config file's modification time changes.
#[derive(Debug)]
pub struct ConfigWatch {
    path: PathBuf,
    interval: Duration,
    seen: Mutex<Option<SystemTime>>,
}

impl ConfigWatch {
    /// Default polling interval.
    pub const INTERVAL: Duration = Duration::from_secs(1);

    /// Watches `path`, taking its current modification time as the baseline.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let seen = modified(&path);
        Self {
            path,
            interval: Self::INTERVAL,
            seen: Mutex::new(seen),
        }
    }

    /// Overrides the polling interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[async_trait]
impl ScheduledTask for ConfigWatch {
    fn name(&self) -> &str {
        "config-watch"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        let current = modified(&self.path);
        let changed = {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| TaskError::msg("config-watch state poisoned"))?;
            let changed = *seen != current;
            *seen = current;
            changed
        };

        if changed {
            info!(path = %self.path.display(), "configuration changed, requesting reload");
            ctx.request_reload();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;
    use kiln_config::ProcessConfig;
    use kiln_types::Profile;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn ctx(dir: &std::path::Path, reload: &CancellationToken) -> TaskContext {
        TaskContext::new(
            Arc::new(ProcessConfig::with_data_dir(dir)),
            SharedState::new(Profile::Development).view(),
            CancellationToken::new(),
            reload.clone(),
        )
    }

    #[tokio::test]
    async fn test_status_snapshot_writes_file() {
        let temp = TempDir::new().unwrap();
        let reload = CancellationToken::new();
        let ctx = ctx(temp.path(), &reload);

        StatusSnapshot::new(Duration::from_secs(15)).run(&ctx).await.unwrap();

        let snapshot = crate::read_status_file(&ctx.config().status_file()).unwrap();
        assert_eq!(snapshot.profile, Profile::Development);
    }

    #[tokio::test]
    async fn test_status_snapshot_reports_io_failure() {
        let temp = TempDir::new().unwrap();
        let reload = CancellationToken::new();
        let ctx = ctx(&temp.path().join("missing"), &reload);

        let err = StatusSnapshot::new(Duration::from_secs(15)).run(&ctx).await.unwrap_err();
        assert!(matches!(err, TaskError::Io { .. }));
    }

    #[tokio::test]
    async fn test_config_watch_requests_reload_on_change() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("kiln.toml");
        std::fs::write(&file, "workers = 4\n").unwrap();
        let reload = CancellationToken::new();
        let ctx = ctx(temp.path(), &reload);
        let watch = ConfigWatch::new(&file);

        watch.run(&ctx).await.unwrap();
        assert!(!reload.is_cancelled());

        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();

        watch.run(&ctx).await.unwrap();
        assert!(reload.is_cancelled());
    }

    #[tokio::test]
    async fn test_report_retention_runs_on_empty_store() {
        let temp = TempDir::new().unwrap();
        let reload = CancellationToken::new();
        ReportRetention::new(Duration::from_secs(3600))
            .run(&ctx(temp.path(), &reload))
            .await
            .unwrap();
    }
}
