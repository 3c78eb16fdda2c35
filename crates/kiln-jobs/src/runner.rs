//! Runs a download job to completion.

use crate::{
    Artifact, DownloadJob, ItemError, ItemReport, ItemStatus, JobError, JobOutcome, JobStatus,
    Report, ReportStore,
};
use futures::stream::{self, StreamExt};
use kiln_config::{DownloadSettings, RetryPolicy};
use kiln_fetch::{Fetch, FetchError, SourceItem, digests_match, fetch_with_retry, sha256_file, sha256_hex};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback invoked once per finished item.
pub type ItemCallback = Arc<dyn Fn(&ItemReport) + Send + Sync>;

/// Executes [`DownloadJob`]s with bounded concurrency.
///
/// Items run at most `workers` at a time. Results are collected in source-list
/// order regardless of completion order, and a failing item never stops the
/// others. Re-running a job over the same destination skips items that are
/// already present and valid.
pub struct JobRunner<F: ?Sized> {
    fetcher: Arc<F>,
    workers: usize,
    retry: RetryPolicy,
    store: Option<ReportStore>,
    on_item: Option<ItemCallback>,
}

impl<F: ?Sized> std::fmt::Debug for JobRunner<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("workers", &self.workers)
            .field("retry", &self.retry)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<F> JobRunner<F>
where
    F: Fetch + ?Sized,
{
    /// Creates a runner with no report store.
    #[must_use]
    pub fn new(fetcher: Arc<F>, workers: usize, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
            retry,
            store: None,
            on_item: None,
        }
    }

    /// Creates a runner from download settings.
    #[must_use]
    pub fn from_settings(fetcher: Arc<F>, settings: &DownloadSettings) -> Self {
        Self::new(fetcher, settings.workers, settings.retry)
    }

    /// Persists every report to `store`.
    #[must_use]
    pub fn with_store(mut self, store: ReportStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers a callback invoked as each item finishes.
    #[must_use]
    pub fn on_item(mut self, callback: ItemCallback) -> Self {
        self.on_item = Some(callback);
        self
    }

    /// Returns the worker count.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Runs the job.
    ///
    /// Items still pending when `cancel` fires are reported as cancelled; a
    /// fetch in flight is abandoned and leaves no partial file behind.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Failed`] or [`JobError::Cancelled`] carrying the
    /// persisted report, or an error if the destination cannot be created or
    /// the report cannot be saved.
    pub async fn execute(
        &self,
        mut job: DownloadJob,
        cancel: &CancellationToken,
    ) -> Result<Report, JobError> {
        job.mark_started();
        info!(
            job_id = %job.id,
            items = job.items.len(),
            workers = self.workers,
            destination = %job.destination.display(),
            "starting download job"
        );

        tokio::fs::create_dir_all(&job.destination)
            .await
            .map_err(|e| JobError::Destination {
                path: job.destination.clone(),
                source: e,
            })?;

        let items: Vec<ItemReport> = stream::iter(&job.items)
            .map(|item| self.run_item(&job, item, cancel))
            .buffered(self.workers)
            .collect()
            .await;

        let outcome = JobOutcome::from_items(&items);
        job.mark_finished(match outcome {
            JobOutcome::Succeeded | JobOutcome::SucceededWithPartialFailures => {
                JobStatus::Completed
            }
            JobOutcome::Failed => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        });

        let report = Report::new(&job, items);
        if let Some(store) = &self.store {
            store.save(&report).map_err(|e| JobError::Store {
                job_id: job.id,
                source: e,
            })?;
        }

        let counts = report.counts();
        info!(
            job_id = %job.id,
            outcome = %report.outcome,
            fetched = counts.fetched,
            skipped = counts.skipped,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "download job finished"
        );

        match outcome {
            JobOutcome::Succeeded | JobOutcome::SucceededWithPartialFailures => Ok(report),
            JobOutcome::Failed => Err(JobError::Failed {
                report: Box::new(report),
            }),
            JobOutcome::Cancelled => Err(JobError::Cancelled {
                report: Box::new(report),
            }),
        }
    }

    async fn run_item(
        &self,
        job: &DownloadJob,
        item: &SourceItem,
        cancel: &CancellationToken,
    ) -> ItemReport {
        let target = job.target_path(item);
        let mut report = ItemReport {
            name: item.name.clone(),
            path: target.clone(),
            status: ItemStatus::Cancelled,
            required: item.required,
            attempts: 0,
            artifact: None,
            error: None,
        };

        if cancel.is_cancelled() {
            self.notify(&report);
            return report;
        }

        if let Some(artifact) = existing_artifact(&target, item.sha256.as_deref()).await {
            debug!(item = %item.name, path = %target.display(), "already present, skipping");
            report.status = ItemStatus::Skipped;
            report.artifact = Some(artifact);
            self.notify(&report);
            return report;
        }

        let attempted = fetch_with_retry(&*self.fetcher, &item.url, &self.retry, cancel).await;
        report.attempts = attempted.attempts;

        let result = match attempted.result {
            Err(FetchError::Cancelled) => {
                debug!(item = %item.name, "fetch abandoned on cancellation");
                self.notify(&report);
                return report;
            }
            Err(e) => Err(ItemError::Fetch(e)),
            Ok(bytes) => {
                let expected = item.sha256.clone();
                let path = target.clone();
                tokio::task::spawn_blocking(move || {
                    write_verified(&path, &bytes, expected.as_deref())
                })
                .await
                .unwrap_or_else(|e| {
                    Err(ItemError::Write {
                        path: target.clone(),
                        source: std::io::Error::other(e),
                    })
                })
            }
        };

        match result {
            Ok(artifact) => {
                debug!(item = %item.name, bytes = artifact.bytes, "fetched");
                report.status = ItemStatus::Fetched;
                report.artifact = Some(artifact);
            }
            Err(e) => {
                warn!(
                    item = %item.name,
                    url = %item.url,
                    attempts = report.attempts,
                    required = item.required,
                    error = %e,
                    "item failed"
                );
                report.status = ItemStatus::Failed;
                report.error = Some(e.to_string());
            }
        }

        self.notify(&report);
        report
    }

    fn notify(&self, report: &ItemReport) {
        if let Some(callback) = &self.on_item {
            callback(report);
        }
    }
}

/// Returns the artifact at `path` if it can be reused.
///
/// A file with no declared checksum is reused as-is. A file whose digest
/// differs from the declared one is not, and will be overwritten.
async fn existing_artifact(path: &Path, expected: Option<&str>) -> Option<Artifact> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    let owned = path.to_path_buf();
    let digest = match tokio::task::spawn_blocking(move || sha256_file(&owned)).await {
        Ok(Ok(digest)) => digest,
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "cannot hash existing file, re-fetching");
            return None;
        }
        Err(_) => return None,
    };

    if let Some(expected) = expected {
        if !digests_match(expected, &digest) {
            info!(path = %path.display(), "checksum mismatch on existing file, re-fetching");
            return None;
        }
    }

    Some(Artifact {
        bytes: metadata.len(),
        sha256: digest,
    })
}

/// Verifies `bytes` and moves them into place through a `.part` file.
fn write_verified(path: &Path, bytes: &[u8], expected: Option<&str>) -> Result<Artifact, ItemError> {
    let digest = sha256_hex(bytes);
    if let Some(expected) = expected {
        if !digests_match(expected, &digest) {
            return Err(ItemError::ChecksumMismatch {
                expected: expected.to_string(),
                actual: digest,
            });
        }
    }

    let write_err = |source| ItemError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let part = part_path(path);
    fs::write(&part, bytes).map_err(write_err)?;
    if let Err(e) = fs::rename(&part, path) {
        let _ = fs::remove_file(&part);
        return Err(write_err(e));
    }

    Ok(Artifact {
        bytes: bytes.len() as u64,
        sha256: digest,
    })
}

fn part_path(path: &Path) -> PathBuf {
    let mut part = path.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serves fixed bodies by URL; unknown URLs are not found.
    #[derive(Default)]
    struct FakeSource {
        bodies: HashMap<String, &'static str>,
        delay: Option<Duration>,
        calls: AtomicUsize,
        fetched: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn serving(items: &[(&str, &'static str)]) -> Self {
            Self {
                bodies: items
                    .iter()
                    .map(|(url, body)| ((*url).to_string(), *body))
                    .collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for FakeSource {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.fetched.lock().unwrap().push(url.to_string());
            self.bodies
                .get(url)
                .map(|body| Bytes::from_static(body.as_bytes()))
                .ok_or_else(|| FetchError::NotFound {
                    url: url.to_string(),
                })
        }
    }

    fn items(names: &[&str]) -> Vec<SourceItem> {
        names
            .iter()
            .map(|name| SourceItem::new(*name, format!("http://cdn/{name}")))
            .collect()
    }

    fn runner(source: Arc<FakeSource>) -> JobRunner<FakeSource> {
        JobRunner::new(source, 2, RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_rerun_fetches_nothing() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::serving(&[
            ("http://cdn/a", "alpha"),
            ("http://cdn/b", "bravo"),
            ("http://cdn/c", "charlie"),
        ]));
        let runner = runner(source.clone());
        let cancel = CancellationToken::new();

        let first = runner
            .execute(DownloadJob::new(temp.path(), items(&["a", "b", "c"])), &cancel)
            .await
            .unwrap();
        assert_eq!(first.outcome, JobOutcome::Succeeded);
        assert_eq!(source.calls(), 3);

        let second = runner
            .execute(DownloadJob::new(temp.path(), items(&["a", "b", "c"])), &cancel)
            .await
            .unwrap();
        assert_eq!(second.outcome, JobOutcome::Succeeded);
        assert_eq!(source.calls(), 3);
        assert!(second.items.iter().all(|i| i.status == ItemStatus::Skipped));

        let artifacts = |r: &Report| r.items.iter().map(|i| i.artifact.clone()).collect::<Vec<_>>();
        assert_eq!(artifacts(&first), artifacts(&second));
        assert_eq!(fs::read(temp.path().join("b")).unwrap(), b"bravo");
    }

    #[tokio::test]
    async fn test_partial_failures_keep_source_order() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::serving(&[
            ("http://cdn/one", "1"),
            ("http://cdn/three", "3"),
            ("http://cdn/five", "5"),
        ]));

        let report = runner(source)
            .execute(
                DownloadJob::new(temp.path(), items(&["one", "two", "three", "four", "five"])),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, JobOutcome::SucceededWithPartialFailures);
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.exit_status().code(), 6);
        let names: Vec<_> = report.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["one", "two", "three", "four", "five"]);
        let statuses: Vec<_> = report.items.iter().map(|i| i.status).collect();
        assert_eq!(
            statuses,
            [
                ItemStatus::Fetched,
                ItemStatus::Failed,
                ItemStatus::Fetched,
                ItemStatus::Failed,
                ItemStatus::Fetched
            ]
        );
        assert!(report.items[1].error.as_deref().unwrap().contains("Not found"));
    }

    #[tokio::test]
    async fn test_required_failure_fails_job_and_persists_report() {
        let temp = TempDir::new().unwrap();
        let store = ReportStore::new(temp.path().join("reports")).unwrap();
        let source = Arc::new(FakeSource::serving(&[("http://cdn/a", "alpha")]));
        let mut job_items = items(&["a", "model"]);
        job_items[1].required = true;

        let err = runner(source)
            .with_store(store.clone())
            .execute(
                DownloadJob::new(temp.path().join("files"), job_items),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let JobError::Failed { report } = err else {
            panic!("expected a failed job");
        };
        assert_eq!(report.outcome, JobOutcome::Failed);
        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.items[0].status, ItemStatus::Fetched);
        assert_eq!(store.load(report.job_id).unwrap(), *report);
    }

    #[tokio::test]
    async fn test_all_items_failing_fails_job() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::default());

        let err = runner(source)
            .execute(DownloadJob::new(temp.path(), items(&["a", "b"])), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Failed { .. }));
        assert_eq!(err.report().unwrap().counts().failed, 2);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_overwrites_existing_file() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("vad.onnx"), b"stale").unwrap();
        let source = Arc::new(FakeSource::serving(&[("http://cdn/vad.onnx", "fresh")]));
        let item = SourceItem::new("vad.onnx", "http://cdn/vad.onnx").with_sha256(sha256_hex(b"fresh"));

        let report = runner(source.clone())
            .execute(DownloadJob::new(temp.path(), vec![item]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(report.items[0].status, ItemStatus::Fetched);
        assert_eq!(fs::read(temp.path().join("vad.onnx")).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_existing_file_without_checksum_is_kept() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), b"local copy").unwrap();
        let source = Arc::new(FakeSource::serving(&[("http://cdn/a", "remote")]));

        let report = runner(source.clone())
            .execute(DownloadJob::new(temp.path(), items(&["a"])), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.calls(), 0);
        assert_eq!(report.items[0].status, ItemStatus::Skipped);
        assert_eq!(report.items[0].artifact.as_ref().unwrap().bytes, 10);
        assert_eq!(fs::read(temp.path().join("a")).unwrap(), b"local copy");
    }

    #[tokio::test]
    async fn test_bad_download_leaves_no_file() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::serving(&[
            ("http://cdn/good", "good"),
            ("http://cdn/bad", "tampered"),
        ]));
        let bad = SourceItem::new("bad", "http://cdn/bad").with_sha256(sha256_hex(b"original"));
        let good = SourceItem::new("good", "http://cdn/good");

        let report = runner(source)
            .execute(DownloadJob::new(temp.path(), vec![good, bad]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.items[1].status, ItemStatus::Failed);
        assert!(report.items[1].error.as_deref().unwrap().contains("checksum mismatch"));
        assert!(!temp.path().join("bad").exists());
        assert!(!temp.path().join("bad.part").exists());
    }

    #[tokio::test]
    async fn test_nested_item_paths_are_created() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::serving(&[("http://cdn/td", "weights")]));
        let mut item = SourceItem::new("turn-detector", "http://cdn/td");
        item.path = Some(PathBuf::from("models/turn/td.bin"));

        runner(source)
            .execute(DownloadJob::new(temp.path(), vec![item]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fs::read(temp.path().join("models/turn/td.bin")).unwrap(), b"weights");
    }

    #[tokio::test]
    async fn test_empty_job_succeeds() {
        let temp = TempDir::new().unwrap();
        let report = runner(Arc::new(FakeSource::default()))
            .execute(DownloadJob::new(temp.path(), vec![]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.outcome, JobOutcome::Succeeded);
        assert!(report.items.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_pending_items() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(FakeSource {
            delay: Some(Duration::from_secs(3600)),
            ..FakeSource::serving(&[
                ("http://cdn/a", "a"),
                ("http://cdn/b", "b"),
                ("http://cdn/c", "c"),
            ])
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = runner(source.clone())
            .execute(DownloadJob::new(temp.path(), items(&["a", "b", "c"])), &cancel)
            .await
            .unwrap_err();

        let report = err.report().unwrap();
        assert_eq!(report.outcome, JobOutcome::Cancelled);
        assert_eq!(report.status, JobStatus::Cancelled);
        assert!(report.items.iter().all(|i| i.status == ItemStatus::Cancelled));
        assert!(source.calls() <= 2);
        assert!(!temp.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_callback_sees_every_item() {
        let temp = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let source = Arc::new(FakeSource::serving(&[("http://cdn/a", "a")]));

        let _ = runner(source)
            .on_item(Arc::new(move |item: &ItemReport| {
                sink.lock().unwrap().push((item.name.clone(), item.status));
            }))
            .execute(DownloadJob::new(temp.path(), items(&["a", "b"])), &CancellationToken::new())
            .await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen,
            [
                ("a".to_string(), ItemStatus::Fetched),
                ("b".to_string(), ItemStatus::Failed)
            ]
        );
    }
}
