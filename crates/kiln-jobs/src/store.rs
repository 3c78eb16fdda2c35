//! Persistent report storage.

use crate::{JobId, Report, StoreError};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Result type for store operations.
pub(crate) type Result<T> = std::result::Result<T, StoreError>;

const LATEST: &str = "latest.json";

/// Stores job reports as JSON files, one per job, plus a copy of the most
/// recent one at `latest.json`.
#[derive(Debug, Clone)]
pub struct ReportStore {
    reports_path: PathBuf,
}

impl ReportStore {
    /// Creates a store rooted at `reports_path`, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(reports_path: impl Into<PathBuf>) -> Result<Self> {
        let reports_path = reports_path.into();
        fs::create_dir_all(&reports_path).map_err(|e| StoreError::CreateDir {
            path: reports_path.clone(),
            source: e,
        })?;
        Ok(Self { reports_path })
    }

    /// Opens a store without touching the filesystem.
    ///
    /// Reads on a missing directory behave like an empty store.
    #[must_use]
    pub fn open(reports_path: impl Into<PathBuf>) -> Self {
        Self {
            reports_path: reports_path.into(),
        }
    }

    /// Returns the reports directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.reports_path
    }

    /// Returns the path to a job's report.
    #[must_use]
    pub fn report_path(&self, job_id: JobId) -> PathBuf {
        self.reports_path.join(format!("{job_id}.json"))
    }

    /// Returns the path to the latest report.
    #[must_use]
    pub fn latest_path(&self) -> PathBuf {
        self.reports_path.join(LATEST)
    }

    /// Saves a report and makes it the latest.
    ///
    /// # Errors
    ///
    /// Returns an error if the report cannot be serialized or written.
    pub fn save(&self, report: &Report) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        for path in [self.report_path(report.job_id), self.latest_path()] {
            write_atomic(&path, json.as_bytes())?;
        }
        Ok(())
    }

    /// Loads a report by job id.
    ///
    /// # Errors
    ///
    /// Returns an error if the report does not exist or cannot be parsed.
    pub fn load(&self, job_id: JobId) -> Result<Report> {
        let path = self.report_path(job_id);
        if !path.exists() {
            return Err(StoreError::ReportNotFound(job_id.to_string()));
        }
        read_report(&path)
    }

    /// Loads the most recent report, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the latest report exists but cannot be read.
    pub fn load_latest(&self) -> Result<Option<Report>> {
        let path = self.latest_path();
        if !path.exists() {
            return Ok(None);
        }
        read_report(&path).map(Some)
    }

    /// Returns true if a report for `job_id` exists.
    #[must_use]
    pub fn exists(&self, job_id: JobId) -> bool {
        self.report_path(job_id).exists()
    }

    /// Lists all reports, newest first.
    ///
    /// Unreadable files are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the reports directory cannot be read.
    pub fn list(&self) -> Result<Vec<Report>> {
        if !self.reports_path.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.reports_path).map_err(|e| StoreError::ReadDir {
            path: self.reports_path.clone(),
            source: e,
        })?;

        let mut reports = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::ReadDir {
                path: self.reports_path.clone(),
                source: e,
            })?;

            let path = entry.path();
            let is_report = path.extension().is_some_and(|ext| ext == "json")
                && path.file_name().is_some_and(|name| name != LATEST);
            if !is_report {
                continue;
            }

            match read_report(&path) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable report"),
            }
        }

        reports.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        Ok(reports)
    }

    /// Deletes a report.
    ///
    /// If it is also the latest, `latest.json` is removed too.
    ///
    /// # Errors
    ///
    /// Returns an error if the report does not exist or cannot be deleted.
    pub fn delete(&self, job_id: JobId) -> Result<()> {
        let path = self.report_path(job_id);
        if !path.exists() {
            return Err(StoreError::ReportNotFound(job_id.to_string()));
        }

        fs::remove_file(&path).map_err(|e| StoreError::DeleteFile { path, source: e })?;

        let latest = self.latest_path();
        let latest_is_deleted = read_report(&latest).is_ok_and(|r| r.job_id == job_id);
        if latest_is_deleted {
            fs::remove_file(&latest).map_err(|e| StoreError::DeleteFile {
                path: latest,
                source: e,
            })?;
        }
        Ok(())
    }

    /// Deletes every report that finished before `cutoff`.
    ///
    /// The report `latest.json` points to is kept regardless of age. Returns
    /// the ids of the deleted reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the reports cannot be listed or deleted.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let latest = self.load_latest().ok().flatten().map(|r| r.job_id);
        let mut pruned = Vec::new();
        for report in self.list()? {
            if report.finished_at < cutoff && Some(report.job_id) != latest {
                self.delete(report.job_id)?;
                pruned.push(report.job_id);
            }
        }
        Ok(pruned)
    }
}

fn read_report(path: &Path) -> Result<Report> {
    let content = fs::read_to_string(path).map_err(|e| StoreError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| StoreError::ParseJson {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).map_err(|e| StoreError::WriteFile {
        path: tmp.clone(),
        source: e,
    })?;
    fs::rename(&tmp, path).map_err(|e| StoreError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DownloadJob, ItemReport, ItemStatus, JobStatus};
    use tempfile::TempDir;

    fn create_test_report(finished_at: DateTime<Utc>) -> Report {
        let mut job = DownloadJob::new("/tmp/files", vec![]);
        job.mark_started();
        job.mark_finished(JobStatus::Completed);
        let mut report = Report::new(
            &job,
            vec![ItemReport {
                name: "a".into(),
                path: PathBuf::from("/tmp/files/a"),
                status: ItemStatus::Fetched,
                required: false,
                attempts: 1,
                artifact: None,
                error: None,
            }],
        );
        report.started_at = finished_at;
        report.finished_at = finished_at;
        report
    }

    #[test]
    fn test_save_and_load_report() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReportStore::new(temp_dir.path().join("reports")).unwrap();
        let report = create_test_report(Utc::now());

        store.save(&report).unwrap();

        assert!(store.exists(report.job_id));
        assert_eq!(store.load(report.job_id).unwrap(), report);
        assert_eq!(store.load_latest().unwrap(), Some(report));
    }

    #[test]
    fn test_list_newest_first_without_latest() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReportStore::new(temp_dir.path()).unwrap();
        let now = Utc::now();
        let older = create_test_report(now - chrono::Duration::hours(2));
        let newer = create_test_report(now);

        store.save(&older).unwrap();
        store.save(&newer).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].job_id, newer.job_id);
        assert_eq!(listed[1].job_id, older.job_id);
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReportStore::new(temp_dir.path()).unwrap();
        store.save(&create_test_report(Utc::now())).unwrap();
        fs::write(temp_dir.path().join("garbage.json"), "{nope").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_clears_latest() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReportStore::new(temp_dir.path()).unwrap();
        let report = create_test_report(Utc::now());
        store.save(&report).unwrap();

        store.delete(report.job_id).unwrap();

        assert!(!store.exists(report.job_id));
        assert_eq!(store.load_latest().unwrap(), None);
        assert!(matches!(
            store.delete(report.job_id),
            Err(StoreError::ReportNotFound(_))
        ));
    }

    #[test]
    fn test_prune_removes_old_reports() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReportStore::new(temp_dir.path()).unwrap();
        let now = Utc::now();
        let old = create_test_report(now - chrono::Duration::days(30));
        let fresh = create_test_report(now);
        store.save(&old).unwrap();
        store.save(&fresh).unwrap();

        let pruned = store.prune(now - chrono::Duration::days(7)).unwrap();

        assert_eq!(pruned, vec![old.job_id]);
        assert!(store.exists(fresh.job_id));
        assert!(store.load_latest().unwrap().is_some());
    }

    #[test]
    fn test_prune_keeps_latest_even_when_expired() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReportStore::new(temp_dir.path()).unwrap();
        let now = Utc::now();
        let only = create_test_report(now - chrono::Duration::days(30));
        store.save(&only).unwrap();

        let pruned = store.prune(now - chrono::Duration::days(7)).unwrap();

        assert!(pruned.is_empty());
        assert!(store.exists(only.job_id));
        assert_eq!(store.load_latest().unwrap().map(|r| r.job_id), Some(only.job_id));
    }

    #[test]
    fn test_open_missing_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = ReportStore::open(temp_dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.load_latest().unwrap(), None);
        assert!(!temp_dir.path().join("absent").exists());
    }
}
