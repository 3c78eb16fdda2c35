//! Per-item and per-job results.

use crate::{DownloadJob, JobId, JobStatus};
use chrono::{DateTime, Utc};
use kiln_types::ExitStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What happened to a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// The item was fetched and written.
    Fetched,
    /// A valid copy was already present.
    Skipped,
    /// The item could not be fetched, verified or written.
    Failed,
    /// Cancellation arrived before the item finished.
    Cancelled,
}

impl ItemStatus {
    /// Returns true if a valid copy of the item is on disk.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Fetched | Self::Skipped)
    }

    /// Returns the status as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Size and digest of an item on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File size in bytes.
    pub bytes: u64,
    /// Lowercase hex SHA-256.
    pub sha256: String,
}

/// Result of a single item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    /// Item name from the manifest.
    pub name: String,
    /// Absolute destination path.
    pub path: PathBuf,
    /// Final status.
    pub status: ItemStatus,
    /// Whether the job fails when this item fails.
    #[serde(default)]
    pub required: bool,
    /// Fetch attempts made. Zero when skipped.
    #[serde(default)]
    pub attempts: u32,
    /// The file on disk, for fetched and skipped items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// Failure description, for failed items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobOutcome {
    /// Every item succeeded.
    Succeeded,
    /// At least one optional item failed, the rest succeeded.
    SucceededWithPartialFailures,
    /// No item succeeded, or a required item failed.
    Failed,
    /// Cancellation arrived before every item finished.
    Cancelled,
}

impl JobOutcome {
    /// Derives the outcome from item results.
    ///
    /// An empty item list succeeds.
    #[must_use]
    pub fn from_items(items: &[ItemReport]) -> Self {
        if items.iter().any(|i| i.status == ItemStatus::Cancelled) {
            return Self::Cancelled;
        }
        if items.is_empty() {
            return Self::Succeeded;
        }

        let failed: Vec<_> = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .collect();

        if failed.is_empty() {
            Self::Succeeded
        } else if failed.len() == items.len() || failed.iter().any(|i| i.required) {
            Self::Failed
        } else {
            Self::SucceededWithPartialFailures
        }
    }

    /// Returns the process exit status for this outcome.
    #[must_use]
    pub const fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Succeeded => ExitStatus::Success,
            Self::SucceededWithPartialFailures => ExitStatus::PartialSuccess,
            Self::Failed | Self::Cancelled => ExitStatus::JobError,
        }
    }

    /// Returns true if the job counts as a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SucceededWithPartialFailures)
    }

    /// Returns the outcome as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::SucceededWithPartialFailures => "succeeded-with-partial-failures",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Item tallies by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    /// Items fetched in this run.
    pub fetched: usize,
    /// Items already present.
    pub skipped: usize,
    /// Items that failed.
    pub failed: usize,
    /// Items left unfinished by cancellation.
    pub cancelled: usize,
}

/// The persisted result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Job identifier.
    pub job_id: JobId,
    /// Job kind.
    pub kind: String,
    /// Destination directory.
    pub destination: PathBuf,
    /// Time the job was created.
    pub created_at: DateTime<Utc>,
    /// Time the job started.
    pub started_at: DateTime<Utc>,
    /// Time the job finished.
    pub finished_at: DateTime<Utc>,
    /// Lifecycle status the job ended in.
    pub status: JobStatus,
    /// Overall outcome.
    pub outcome: JobOutcome,
    /// Item results in source-list order.
    pub items: Vec<ItemReport>,
}

impl Report {
    /// Builds a report for a finished job.
    #[must_use]
    pub fn new(job: &DownloadJob, items: Vec<ItemReport>) -> Self {
        let finished_at = job.completed_at.unwrap_or_else(Utc::now);
        Self {
            job_id: job.id,
            kind: DownloadJob::KIND.to_string(),
            destination: job.destination.clone(),
            created_at: job.created_at,
            started_at: job.started_at.unwrap_or(finished_at),
            finished_at,
            status: job.status,
            outcome: JobOutcome::from_items(&items),
            items,
        }
    }

    /// Returns item tallies.
    #[must_use]
    pub fn counts(&self) -> ItemCounts {
        self.items
            .iter()
            .fold(ItemCounts::default(), |mut counts, item| {
                match item.status {
                    ItemStatus::Fetched => counts.fetched += 1,
                    ItemStatus::Skipped => counts.skipped += 1,
                    ItemStatus::Failed => counts.failed += 1,
                    ItemStatus::Cancelled => counts.cancelled += 1,
                }
                counts
            })
    }

    /// Returns the failed items.
    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
    }

    /// One-line description of the failed items.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        let names: Vec<_> = self.failures().map(|i| i.name.as_str()).collect();
        if names.is_empty() {
            "no item failures".to_string()
        } else {
            format!("{} item(s) failed: {}", names.len(), names.join(", "))
        }
    }

    /// Returns the process exit status for this report.
    #[must_use]
    pub const fn exit_status(&self) -> ExitStatus {
        self.outcome.exit_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, status: ItemStatus, required: bool) -> ItemReport {
        ItemReport {
            name: name.to_string(),
            path: PathBuf::from(name),
            status,
            required,
            attempts: 1,
            artifact: None,
            error: None,
        }
    }

    #[test]
    fn test_outcome_rules() {
        use ItemStatus::{Cancelled, Failed, Fetched, Skipped};

        assert_eq!(JobOutcome::from_items(&[]), JobOutcome::Succeeded);
        assert_eq!(
            JobOutcome::from_items(&[item("a", Fetched, false), item("b", Skipped, true)]),
            JobOutcome::Succeeded
        );
        assert_eq!(
            JobOutcome::from_items(&[item("a", Fetched, false), item("b", Failed, false)]),
            JobOutcome::SucceededWithPartialFailures
        );
        assert_eq!(
            JobOutcome::from_items(&[item("a", Fetched, false), item("b", Failed, true)]),
            JobOutcome::Failed
        );
        assert_eq!(
            JobOutcome::from_items(&[item("a", Failed, false), item("b", Failed, false)]),
            JobOutcome::Failed
        );
        assert_eq!(
            JobOutcome::from_items(&[item("a", Fetched, false), item("b", Cancelled, false)]),
            JobOutcome::Cancelled
        );
    }

    #[test]
    fn test_outcome_exit_status() {
        assert_eq!(JobOutcome::Succeeded.exit_status().code(), 0);
        assert_eq!(JobOutcome::SucceededWithPartialFailures.exit_status().code(), 6);
        assert_eq!(JobOutcome::Failed.exit_status().code(), 4);
        assert_eq!(JobOutcome::Cancelled.exit_status().code(), 4);
    }

    #[test]
    fn test_outcome_serializes_kebab_case() {
        let json = serde_json::to_string(&JobOutcome::SucceededWithPartialFailures).unwrap();
        assert_eq!(json, "\"succeeded-with-partial-failures\"");
    }

    #[test]
    fn test_counts_and_summary() {
        let mut job = DownloadJob::new("/tmp", vec![]);
        job.mark_started();
        job.mark_finished(JobStatus::Completed);
        let report = Report::new(
            &job,
            vec![
                item("a", ItemStatus::Fetched, false),
                item("b", ItemStatus::Failed, false),
                item("c", ItemStatus::Skipped, false),
                item("d", ItemStatus::Failed, false),
            ],
        );

        let counts = report.counts();
        assert_eq!(counts.fetched, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.failed, 2);
        assert_eq!(report.failure_summary(), "2 item(s) failed: b, d");
        assert!(report.started_at <= report.finished_at);
        assert_eq!(report.status, JobStatus::Completed);
    }
}
