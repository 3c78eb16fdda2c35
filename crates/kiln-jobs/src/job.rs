//! Download job definitions.

use chrono::{DateTime, Utc};
use kiln_fetch::{Manifest, SourceItem};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Unique identifier for a download job.
pub type JobId = Uuid;

/// Where a download job is in its lifecycle.
///
/// A job moves `pending -> running` when the runner picks it up and ends in
/// one of the three terminal states, which the persisted report records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet picked up.
    #[default]
    Pending,
    /// Items are being fetched.
    Running,
    /// Every item reached a final state; some may have failed.
    Completed,
    /// A required item failed, or every item did.
    Failed,
    /// Cancellation arrived before every item finished.
    Cancelled,
}

impl JobStatus {
    /// Name used in reports and console output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A one-shot batch that fetches every item of a manifest into a destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp when the job started running.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp when the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Current status of the job.
    pub status: JobStatus,
    /// Directory the items are written into.
    pub destination: PathBuf,
    /// Items in source-list order.
    pub items: Vec<SourceItem>,
}

impl DownloadJob {
    /// Job kind recorded in reports.
    pub const KIND: &'static str = "download-files";

    /// Creates a pending job for the given items.
    #[must_use]
    pub fn new(destination: impl Into<PathBuf>, items: Vec<SourceItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: JobStatus::Pending,
            destination: destination.into(),
            items,
        }
    }

    /// Creates a pending job from a validated manifest.
    #[must_use]
    pub fn from_manifest(destination: impl Into<PathBuf>, manifest: Manifest) -> Self {
        Self::new(destination, manifest.items)
    }

    /// Returns the absolute destination of an item.
    #[must_use]
    pub fn target_path(&self, item: &SourceItem) -> PathBuf {
        self.destination.join(item.relative_path())
    }

    /// Returns the destination directory.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Marks the job as running.
    pub fn mark_started(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Marks the job as finished with the given terminal status.
    pub fn mark_finished(&mut self, status: JobStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}
