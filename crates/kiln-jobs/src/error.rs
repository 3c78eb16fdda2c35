//! Job, item and report-store errors.

use crate::{JobId, Report};
use kiln_fetch::FetchError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the persisted report store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to create a directory.
    #[error("Failed to create directory '{path}': {source}")]
    CreateDir {
        /// The path that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to read a file.
    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to write a file.
    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        /// The path that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to delete a file.
    #[error("Failed to delete file '{path}': {source}")]
    DeleteFile {
        /// The path that could not be deleted.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to read a directory.
    #[error("Failed to read directory '{path}': {source}")]
    ReadDir {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse a report.
    #[error("Failed to parse report file '{path}': {source}")]
    ParseJson {
        /// The path that could not be parsed.
        path: PathBuf,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// Failed to serialize a report.
    #[error("Failed to serialize report: {0}")]
    SerializeJson(#[from] serde_json::Error),

    /// Report not found.
    #[error("Report not found: {0}")]
    ReportNotFound(String),
}

/// Failure of a single item inside a job. Recorded in the report, never raised.
#[derive(Error, Debug)]
pub enum ItemError {
    /// Fetching the item failed after all allowed attempts.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The fetched bytes do not match the declared checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Declared digest.
        expected: String,
        /// Digest of the fetched bytes.
        actual: String,
    },

    /// Writing the item to its destination failed.
    #[error("Failed to write '{path}': {source}")]
    Write {
        /// The destination path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// Job-level failure.
///
/// Variants that carry a [`Report`] have already persisted it: the job did
/// useful partial work even though it failed as a whole.
#[derive(Error, Debug)]
pub enum JobError {
    /// No item succeeded, or a required item failed.
    #[error("job {} failed: {}", .report.job_id, .report.failure_summary())]
    Failed {
        /// The persisted report.
        report: Box<Report>,
    },

    /// Cancellation arrived before every item finished.
    #[error("job {} was cancelled with {} item(s) unfinished", .report.job_id, .report.counts().cancelled)]
    Cancelled {
        /// The persisted report.
        report: Box<Report>,
    },

    /// The destination directory could not be prepared.
    #[error("Failed to prepare destination '{path}': {source}")]
    Destination {
        /// The destination directory.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The report could not be persisted.
    #[error("job {job_id}: {source}")]
    Store {
        /// The job whose report was lost.
        job_id: JobId,
        /// The underlying store error.
        source: StoreError,
    },
}

impl JobError {
    /// Returns the report, when the job got far enough to produce one.
    #[must_use]
    pub fn report(&self) -> Option<&Report> {
        match self {
            Self::Failed { report } | Self::Cancelled { report } => Some(report),
            Self::Destination { .. } | Self::Store { .. } => None,
        }
    }
}
