//! One-shot download jobs for kiln.
//!
//! - [`DownloadJob`] - a batch of manifest items bound for one destination
//! - [`JobRunner`] - bounded-concurrency execution with per-item isolation
//! - [`Report`] - per-item results and the overall [`JobOutcome`]
//! - [`ReportStore`] - reports persisted under the data directory

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod job;
mod report;
mod runner;
mod store;

pub use error::{ItemError, JobError, StoreError};
pub use job::{DownloadJob, JobId, JobStatus};
pub use report::{Artifact, ItemCounts, ItemReport, ItemStatus, JobOutcome, Report};
pub use runner::{ItemCallback, JobRunner};
pub use store::ReportStore;
