//! The kiln server loop.
//!
//! - [`ServerLoop`] - resource lifecycle plus a scheduler of recurring tasks
//! - [`ResourceProvider`] / [`Resource`] - scoped process-wide handles
//! - [`ScheduledTask`] - failure-isolated background work
//! - [`StateView`] - snapshot reads of the server state

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod resource;
mod resources;
mod scheduler;
mod server;
mod state;
mod task;
mod tasks;

pub use error::{ResourceError, Result, ServerError, TaskError};
pub use resource::{Resource, ResourceProvider, StartupContext};
pub use resources::{ArtifactCheck, DataDirLock, StatusFile, read_status_file};
pub use server::{ServerExit, ServerLoop, Shutdown};
pub use state::{ServerPhase, ServerSnapshot, StateView, TaskFailure, TaskRecord};
pub use task::{ScheduledTask, TaskContext};
pub use tasks::{ConfigWatch, ReportRetention, StatusSnapshot};
