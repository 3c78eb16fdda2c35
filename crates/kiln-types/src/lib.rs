//! Core types for the kiln process orchestrator.
//!
//! This crate provides the fundamental types shared by every kiln crate:
//!
//! - [`Mode`] - The operating mode selected for a process invocation
//! - [`Profile`] - Server configuration profile (development or production)
//! - [`KilnError`] - Fatal conditions that propagate to the exit code
//! - [`ExitStatus`] - Distinct process exit codes

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod mode;

pub use error::{ExitStatus, KilnError, Result};
pub use mode::{Mode, ModeParseError, Profile};
