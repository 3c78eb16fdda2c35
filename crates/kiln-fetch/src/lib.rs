//! HTTP fetching, retry and manifest loading for kiln.
//!
//! - [`DownloadClient`] - HTTP client with connection pooling
//! - [`Fetch`] - single-attempt source of item bytes
//! - [`fetch_with_retry`] - cancellation-aware retry around a [`Fetch`]
//! - [`Manifest`] - ordered source list for the download job
//! - [`sha256_file`] - streaming checksum for idempotence checks

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod checksum;
mod client;
mod manifest;
mod retry;

pub use checksum::{digests_match, sha256_file, sha256_hex};
pub use client::{ClientConfig, DownloadClient, Fetch, FetchError};
pub use manifest::{Manifest, ManifestError, SourceItem};
pub use retry::{Attempted, fetch_with_retry};
