//! The download source list.

use crate::{Fetch, FetchError, fetch_with_retry};
use kiln_config::{ManifestLocation, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur while loading a manifest.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Failed to read a local manifest.
    #[error("Failed to read manifest '{path}': {source}")]
    Read {
        /// The manifest path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to fetch a remote manifest.
    #[error("Failed to fetch manifest '{url}': {source}")]
    Fetch {
        /// The manifest URL.
        url: String,
        /// The underlying fetch error.
        source: FetchError,
    },

    /// The manifest is not valid JSON of the expected shape.
    #[error("Failed to parse manifest '{location}': {source}")]
    Parse {
        /// Where the manifest came from.
        location: String,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// An item is unusable.
    #[error("Invalid manifest item '{item}': {reason}")]
    Invalid {
        /// The item name.
        item: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// A single file to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Item identifier, also the default destination file name.
    pub name: String,
    /// Where to fetch the bytes from.
    pub url: String,
    /// Expected lowercase hex SHA-256, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Whether the job fails when this item fails.
    #[serde(default)]
    pub required: bool,
    /// Destination relative to the job destination (defaults to `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl SourceItem {
    /// Creates an optional item with no checksum.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            sha256: None,
            required: false,
            path: None,
        }
    }

    /// Sets the expected checksum.
    #[must_use]
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    /// Marks the item as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Destination path relative to the job destination.
    #[must_use]
    pub fn relative_path(&self) -> &Path {
        self.path
            .as_deref()
            .unwrap_or_else(|| Path::new(&self.name))
    }
}

/// An ordered list of items to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Items in source-list order.
    pub items: Vec<SourceItem>,
}

impl Manifest {
    /// Creates a manifest from items, validating them.
    ///
    /// # Errors
    ///
    /// Returns an error if any item is invalid.
    pub fn new(items: Vec<SourceItem>) -> Result<Self, ManifestError> {
        let manifest = Self { items };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parses and validates a JSON manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or an item is invalid.
    pub fn parse(json: &[u8], location: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_slice(json).map_err(|e| ManifestError::Parse {
            location: location.to_string(),
            source: e,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Loads the manifest from a local file or a remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read, fetched or parsed.
    pub async fn load<F>(
        location: &ManifestLocation,
        fetcher: &F,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self, ManifestError>
    where
        F: Fetch + ?Sized,
    {
        match location {
            ManifestLocation::Local(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| ManifestError::Read {
                        path: path.clone(),
                        source: e,
                    })?;
                Self::parse(&bytes, &path.display().to_string())
            }
            ManifestLocation::Remote(url) => {
                let attempted = fetch_with_retry(fetcher, url, policy, cancel).await;
                let bytes = attempted.result.map_err(|e| ManifestError::Fetch {
                    url: url.clone(),
                    source: e,
                })?;
                Self::parse(&bytes, url)
            }
        }
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the manifest has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for item in &self.items {
            let invalid = |reason: &str| ManifestError::Invalid {
                item: item.name.clone(),
                reason: reason.to_string(),
            };

            if item.name.trim().is_empty() {
                return Err(invalid("name is empty"));
            }
            if item.url.trim().is_empty() {
                return Err(invalid("url is empty"));
            }
            if let Some(sha) = &item.sha256 {
                if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid("sha256 must be 64 hex characters"));
                }
            }

            let path = item.relative_path();
            let is_plain = path.components().count() > 0
                && path.components().all(|c| matches!(c, Component::Normal(_)));
            if !is_plain {
                return Err(invalid("destination must be a relative path inside the destination directory"));
            }
            if !seen.insert(path.to_path_buf()) {
                return Err(invalid("duplicate destination path"));
            }
        }
        Ok(())
    }
}
