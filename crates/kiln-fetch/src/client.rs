//! HTTP client for downloading source items.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the download client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum idle connections kept per host.
    pub pool_size: usize,
    /// Request timeout.
    pub timeout: Duration,
    /// Connection timeout (separate from the request timeout).
    pub connect_timeout: Duration,
    /// User agent string.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("kiln/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Errors that can occur during a single fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The source does not have the item.
    #[error("Not found: {url}")]
    NotFound {
        /// The requested URL.
        url: String,
    },

    /// Server returned an error status.
    #[error("Server returned {status} for {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// The requested URL.
        url: String,
    },

    /// Reading a local source failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The fetch was abandoned because cancellation was requested.
    #[error("Cancelled")]
    Cancelled,
}

impl FetchError {
    /// Returns true if another attempt may succeed.
    ///
    /// Timeouts, connection errors, server errors (5xx) and rate limiting
    /// (429) are retryable. Client errors and cancellation are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder() && (e.is_timeout() || e.is_connect() || e.is_request()),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::NotFound { .. } | Self::Io(_) | Self::Cancelled => false,
        }
    }
}

/// A source of item bytes.
///
/// Implementations perform a single attempt; retry and cancellation are
/// layered on top by [`crate::fetch_with_retry`]. Dropping the returned
/// future must abandon the request.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetches the full body at `url`.
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// HTTP client with connection pooling.
#[derive(Debug, Clone)]
pub struct DownloadClient {
    client: Client,
    config: ClientConfig,
}

impl DownloadClient {
    /// Creates a new download client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: ClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.pool_size)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()?;
        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_defaults() -> Result<Self, reqwest::Error> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Downloads a single body, returning its bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or any non-success status.
    pub async fn download(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl Fetch for DownloadClient {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        self.download(url).await
    }
}
