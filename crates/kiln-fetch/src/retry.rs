//! Retry and cancellation around a single [`Fetch`].

use crate::{Fetch, FetchError};
use bytes::Bytes;
use kiln_config::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The result of a fetch together with the number of attempts it took.
#[derive(Debug)]
pub struct Attempted {
    /// Final outcome after the last attempt.
    pub result: Result<Bytes, FetchError>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Fetches `url`, retrying retryable failures according to `policy`.
///
/// Both the request and the backoff sleep race against `cancel`; once it
/// fires the in-progress request is dropped and
/// [`FetchError::Cancelled`] is returned.
pub async fn fetch_with_retry<F>(
    fetcher: &F,
    url: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Attempted
where
    F: Fetch + ?Sized,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            result = fetcher.fetch(url) => result,
        };

        match result {
            Err(e) if e.is_retryable() && attempts < policy.max_attempts() => {
                let delay = policy.delay_for(attempts);
                debug!(url, attempt = attempts, ?delay, error = %e, "retrying fetch");

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return Attempted {
                            result: Err(FetchError::Cancelled),
                            attempts,
                        };
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            result => return Attempted { result, attempts },
        }
    }
}
