use std::future::Future;
use std::time::Duration;

use tracing::error;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::CacheError;
use crate::error::Result;

/// Run `action`, retrying it up to `max_retries` more times with a fixed `delay` in between.
///
/// The whole action is retried, not any part of it. Cancellation is never retried: it is returned as soon as the
/// action reports it, and the backoff wait ends early with [`CacheError::Cancelled`] if the token fires.
pub async fn with_retries<T, F, Fut>(
    operation: &str,
    max_retries: u32,
    delay: Duration,
    cancel: &CancelToken,
    mut action: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match action().await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => err,
        };

        if attempt > max_retries {
            error!(operation, attempt, "giving up: {err}");
            return Err(err);
        }

        warn!(operation, attempt, retry_in = ?delay, "attempt failed: {err}");

        tokio::select! {
            _ = tokio::time::sleep(delay) => (),
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        }
    }
}
