//! Bounded retries and cancellable waits.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warden_core::KeyValueStoreError;

use crate::config::RetryConfig;
use crate::error::CancelledSnafu;
use crate::error::CoordinationError;
use crate::error::TimeoutSnafu;
use crate::verified::compute_backoff_with_jitter;

/// Run a store call, retrying transient failures with jittered backoff.
///
/// Non-transient errors return immediately, mapped through
/// [`CoordinationError::from_store`]. Once the attempt budget is spent the
/// last transient error is wrapped in `MaxRetriesExceeded`.
pub(crate) async fn with_retry<T, F, Fut>(operation: &str, config: &RetryConfig, mut op: F) -> Result<T, CoordinationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KeyValueStoreError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut backoff_ms = config.initial_backoff_ms;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(source) if source.is_transient() && attempt < max_attempts => {
                let jitter_seed: u64 = rand::rng().random();
                let backoff = compute_backoff_with_jitter(backoff_ms, config.max_backoff_ms, jitter_seed);
                debug!(operation, attempt, sleep_ms = backoff.sleep_ms, error = %source, "transient store error, retrying");
                tokio::time::sleep(Duration::from_millis(backoff.sleep_ms)).await;
                backoff_ms = backoff.next_backoff_ms;
            }
            Err(source) if source.is_transient() => {
                return Err(CoordinationError::MaxRetriesExceeded {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source,
                });
            }
            Err(source) => return Err(CoordinationError::from_store(operation, source)),
        }
    }
}

/// Race `fut` against caller cancellation and an optional deadline.
///
/// Dropping `fut` on cancellation or timeout is the only cleanup performed
/// here; callers hold drop guards for anything written so far.
pub(crate) async fn run_bounded<T, Fut>(
    operation: &str,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: Fut,
) -> Result<T, CoordinationError>
where
    Fut: Future<Output = Result<T, CoordinationError>>,
{
    let expiry = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => CancelledSnafu { operation }.fail(),
        _ = expiry => TimeoutSnafu { operation }.fail(),
        result = fut => result,
    }
}

/// Deadline for a blocking call with an optional timeout, measured from now.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}
