//! Exponential backoff with jitter.

/// Result of backoff calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// Sleep duration in milliseconds (includes jitter).
    pub sleep_ms: u64,
    /// Next backoff value (for exponential increase).
    pub next_backoff_ms: u64,
}

/// Compute exponential backoff with jitter.
///
/// Additive jitter keeps candidates that saw the same deletion event from
/// re-contending in lockstep.
///
/// # Arguments
///
/// * `current_backoff_ms` - Current backoff duration in milliseconds
/// * `max_backoff_ms` - Maximum allowed backoff in milliseconds
/// * `jitter_seed` - Random value; reduced modulo `current_backoff_ms / 2 + 1`
///
/// # Example
///
/// ```ignore
/// let result = compute_backoff_with_jitter(100, 1000, 25);
/// assert_eq!(result.sleep_ms, 125);
/// assert_eq!(result.next_backoff_ms, 200);
/// ```
#[inline]
pub fn compute_backoff_with_jitter(current_backoff_ms: u64, max_backoff_ms: u64, jitter_seed: u64) -> BackoffResult {
    let max_jitter = current_backoff_ms.saturating_div(2).saturating_add(1);
    let jitter = jitter_seed % max_jitter;

    let sleep_ms = current_backoff_ms.saturating_add(jitter);

    let doubled = current_backoff_ms.saturating_mul(2).max(1);
    let next_backoff_ms = doubled.min(max_backoff_ms);

    BackoffResult {
        sleep_ms,
        next_backoff_ms,
    }
}
