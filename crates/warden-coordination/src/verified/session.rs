//! Session renewal decisions.
//!
//! A session is only as trustworthy as its last *confirmed* renewal. The
//! clock for local expiry starts when that renewal request was sent, not
//! when the response arrived, so a slow response can only make the local
//! view more conservative than the store's.

/// Outcome of evaluating a session after a renewal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    /// Last renewal succeeded.
    Active,
    /// Renewal is failing but the lease may still be alive in the store.
    Degraded,
    /// The TTL has elapsed since the last confirmed renewal. Terminal.
    Expired,
}

/// Renewal cadence for a lease.
///
/// Defaults to a third of the TTL. A configured interval is honored but
/// clamped strictly below half the TTL, so at least one retry fits inside
/// the lease window after a failed renewal. Never returns 0.
#[inline]
pub fn compute_renew_interval_ms(ttl_ms: u64, configured_ms: Option<u64>) -> u64 {
    let ceiling = ttl_ms.saturating_sub(1) / 2;
    let interval = match configured_ms {
        Some(configured) => configured.min(ceiling),
        None => ttl_ms / 3,
    };
    interval.max(1)
}

/// Decide the session state after a renewal attempt.
///
/// # Arguments
///
/// * `elapsed_since_confirmed_ms` - Time since the last confirmed renewal was sent
/// * `ttl_ms` - Lease TTL
/// * `consecutive_failures` - Failed attempts since that renewal (0 = just succeeded)
#[inline]
pub fn evaluate_renewal(elapsed_since_confirmed_ms: u64, ttl_ms: u64, consecutive_failures: u32) -> RenewalDecision {
    if elapsed_since_confirmed_ms >= ttl_ms {
        return RenewalDecision::Expired;
    }
    if consecutive_failures == 0 {
        RenewalDecision::Active
    } else {
        RenewalDecision::Degraded
    }
}

/// Delay before the next renewal retry.
///
/// The backoff delay is cut short so the session wakes no later than the
/// moment its lease would lapse, where it expires itself.
#[inline]
pub fn compute_retry_delay_ms(backoff_sleep_ms: u64, elapsed_since_confirmed_ms: u64, ttl_ms: u64) -> u64 {
    let remaining_ms = ttl_ms.saturating_sub(elapsed_since_confirmed_ms);
    backoff_sleep_ms.min(remaining_ms).max(1)
}
