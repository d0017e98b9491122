//! Degraded-mode detection.

/// Track when the current stretch of quorum loss began.
///
/// Returns `None` while healthy. While unhealthy, keeps the earliest start.
#[inline]
pub fn next_quorum_loss_start(previous_start_ms: Option<u64>, is_healthy: bool, now_ms: u64) -> Option<u64> {
    if is_healthy {
        return None;
    }
    Some(previous_start_ms.unwrap_or(now_ms))
}

/// Whether quorum loss has lasted strictly longer than `threshold_ms`.
///
/// Short blips (leader changes, a slow probe) stay below one lease TTL and
/// never flip ownership to unverifiable.
#[inline]
pub fn is_degraded(loss_start_ms: Option<u64>, now_ms: u64, threshold_ms: u64) -> bool {
    match loss_start_ms {
        Some(start) => now_ms.saturating_sub(start) > threshold_ms,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_start_sticks_until_healthy() {
        let start = next_quorum_loss_start(None, false, 100);
        assert_eq!(start, Some(100));
        assert_eq!(next_quorum_loss_start(start, false, 900), Some(100));
        assert_eq!(next_quorum_loss_start(start, true, 1_000), None);
    }

    #[test]
    fn degraded_only_after_threshold() {
        assert!(!is_degraded(None, 10_000, 1_000));
        assert!(!is_degraded(Some(0), 1_000, 1_000));
        assert!(is_degraded(Some(0), 1_001, 1_000));
    }

    #[test]
    fn clock_going_backwards_is_not_degraded() {
        assert!(!is_degraded(Some(5_000), 1_000, 100));
    }
}
