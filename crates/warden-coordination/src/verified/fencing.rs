//! Fencing token acceptance and quorum thresholds.

/// Whether a resource should accept `token` given the highest token it has
/// accepted for the same scope.
///
/// Acceptance is strict: a token equal to the last accepted one is a replay
/// and is rejected, as is anything older.
#[inline]
pub fn should_accept_token(token: u64, last_accepted: Option<u64>) -> bool {
    match last_accepted {
        Some(last) => token > last,
        None => true,
    }
}

/// Calculate quorum threshold for a cluster.
///
/// # Example
///
/// ```ignore
/// assert_eq!(compute_quorum_threshold(5), 3);
/// assert_eq!(compute_quorum_threshold(4), 3);
/// assert_eq!(compute_quorum_threshold(1), 1);
/// ```
#[inline]
pub fn compute_quorum_threshold(total_nodes: u32) -> u32 {
    if total_nodes == 0 {
        return 0;
    }
    (total_nodes / 2) + 1
}

/// Check if we have quorum with the given number of reachable nodes.
///
/// An empty membership never has quorum.
#[inline]
pub fn has_quorum(total_nodes: u32, reachable_nodes: u32) -> bool {
    total_nodes > 0 && reachable_nodes >= compute_quorum_threshold(total_nodes)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_token_is_accepted() {
        assert!(should_accept_token(1, None));
    }

    #[test]
    fn stale_and_replayed_tokens_are_rejected() {
        assert!(!should_accept_token(5, Some(9)));
        assert!(!should_accept_token(9, Some(9)));
        assert!(should_accept_token(10, Some(9)));
    }

    #[test]
    fn quorum_thresholds() {
        assert_eq!(compute_quorum_threshold(0), 0);
        assert_eq!(compute_quorum_threshold(3), 2);
        assert_eq!(compute_quorum_threshold(4), 3);
        assert!(has_quorum(3, 2));
        assert!(!has_quorum(3, 1));
        assert!(!has_quorum(0, 0));
    }

    proptest! {
        #[test]
        fn accepted_sequence_is_strictly_increasing(tokens in proptest::collection::vec(0u64..1_000, 0..64)) {
            let mut last = None;
            let mut accepted = Vec::new();
            for token in tokens {
                if should_accept_token(token, last) {
                    last = Some(token);
                    accepted.push(token);
                }
            }
            prop_assert!(accepted.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
