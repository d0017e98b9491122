//! Lock waiter queue evaluation.

/// Where a waiter stands in a lock queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaiterPosition {
    /// First in line: the waiter holds the lock.
    Holder,
    /// Behind `predecessor`, which is the only key worth watching.
    Waiting {
        /// Key of the entry directly ahead.
        predecessor: String,
        /// Zero-based position in the queue.
        position: u32,
    },
    /// The waiter's own entry is gone (its lease expired in the store).
    Missing,
}

/// Locate `own_key` in a queue of keys sorted by insertion revision.
///
/// Keys embed a zero-padded revision, so lexicographic order is revision
/// order and the lowest surviving key is the holder. Watching only the
/// immediate predecessor keeps a release from waking every waiter.
#[inline]
pub fn compute_waiter_position<K: AsRef<str>>(sorted_keys: &[K], own_key: &str) -> WaiterPosition {
    let Some(index) = sorted_keys.iter().position(|k| k.as_ref() == own_key) else {
        return WaiterPosition::Missing;
    };
    if index == 0 {
        return WaiterPosition::Holder;
    }
    WaiterPosition::Waiting {
        predecessor: sorted_keys[index - 1].as_ref().to_string(),
        position: u32::try_from(index).unwrap_or(u32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: [&str; 3] = [
        "/locks/r/00000000000000000003",
        "/locks/r/00000000000000000007",
        "/locks/r/00000000000000000012",
    ];

    #[test]
    fn first_entry_holds() {
        assert_eq!(compute_waiter_position(&QUEUE, QUEUE[0]), WaiterPosition::Holder);
    }

    #[test]
    fn later_entries_watch_their_predecessor() {
        assert_eq!(compute_waiter_position(&QUEUE, QUEUE[2]), WaiterPosition::Waiting {
            predecessor: QUEUE[1].to_string(),
            position: 2,
        });
    }

    #[test]
    fn absent_entry_is_missing() {
        assert_eq!(compute_waiter_position(&QUEUE, "/locks/r/00000000000000000005"), WaiterPosition::Missing);
        assert_eq!(compute_waiter_position::<&str>(&[], QUEUE[0]), WaiterPosition::Missing);
    }
}
