//! Revision-ordered queues under a key prefix.
//!
//! Lock waiters and election candidates line up the same way: each creates
//! a sequential key whose suffix is the revision of its own create, so key
//! order is arrival order. Every entry carries the random `attempt_id` of
//! the acquire or campaign that wrote it. A create whose reply was lost may
//! have committed, and its retry commits again; the attempt id is how the
//! retried caller finds every copy it wrote and keeps only the first.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use tracing::debug;
use warden_core::KeyValueStore;
use warden_core::KeyValueStoreError;
use warden_core::KeyValueWithRevision;
use warden_core::ScanRequest;
use warden_core::WriteRequest;
use warden_core::parse_sequential_revision;

use crate::config::RetryConfig;
use crate::constants::MAX_QUEUE_ENTRIES;
use crate::error::CoordinationError;
use crate::ownership::delete_if_owned;
use crate::retry::with_retry;
use crate::session::Session;

/// One queue entry written by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub key: String,
    pub create_revision: u64,
}

#[derive(Deserialize)]
struct AttemptStamp {
    attempt_id: u64,
}

pub(crate) fn queue_scan(prefix: &str) -> ScanRequest {
    ScanRequest {
        prefix: prefix.to_string(),
        limit: Some(MAX_QUEUE_ENTRIES),
    }
}

/// Entries directly under `prefix`, in revision order.
///
/// Keys of a nested queue (a longer name sharing this prefix) are skipped.
pub(crate) fn queue_entries<'a>(prefix: &str, kvs: &'a [KeyValueWithRevision]) -> Vec<&'a KeyValueWithRevision> {
    kvs.iter().filter(|kv| parse_sequential_revision(prefix, &kv.key).is_some()).collect()
}

fn is_stamped(kv: &KeyValueWithRevision, attempt_id: u64) -> bool {
    serde_json::from_str::<AttemptStamp>(&kv.value).is_ok_and(|stamp| stamp.attempt_id == attempt_id)
}

/// Append `value` (which must carry `attempt_id`) to the queue at `prefix`,
/// attached to the session lease.
///
/// Exactly one entry for this attempt survives a successful call, and none
/// survive a failed one (short of the cleanup itself failing, in which case
/// the lease removes them).
pub(crate) async fn enqueue<S>(
    store: &S,
    retry: &RetryConfig,
    session: &Session,
    prefix: &str,
    value: &str,
    attempt_id: u64,
) -> Result<QueueEntry, CoordinationError>
where
    S: KeyValueStore + ?Sized,
{
    let lease_id = session.lease_id();
    let attempts = AtomicU32::new(0);
    let result = with_retry("enqueue", retry, || {
        attempts.fetch_add(1, Ordering::Relaxed);
        store.write(WriteRequest::create_sequential(prefix, value, Some(lease_id)))
    })
    .await;
    let is_retried = attempts.load(Ordering::Relaxed) > 1;

    let outcome = match result {
        Ok(created) => {
            let key = created.created_key.ok_or_else(|| CoordinationError::Storage {
                source: KeyValueStoreError::Failed {
                    reason: "sequential create returned no key".to_string(),
                },
            })?;
            let entry = QueueEntry {
                key,
                create_revision: created.header_revision,
            };
            if !is_retried {
                return Ok(entry);
            }
            keep_first_stamped(store, retry, prefix, attempt_id, entry).await
        }
        Err(error) => Err(session.map_lease_error(error)),
    };

    let may_have_committed = outcome
        .as_ref()
        .err()
        .is_some_and(|error| is_retried || matches!(error, CoordinationError::MaxRetriesExceeded { .. }));
    if may_have_committed {
        withdraw_stamped(store, retry, prefix, attempt_id).await;
    }
    outcome
}

/// Keep the lowest entry stamped with `attempt_id` and delete the others.
async fn keep_first_stamped<S>(
    store: &S,
    retry: &RetryConfig,
    prefix: &str,
    attempt_id: u64,
    acknowledged: QueueEntry,
) -> Result<QueueEntry, CoordinationError>
where
    S: KeyValueStore + ?Sized,
{
    let scan = with_retry("scan queue", retry, || store.scan(queue_scan(prefix))).await?;
    let own: Vec<_> = queue_entries(prefix, &scan.kvs).into_iter().filter(|kv| is_stamped(kv, attempt_id)).collect();
    let Some((first, duplicates)) = own.split_first() else {
        return Ok(acknowledged);
    };
    for duplicate in duplicates {
        delete_if_owned(store, retry, &duplicate.key, duplicate.create_revision).await?;
    }
    if !duplicates.is_empty() {
        debug!(prefix, kept = %first.key, duplicates = duplicates.len(), "removed duplicate queue entries left by a retried create");
    }
    Ok(QueueEntry {
        key: first.key.clone(),
        create_revision: first.create_revision,
    })
}

/// Best-effort removal of every entry stamped with `attempt_id`.
async fn withdraw_stamped<S>(store: &S, retry: &RetryConfig, prefix: &str, attempt_id: u64)
where
    S: KeyValueStore + ?Sized,
{
    let scan = match with_retry("scan queue", retry, || store.scan(queue_scan(prefix))).await {
        Ok(scan) => scan,
        Err(error) => {
            debug!(prefix, error = %error, "cannot list queue to withdraw a failed enqueue");
            return;
        }
    };
    for kv in queue_entries(prefix, &scan.kvs).into_iter().filter(|kv| is_stamped(kv, attempt_id)) {
        if let Err(error) = delete_if_owned(store, retry, &kv.key, kv.create_revision).await {
            debug!(key = %kv.key, error = %error, "failed to withdraw queue entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use warden_testing::DeterministicKeyValueStore;
    use warden_testing::LostAckStore;
    use warden_testing::WriteKind;

    use super::*;
    use crate::config::SessionConfig;
    use crate::session::SessionManager;

    async fn session<S: KeyValueStore + ?Sized + 'static>(store: Arc<S>) -> Session {
        SessionManager::new(store, SessionConfig::default()).start_default().await.unwrap()
    }

    fn stamped(attempt_id: u64) -> String {
        serde_json::json!({ "attempt_id": attempt_id }).to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn lost_reply_leaves_a_single_entry() {
        let store = LostAckStore::new(DeterministicKeyValueStore::new());
        let session = session(store.clone()).await;
        let retry = RetryConfig::default();
        store.lose_next(WriteKind::CreateSequential, 1);

        let entry = enqueue(store.as_ref(), &retry, &session, "/q/r/", &stamped(7), 7).await.unwrap();
        assert_eq!(store.lost_acks(), 1);
        assert_eq!(store.inner().keys_with_prefix("/q/r/"), vec![entry.key.clone()]);
        assert_eq!(parse_sequential_revision("/q/r/", &entry.key), Some(entry.create_revision));
    }

    #[tokio::test(start_paused = true)]
    async fn retried_enqueue_keeps_its_place_in_line() {
        let store = LostAckStore::new(DeterministicKeyValueStore::new());
        let session = session(store.clone()).await;
        let retry = RetryConfig::default();

        store.lose_next(WriteKind::CreateSequential, 1);
        let first = enqueue(store.as_ref(), &retry, &session, "/q/r/", &stamped(1), 1).await.unwrap();
        let second = enqueue(store.as_ref(), &retry, &session, "/q/r/", &stamped(2), 2).await.unwrap();
        assert!(first.key < second.key);
        assert_eq!(store.inner().keys_with_prefix("/q/r/"), vec![first.key, second.key]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_enqueue_withdraws_committed_copies() {
        let store = LostAckStore::new(DeterministicKeyValueStore::new());
        let session = session(store.clone()).await;
        let retry = RetryConfig {
            max_attempts: 2,
            ..RetryConfig::default()
        };
        store.lose_next(WriteKind::CreateSequential, 2);

        let err = enqueue(store.as_ref(), &retry, &session, "/q/r/", &stamped(3), 3).await.unwrap_err();
        assert!(matches!(err, CoordinationError::MaxRetriesExceeded { attempts: 2, .. }));
        assert!(store.inner().keys_with_prefix("/q/r/").is_empty());
    }

    #[tokio::test]
    async fn nested_queues_are_not_mixed_in() {
        let store = DeterministicKeyValueStore::new();
        store.write(WriteRequest::create_sequential("/q/a/", "x", None)).await.unwrap();
        store.write(WriteRequest::create_sequential("/q/a/b/", "y", None)).await.unwrap();
        let scan = store.scan(queue_scan("/q/a/")).await.unwrap();
        assert_eq!(scan.kvs.len(), 2);
        let entries = queue_entries("/q/a/", &scan.kvs);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "x");
    }
}
