//! Lock ordering, zombie holders, and fencing at the resource.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Store;
use common::TEST_TIMEOUT;
use common::TEST_TTL;
use common::init_tracing;
use common::locks;
use common::start_session;
use tokio_util::sync::CancellationToken;
use warden_coordination::CoordinationError;
use warden_coordination::ElectionConfig;
use warden_coordination::ElectionCoordinator;
use warden_coordination::ElectionEvent;
use warden_coordination::FenceError;
use warden_coordination::FencingValidator;
use warden_coordination::LockConfig;
use warden_coordination::LockEvent;
use warden_coordination::LockManager;
use warden_coordination::OwnershipStatus;
use warden_coordination::RevokeReason;
use warden_coordination::SessionState;
use warden_coordination::constants::LOCK_PREFIX;

#[tokio::test(start_paused = true)]
async fn zombie_holder_token_is_rejected_after_takeover() {
    init_tracing();
    let store = Store::new();
    let (session_a, locks_a) = locks(&store, "worker-a").await;
    let (_session_b, locks_b) = locks(&store, "worker-b").await;
    let resource = FencingValidator::new();

    let lock_a = locks_a.acquire("order-42", &CancellationToken::new()).await.unwrap();
    let token_a = lock_a.token().unwrap();
    assert!(resource.check("lock/order-42", &token_a).is_ok());

    // A is suspended: nothing it sends reaches the store any more.
    store.block_keepalive(session_a.lease_id());

    let lock_b = tokio::time::timeout(TEST_TIMEOUT, locks_b.acquire("order-42", &CancellationToken::new()))
        .await
        .expect("B acquires once A's lease lapses")
        .unwrap();
    let token_b = lock_b.token().unwrap();
    assert!(token_b.value > token_a.value);
    assert!(resource.check("lock/order-42", &token_b).is_ok());

    // A resumes and tries to mutate with the token it still holds.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!resource.validate_and_accept("lock/order-42", token_a.value));
    assert_eq!(resource.check("lock/order-42", &token_a), Err(FenceError::StaleToken {
        scope: "lock/order-42".to_string(),
        presented: token_a.value,
        last_accepted: token_b.value,
    }));

    assert!(!lock_a.is_held());
    assert_eq!(lock_a.ownership(), OwnershipStatus::NotHeld);
    assert_eq!(session_a.state(), SessionState::Expired);
    let err = lock_a.refresh_token().await.unwrap_err();
    assert!(err.is_ownership_loss());
}

#[tokio::test(start_paused = true)]
async fn grants_follow_arrival_order() {
    init_tracing();
    let store = Store::new();
    let (_s1, first) = locks(&store, "first").await;
    let (_s2, second) = locks(&store, "second").await;
    let (_s3, third) = locks(&store, "third").await;

    let held = first.acquire("queue", &CancellationToken::new()).await.unwrap();

    let second = Arc::new(second);
    let third = Arc::new(third);
    let second_task = {
        let manager = second.clone();
        tokio::spawn(async move { manager.acquire("queue", &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let third_task = {
        let manager = third.clone();
        tokio::spawn(async move { manager.acquire("queue", &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queue = first.waiters("queue").await.unwrap();
    let order: Vec<_> = queue.iter().map(|record| (record.holder_id.as_str(), record.queue_position)).collect();
    assert_eq!(order, vec![("first", 0), ("second", 1), ("third", 2)]);
    assert!(queue.windows(2).all(|pair| pair[0].acquisition_revision < pair[1].acquisition_revision));

    held.release().await.unwrap();
    let second_lock = tokio::time::timeout(TEST_TIMEOUT, second_task).await.unwrap().unwrap().unwrap();
    assert!(second_lock.is_held());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!third_task.is_finished());

    let second_token = second_lock.token().unwrap();
    second_lock.release().await.unwrap();
    let third_lock = tokio::time::timeout(TEST_TIMEOUT, third_task).await.unwrap().unwrap().unwrap();
    assert!(third_lock.token().unwrap().value > second_token.value);
    third_lock.release().await.unwrap();
    assert!(store.keys_with_prefix(LOCK_PREFIX).is_empty());
}

#[tokio::test(start_paused = true)]
async fn release_and_reacquire_never_overlaps() {
    let store = Store::new();
    let (_s1, alpha) = locks(&store, "alpha").await;
    let (_s2, beta) = locks(&store, "beta").await;
    let managers = [&alpha, &beta];

    let mut last_token = 0;
    for round in 0..20 {
        let (owner, other) = (managers[round % 2], managers[(round + 1) % 2]);
        let lock = owner.acquire("ledger", &CancellationToken::new()).await.unwrap();
        let token = lock.token().unwrap();
        assert!(token.value > last_token);
        last_token = token.value;

        let err = other.try_acquire("ledger").await.err().unwrap();
        assert!(matches!(err, CoordinationError::Conflict { .. }));
        lock.release().await.unwrap();
    }
    assert!(store.keys_with_prefix(LOCK_PREFIX).is_empty());
}

#[tokio::test(start_paused = true)]
async fn acquire_timeout_withdraws_waiter() {
    let store = Store::new();
    let (_s1, holder) = locks(&store, "holder").await;
    let _held = holder.acquire("printer", &CancellationToken::new()).await.unwrap();

    let session = start_session(&store).await;
    let impatient = LockManager::new(store.clone(), session, LockConfig {
        acquire_timeout_ms: Some(200),
        holder_id: Some("impatient".to_string()),
    });
    let err = impatient.acquire("printer", &CancellationToken::new()).await.err().unwrap();
    assert!(matches!(err, CoordinationError::Timeout { .. }));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let queue = holder.waiters("printer").await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].holder_id, "holder");
}

#[tokio::test(start_paused = true)]
async fn session_expiry_revokes_every_claim() {
    init_tracing();
    let store = Store::new();
    let (session, lock_manager) = locks(&store, "worker").await;
    let elections = ElectionCoordinator::new(store.clone(), session.clone(), ElectionConfig::default());

    let lock = lock_manager.acquire("orders", &CancellationToken::new()).await.unwrap();
    let leader = elections.campaign("svc", "worker", &CancellationToken::new()).await.unwrap();
    let mut lock_events = lock.event_stream().unwrap();
    let mut election_events = leader.event_stream().unwrap();
    assert!(matches!(lock_events.try_next(), Some(LockEvent::Acquired { .. })));
    assert!(matches!(election_events.try_next(), Some(ElectionEvent::Elected { .. })));

    assert!(store.expire_lease(session.lease_id()));

    let lost = tokio::time::timeout(TEST_TIMEOUT, lock_events.next()).await.unwrap().unwrap();
    assert!(matches!(lost, LockEvent::Lost { reason } if reason != RevokeReason::Released));
    let revoked = tokio::time::timeout(TEST_TIMEOUT, election_events.next()).await.unwrap().unwrap();
    assert!(matches!(revoked, ElectionEvent::Revoked { reason } if reason != RevokeReason::Released));

    tokio::time::sleep(TEST_TTL).await;
    assert_eq!(session.state(), SessionState::Expired);
    assert!(!lock.is_held());
    assert!(!leader.is_leader());

    // Releasing a lost lock is not an error.
    lock.release().await.unwrap();
    leader.resign().await.unwrap();
}
