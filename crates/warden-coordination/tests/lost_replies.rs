//! Writes that commit while their reply is lost, then get retried.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Store;
use common::TEST_TIMEOUT;
use common::init_tracing;
use common::locks;
use common::session_config;
use tokio_util::sync::CancellationToken;
use warden_coordination::ElectionConfig;
use warden_coordination::ElectionCoordinator;
use warden_coordination::FencingValidator;
use warden_coordination::LockConfig;
use warden_coordination::LockManager;
use warden_coordination::SessionManager;
use warden_coordination::constants::LOCK_PREFIX;
use warden_testing::LostAckStore;
use warden_testing::WriteKind;

type Lossy = LostAckStore<Store>;

async fn lossy_locks(store: &Arc<Lossy>, holder: &str) -> LockManager<Lossy> {
    let session = SessionManager::new(store.clone(), session_config()).start_default().await.unwrap();
    LockManager::new(store.clone(), session, LockConfig {
        holder_id: Some(holder.to_string()),
        ..LockConfig::default()
    })
}

#[tokio::test(start_paused = true)]
async fn uncontended_acquire_survives_a_lost_enqueue_reply() {
    init_tracing();
    let store = LostAckStore::new(Store::new());
    let manager = lossy_locks(&store, "worker").await;
    store.lose_next(WriteKind::CreateSequential, 1);

    let lock = tokio::time::timeout(Duration::from_secs(5), manager.acquire("uncontended", &CancellationToken::new()))
        .await
        .expect("acquire is not stuck behind its own orphan")
        .unwrap();
    assert_eq!(store.lost_acks(), 1);
    assert_eq!(store.inner().keys_with_prefix("/locks/uncontended/").len(), 1);

    lock.release().await.unwrap();
    assert!(store.inner().keys_with_prefix(LOCK_PREFIX).is_empty());
}

#[tokio::test(start_paused = true)]
async fn lost_reply_keeps_arrival_order_for_later_waiters() {
    init_tracing();
    let store = Store::new();
    let lossy = LostAckStore::new(store.clone());
    let (_s1, first) = locks(&store, "first").await;
    let second = Arc::new(lossy_locks(&lossy, "second").await);
    let (_s3, third) = locks(&store, "third").await;
    let third = Arc::new(third);

    let held = first.acquire("journal", &CancellationToken::new()).await.unwrap();
    lossy.lose_next(WriteKind::CreateSequential, 1);
    let second_task = {
        let manager = second.clone();
        tokio::spawn(async move { manager.acquire("journal", &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    let third_task = {
        let manager = third.clone();
        tokio::spawn(async move { manager.acquire("journal", &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(lossy.lost_acks(), 1);
    let queue: Vec<_> = first.waiters("journal").await.unwrap().into_iter().map(|record| record.holder_id).collect();
    assert_eq!(queue, vec!["first", "second", "third"]);

    held.release().await.unwrap();
    let second_lock = tokio::time::timeout(TEST_TIMEOUT, second_task).await.unwrap().unwrap().unwrap();
    assert!(!third_task.is_finished());
    second_lock.release().await.unwrap();
    let third_lock = tokio::time::timeout(TEST_TIMEOUT, third_task).await.unwrap().unwrap().unwrap();
    third_lock.release().await.unwrap();
    assert!(store.keys_with_prefix(LOCK_PREFIX).is_empty());
}

#[tokio::test(start_paused = true)]
async fn adopted_leader_record_is_not_shared_with_a_sibling_handle() {
    init_tracing();
    let store = LostAckStore::new(Store::new());
    let session = SessionManager::new(store.clone(), session_config()).start_default().await.unwrap();
    let coordinator = ElectionCoordinator::new(store.clone(), session, ElectionConfig::default());
    let validator = FencingValidator::new();

    store.lose_next(WriteKind::PutIfAbsent, 1);
    let first = coordinator.election("svc", "node-a").unwrap();
    let first_token = first.campaign(&CancellationToken::new()).await.unwrap();
    assert_eq!(store.lost_acks(), 1);
    assert!(validator.accept(&first_token));

    let second = Arc::new(coordinator.election("svc", "node-a").unwrap());
    let campaign = {
        let handle = second.clone();
        tokio::spawn(async move { handle.campaign(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(first.is_leader());
    assert!(!second.is_leader());
    assert!(!campaign.is_finished());

    first.resign().await.unwrap();
    let second_token = tokio::time::timeout(TEST_TIMEOUT, campaign).await.unwrap().unwrap().unwrap();
    assert!(second.is_leader());
    assert!(!first.is_leader());
    assert!(validator.accept(&second_token));
    assert!(!validator.accept(&first_token));
}
