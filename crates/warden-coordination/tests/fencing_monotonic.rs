//! Fencing tokens stay strictly increasing across issuer restarts and holder changes.

mod common;

use common::Store;
use common::TEST_TIMEOUT;
use common::locks;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;
use warden_coordination::FencingIssuer;
use warden_coordination::FencingValidator;
use warden_coordination::HolderProof;
use warden_coordination::RetryConfig;
use warden_coordination::SessionId;
use warden_core::DeleteRequest;
use warden_core::KeyValueStore;
use warden_core::WriteRequest;

#[derive(Debug, Clone, Copy)]
enum Step {
    Issue,
    RestartIssuer,
    UnrelatedWrite,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Issue),
        1 => Just(Step::RestartIssuer),
        1 => Just(Step::UnrelatedWrite),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tokens_increase_across_issuer_restarts(steps in proptest::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let tokens = runtime.block_on(async move {
            let store = Store::new();
            let created = store.write(WriteRequest::put_if_absent("/locks/r/holder", "h", None)).await.unwrap();
            let proof = HolderProof {
                key: "/locks/r/holder".to_string(),
                create_revision: created.header_revision,
            };
            let mut issuer = FencingIssuer::new(store.clone(), RetryConfig::default());
            let mut tokens = Vec::new();
            for (i, step) in steps.into_iter().enumerate() {
                match step {
                    Step::Issue => tokens.push(issuer.issue_token("lock/r", SessionId::new(7), &proof).await.unwrap()),
                    Step::RestartIssuer => issuer = FencingIssuer::new(store.clone(), RetryConfig::default()),
                    Step::UnrelatedWrite => {
                        store.write(WriteRequest::put_if_absent(format!("/noise/{i}"), "x", None)).await.unwrap();
                    }
                }
            }
            tokens
        });

        let validator = FencingValidator::new();
        for pair in tokens.windows(2) {
            prop_assert!(pair[0].value < pair[1].value);
        }
        for token in &tokens {
            prop_assert!(validator.accept(token));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn successor_holder_always_gets_a_larger_token() {
    let store = Store::new();
    let issuer = FencingIssuer::new(store.clone(), RetryConfig::default());
    let validator = FencingValidator::new();
    let mut last = None;

    for holder in 0..5u64 {
        let created = store.write(WriteRequest::put_if_absent("/election/svc", "leader", None)).await.unwrap();
        let proof = HolderProof {
            key: "/election/svc".to_string(),
            create_revision: created.header_revision,
        };
        let token = issuer.issue_token("election/svc", SessionId::new(holder), &proof).await.unwrap();
        assert!(validator.accept(&token));
        if let Some(previous) = last.replace(token.value) {
            assert!(!validator.validate_and_accept("election/svc", previous));
        }
        store.delete(DeleteRequest::new("/election/svc")).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn lock_tokens_survive_a_fresh_manager_on_the_same_store() {
    let store = Store::new();
    let first_token = {
        let (_session, manager) = locks(&store, "before-restart").await;
        let lock = manager.acquire("journal", &CancellationToken::new()).await.unwrap();
        let token = lock.token().unwrap();
        lock.release().await.unwrap();
        token
    };

    let (_session, manager) = locks(&store, "after-restart").await;
    let lock = tokio::time::timeout(TEST_TIMEOUT, manager.acquire("journal", &CancellationToken::new()))
        .await
        .unwrap()
        .unwrap();
    let refreshed = lock.refresh_token().await.unwrap();
    assert!(lock.token().is_some_and(|token| token.value > first_token.value));
    assert!(refreshed.value > first_token.value);
}
