//! Shared fixtures for coordination integration tests.
//!
//! Every test runs against `DeterministicKeyValueStore` on a paused tokio
//! clock, so lease expiry and TTL bounds are exact.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use warden_coordination::ElectionConfig;
use warden_coordination::ElectionCoordinator;
use warden_coordination::LockConfig;
use warden_coordination::LockManager;
use warden_coordination::Session;
use warden_coordination::SessionConfig;
use warden_coordination::SessionManager;
use warden_testing::DeterministicKeyValueStore;

pub type Store = DeterministicKeyValueStore;

/// Lease TTL used throughout the integration tests.
pub const TEST_TTL: Duration = Duration::from_millis(1_000);

/// Slack on top of `TEST_TTL` for reaping, watch delivery, and campaign backoff.
pub const DETECTION_SLACK: Duration = Duration::from_millis(300);

/// Upper bound for anything that should complete promptly.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        ttl_ms: u64::try_from(TEST_TTL.as_millis()).unwrap(),
        keepalive_timeout_ms: 100,
        ..SessionConfig::default()
    }
}

pub async fn start_session(store: &Arc<Store>) -> Session {
    SessionManager::new(store.clone(), session_config()).start_default().await.expect("session starts")
}

pub async fn elections(store: &Arc<Store>) -> (Session, ElectionCoordinator<Store>) {
    let session = start_session(store).await;
    let coordinator = ElectionCoordinator::new(store.clone(), session.clone(), ElectionConfig::default());
    (session, coordinator)
}

pub async fn locks(store: &Arc<Store>, holder: &str) -> (Session, LockManager<Store>) {
    let session = start_session(store).await;
    let manager = LockManager::new(store.clone(), session.clone(), LockConfig {
        holder_id: Some(holder.to_string()),
        ..LockConfig::default()
    });
    (session, manager)
}
