//! HA health monitoring and degraded-mode reads.
//!
//! [`HealthMonitor`] polls store membership and proves the write path with
//! a probe write to `/health/probe/{monitor_id}`. A quorum loss that lasts
//! longer than the degraded threshold (one session TTL unless configured)
//! raises `degraded` on every [`HealthSignal`] handed out by the monitor.
//! Election and lock handles built `with_health` then report ownership as
//! [`OwnershipStatus::Unverifiable`](crate::OwnershipStatus::Unverifiable)
//! until quorum returns.
//!
//! The signal is an explicit value passed to whoever needs it. There is no
//! process-wide health state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use warden_core::ClusterProbe;
use warden_core::KeyValueStore;
use warden_core::KeyValueWithRevision;
use warden_core::ReadRequest;
use warden_core::WriteCommand;
use warden_core::WriteRequest;

use crate::config::HealthConfig;
use crate::config::RetryConfig;
use crate::constants::HEALTH_PROBE_PREFIX;
use crate::constants::MAX_CACHED_READS;
use crate::error::CoordinationError;
use crate::retry::with_retry;
use crate::types::now_unix_ms;
use crate::types::saturating_millis;
use crate::verified::compute_quorum_threshold;
use crate::verified::has_quorum;
use crate::verified::is_degraded;
use crate::verified::next_quorum_loss_start;

/// One observation of the store cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Members required for a majority.
    pub quorum_size: u32,
    /// Voting members in the cluster.
    pub member_count: u32,
    /// Members the monitor could reach.
    pub reachable_members: u32,
    /// Whether a majority was reachable and the probe write went through.
    pub is_healthy: bool,
    /// Unix ms of the most recent successful probe write.
    pub last_successful_write_ms: Option<u64>,
    /// Unix ms when this observation was taken.
    pub observed_at_ms: u64,
    /// Quorum loss had outlasted the degraded threshold at this observation.
    pub degraded: bool,
}

/// What the monitor currently believes, plus the last healthy observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub current: ClusterHealth,
    /// Most recent healthy observation, if any.
    pub last_good: Option<ClusterHealth>,
    /// Unix ms of `last_good`.
    pub last_good_timestamp_ms: Option<u64>,
    /// Quorum has been lost for longer than the degraded threshold.
    pub degraded: bool,
}

impl HealthSnapshot {
    /// How old the last healthy observation is at `now_ms`.
    ///
    /// `None` if the cluster has never been seen healthy.
    pub fn staleness_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_good_timestamp_ms.map(|ts| now_ms.saturating_sub(ts))
    }
}

/// Read side of a [`HealthMonitor`].
#[derive(Debug, Clone)]
pub struct HealthSignal {
    rx: watch::Receiver<HealthSnapshot>,
}

impl HealthSignal {
    pub fn is_degraded(&self) -> bool {
        self.rx.borrow().degraded
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.rx.borrow().clone()
    }

    /// Receive every snapshot the monitor publishes.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.rx.clone()
    }
}

/// Periodic quorum and write-path checker.
pub struct HealthMonitor<S: KeyValueStore + ClusterProbe + ?Sized + 'static> {
    store: Arc<S>,
    monitor_id: String,
    config: HealthConfig,
    degraded_after_ms: u64,
    started_at: Instant,
    quorum_loss_start_ms: Option<u64>,
    last_successful_write_ms: Option<u64>,
    snapshot_tx: watch::Sender<HealthSnapshot>,
}

impl<S: KeyValueStore + ClusterProbe + ?Sized + 'static> HealthMonitor<S> {
    /// `session_ttl` is the degraded threshold unless the config sets one.
    pub fn new(store: Arc<S>, monitor_id: impl Into<String>, config: HealthConfig, session_ttl: Duration) -> Self {
        let ttl_ms = saturating_millis(session_ttl);
        let degraded_after_ms = config.degraded_after_ms.unwrap_or(ttl_ms);
        let (snapshot_tx, _) = watch::channel(HealthSnapshot::default());
        Self {
            store,
            monitor_id: monitor_id.into(),
            config,
            degraded_after_ms,
            started_at: Instant::now(),
            quorum_loss_start_ms: None,
            last_successful_write_ms: None,
            snapshot_tx,
        }
    }

    pub fn signal(&self) -> HealthSignal {
        HealthSignal {
            rx: self.snapshot_tx.subscribe(),
        }
    }

    pub fn probe_key(&self) -> String {
        format!("{HEALTH_PROBE_PREFIX}{}", self.monitor_id)
    }

    /// Run one poll and publish the result.
    pub async fn check(&mut self) -> HealthSnapshot {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let observed_at_ms = now_unix_ms();

        let status = match tokio::time::timeout(timeout, self.store.cluster_status()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(error)) => {
                debug!(monitor = %self.monitor_id, error = %error, "cluster status poll failed");
                None
            }
            Err(_) => {
                debug!(monitor = %self.monitor_id, "cluster status poll timed out");
                None
            }
        };
        let member_count = status.as_ref().map_or(0, |s| s.voter_count());
        let reachable_members = status.as_ref().map_or(0, |s| s.reachable_count());

        let mut is_healthy = has_quorum(member_count, reachable_members);
        if is_healthy {
            is_healthy = self.probe_write(timeout, observed_at_ms).await;
        }

        let now_ms = self.monotonic_ms();
        let was_degraded = self.snapshot_tx.borrow().degraded;
        self.quorum_loss_start_ms = next_quorum_loss_start(self.quorum_loss_start_ms, is_healthy, now_ms);
        let degraded = is_degraded(self.quorum_loss_start_ms, now_ms, self.degraded_after_ms);

        if degraded && !was_degraded {
            warn!(
                monitor = %self.monitor_id,
                reachable_members,
                member_count,
                degraded_after_ms = self.degraded_after_ms,
                "quorum lost beyond threshold, ownership is unverifiable"
            );
        } else if !degraded && was_degraded {
            info!(monitor = %self.monitor_id, reachable_members, member_count, "quorum restored");
        }

        let current = ClusterHealth {
            quorum_size: compute_quorum_threshold(member_count),
            member_count,
            reachable_members,
            is_healthy,
            last_successful_write_ms: self.last_successful_write_ms,
            observed_at_ms,
            degraded,
        };
        self.snapshot_tx.send_modify(|snapshot| {
            if current.is_healthy {
                snapshot.last_good = Some(current.clone());
                snapshot.last_good_timestamp_ms = Some(observed_at_ms);
            }
            snapshot.current = current;
            snapshot.degraded = degraded;
        });
        self.snapshot_tx.borrow().clone()
    }

    /// Poll every `poll_interval_ms` until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(monitor = %self.monitor_id, degraded_after_ms = self.degraded_after_ms, "health monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.check().await;
                }
            }
        }
        info!(monitor = %self.monitor_id, "health monitor stopped");
    }

    /// Start polling in the background. Returns the signal and task handle.
    pub fn spawn(self, cancel: CancellationToken) -> (HealthSignal, JoinHandle<()>) {
        let signal = self.signal();
        let handle = tokio::spawn(self.run(cancel));
        (signal, handle)
    }

    async fn probe_write(&mut self, timeout: Duration, now_ms: u64) -> bool {
        let request = WriteRequest::from_command(WriteCommand::Put {
            key: self.probe_key(),
            value: serde_json::json!({ "monitor_id": self.monitor_id, "probed_at_ms": now_ms }).to_string(),
            lease_id: None,
        });
        match tokio::time::timeout(timeout, self.store.write(request)).await {
            Ok(Ok(_)) => {
                self.last_successful_write_ms = Some(now_ms);
                true
            }
            Ok(Err(error)) => {
                debug!(monitor = %self.monitor_id, error = %error, "health probe write failed");
                false
            }
            Err(_) => {
                debug!(monitor = %self.monitor_id, "health probe write timed out");
                false
            }
        }
    }

    fn monotonic_ms(&self) -> u64 {
        saturating_millis(self.started_at.elapsed())
    }
}

/// Result of a read through [`LastKnownGood`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Linearizable read from a healthy store.
    Fresh(Option<KeyValueWithRevision>),
    /// Quorum was unavailable; this is what the key held at `as_of_ms`.
    Stale {
        kv: Option<KeyValueWithRevision>,
        as_of_ms: u64,
    },
}

impl ReadOutcome {
    pub fn kv(&self) -> Option<&KeyValueWithRevision> {
        match self {
            ReadOutcome::Fresh(kv) | ReadOutcome::Stale { kv, .. } => kv.as_ref(),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ReadOutcome::Stale { .. })
    }
}

struct CachedRead {
    kv: Option<KeyValueWithRevision>,
    as_of_ms: u64,
}

/// Read-through cache that serves tagged stale values during quorum loss.
///
/// Holds at most `MAX_CACHED_READS` keys; the oldest entry is evicted first.
/// Errors other than quorum loss are returned as-is.
pub struct LastKnownGood<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    retry: RetryConfig,
    cache: Mutex<HashMap<String, CachedRead>>,
}

impl<S: KeyValueStore + ?Sized + 'static> LastKnownGood<S> {
    pub fn new(store: Arc<S>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn read(&self, key: &str) -> Result<ReadOutcome, CoordinationError> {
        let result = with_retry("read", &self.retry, || self.store.read(ReadRequest::new(key))).await;
        match result {
            Ok(read) => {
                self.remember(key, read.kv.clone());
                Ok(ReadOutcome::Fresh(read.kv))
            }
            Err(error) if error.is_quorum_loss() => {
                let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                match cache.get(key) {
                    Some(cached) => {
                        debug!(key, as_of_ms = cached.as_of_ms, "serving stale read during quorum loss");
                        Ok(ReadOutcome::Stale {
                            kv: cached.kv.clone(),
                            as_of_ms: cached.as_of_ms,
                        })
                    }
                    None => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    fn remember(&self, key: &str, kv: Option<KeyValueWithRevision>) {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !cache.contains_key(key) && cache.len() >= MAX_CACHED_READS {
            let oldest = cache.iter().min_by_key(|(_, cached)| cached.as_of_ms).map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
            }
        }
        cache.insert(key.to_string(), CachedRead {
            kv,
            as_of_ms: now_unix_ms(),
        });
    }
}

#[cfg(test)]
mod tests {
    use warden_testing::DeterministicKeyValueStore;

    use super::*;

    fn monitor(store: &Arc<DeterministicKeyValueStore>) -> HealthMonitor<DeterministicKeyValueStore> {
        HealthMonitor::new(store.clone(), "node-1", HealthConfig::default(), Duration::from_millis(1_000))
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_cluster_is_not_degraded() {
        let store = DeterministicKeyValueStore::new();
        let mut monitor = monitor(&store);
        let snapshot = monitor.check().await;

        assert!(!snapshot.degraded);
        assert!(snapshot.current.is_healthy);
        assert!(snapshot.current.last_successful_write_ms.is_some());
        assert_eq!(snapshot.last_good.as_ref(), Some(&snapshot.current));
        assert_eq!(store.keys_with_prefix(HEALTH_PROBE_PREFIX), vec!["/health/probe/node-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn brief_quorum_loss_does_not_degrade() {
        let store = DeterministicKeyValueStore::new();
        let mut monitor = monitor(&store);
        let signal = monitor.signal();
        monitor.check().await;

        store.set_cluster_members(3, 1);
        monitor.check().await;
        tokio::time::advance(Duration::from_millis(1_000)).await;
        let snapshot = monitor.check().await;
        assert!(!snapshot.current.is_healthy);
        assert_eq!(snapshot.current.quorum_size, 2);
        assert!(!signal.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_quorum_loss_degrades_until_restored() {
        let store = DeterministicKeyValueStore::new();
        let mut monitor = monitor(&store);
        let signal = monitor.signal();
        let healthy = monitor.check().await;

        store.set_cluster_members(3, 1);
        monitor.check().await;
        tokio::time::advance(Duration::from_millis(1_001)).await;
        let snapshot = monitor.check().await;
        assert!(snapshot.degraded);
        assert!(snapshot.current.degraded);
        assert!(signal.is_degraded());
        assert_eq!(snapshot.last_good_timestamp_ms, healthy.last_good_timestamp_ms);
        assert!(snapshot.staleness_ms(u64::MAX).is_some());

        store.set_cluster_members(3, 3);
        monitor.check().await;
        assert!(!signal.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_counts_as_quorum_loss() {
        let store = DeterministicKeyValueStore::new();
        let config = HealthConfig {
            degraded_after_ms: Some(100),
            ..HealthConfig::default()
        };
        let mut monitor = HealthMonitor::new(store.clone(), "node-1", config, Duration::from_secs(10));
        store.set_unreachable(true);
        monitor.check().await;
        tokio::time::advance(Duration::from_millis(101)).await;
        let snapshot = monitor.check().await;
        assert!(snapshot.degraded);
        assert_eq!(snapshot.last_good, None);
        assert_eq!(snapshot.staleness_ms(1_000), None);
    }

    #[tokio::test]
    async fn last_known_good_serves_stale_values_during_quorum_loss() {
        let store = DeterministicKeyValueStore::new();
        store.write(WriteRequest::put_if_absent("/config/a", "v1", None)).await.unwrap();
        let reads = LastKnownGood::new(store.clone(), RetryConfig::default());

        let fresh = reads.read("/config/a").await.unwrap();
        assert!(!fresh.is_stale());
        assert_eq!(fresh.kv().map(|kv| kv.value.as_str()), Some("v1"));

        store.set_cluster_members(3, 1);
        let stale = reads.read("/config/a").await.unwrap();
        assert!(stale.is_stale());
        assert_eq!(stale.kv().map(|kv| kv.value.as_str()), Some("v1"));

        let err = reads.read("/config/never-read").await.unwrap_err();
        assert!(err.is_quorum_loss());
    }
}
