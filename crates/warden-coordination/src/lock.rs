//! FIFO distributed locks tied to a session.
//!
//! Each contender creates a waiter entry under `/locks/{resource}/` whose
//! key embeds the store revision of its creation, zero-padded so key order
//! is revision order. The lowest surviving entry holds the lock. Everyone
//! else watches only the entry directly ahead of it, so a release wakes
//! exactly one waiter and grants follow arrival order.
//!
//! There is no lock heartbeat. Entries are attached to the session lease,
//! and a holder that dies simply stops renewing it.

use std::sync::Arc;
use std::sync::Mutex;

use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use warden_core::KeyValueStore;
use warden_core::KeyValueWithRevision;

use crate::config::LockConfig;
use crate::config::RetryConfig;
use crate::constants::LOCK_PREFIX;
use crate::constants::MAX_QUEUE_ENTRIES;
use crate::constants::MAX_NAME_LEN;
use crate::error::CancelledSnafu;
use crate::error::ConflictSnafu;
use crate::error::CoordinationError;
use crate::error::InvalidArgumentSnafu;
use crate::error::OwnershipLostSnafu;
use crate::fencing::FencingIssuer;
use crate::fencing::HolderProof;
use crate::health::HealthSignal;
use crate::ownership::ContendingGuard;
use crate::ownership::EventStream;
use crate::ownership::HeldRecord;
use crate::ownership::HolderMonitor;
use crate::ownership::OwnershipMachine;
use crate::ownership::OwnershipState;
use crate::ownership::RecordGuard;
use crate::ownership::RevokeReason;
use crate::ownership::Transition;
use crate::ownership::delete_if_owned;
use crate::ownership::wait_for_delete;
use crate::queue::enqueue;
use crate::queue::queue_entries;
use crate::queue::queue_scan;
use crate::retry::deadline_after;
use crate::retry::run_bounded;
use crate::retry::with_retry;
use crate::session::Session;
use crate::types::FencingToken;
use crate::types::LockRecord;
use crate::types::OwnershipStatus;
use crate::types::WaiterEntry;
use crate::types::now_unix_ms;
use crate::verified::WaiterPosition;
use crate::verified::compute_waiter_position;

/// Ownership change for one lock handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// The lock was granted.
    Acquired { token: FencingToken },
    /// The lock was lost without being released.
    Lost { reason: RevokeReason },
    /// The holder released the lock.
    Released,
}

impl From<Transition> for LockEvent {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Acquired { token } => LockEvent::Acquired { token },
            Transition::Revoked {
                reason: RevokeReason::Released,
            } => LockEvent::Released,
            Transition::Revoked { reason } => LockEvent::Lost { reason },
        }
    }
}

/// Grants FIFO locks on behalf of one session.
///
/// # Example
///
/// ```ignore
/// let locks = LockManager::new(store, session, LockConfig::default());
/// let lock = locks.acquire("orders/42", &cancel).await?;
///
/// let token = lock.token().expect("held");
/// storage.write_fenced(&token, record).await?;
///
/// lock.release().await?;
/// ```
pub struct LockManager<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    session: Session,
    config: LockConfig,
    retry: RetryConfig,
    health: Option<HealthSignal>,
}

impl<S: KeyValueStore + ?Sized + 'static> LockManager<S> {
    pub fn new(store: Arc<S>, session: Session, config: LockConfig) -> Self {
        Self {
            store,
            session,
            config,
            retry: RetryConfig::default(),
            health: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Report ownership as unverifiable while `signal` says the cluster is degraded.
    pub fn with_health(mut self, signal: HealthSignal) -> Self {
        self.health = Some(signal);
        self
    }

    /// Queue for `resource` and block until granted, cancelled, timed out,
    /// or the session dies. The waiter entry is removed on any failure.
    pub async fn acquire(&self, resource: &str, cancel: &CancellationToken) -> Result<LockHandle<S>, CoordinationError> {
        let handle = self.handle(resource)?;
        let deadline = deadline_after(self.config.acquire_timeout());
        handle.enqueue(QueueMode::Wait, cancel, deadline).await?;
        Ok(handle)
    }

    /// Take `resource` only if nobody is ahead; otherwise `Conflict`.
    pub async fn try_acquire(&self, resource: &str) -> Result<LockHandle<S>, CoordinationError> {
        let handle = self.handle(resource)?;
        handle.enqueue(QueueMode::NoWait, &CancellationToken::new(), None).await?;
        Ok(handle)
    }

    /// Current queue for `resource`, holder first.
    pub async fn waiters(&self, resource: &str) -> Result<Vec<LockRecord>, CoordinationError> {
        validate_resource(resource)?;
        let prefix = queue_prefix(resource);
        let scan = with_retry("scan lock queue", &self.retry, || self.store.scan(queue_scan(&prefix))).await?;
        queue_entries(&prefix, &scan.kvs)
            .into_iter()
            .enumerate()
            .map(|(position, kv)| parse_lock_record(resource, kv, u32::try_from(position).unwrap_or(u32::MAX)))
            .collect()
    }

    fn handle(&self, resource: &str) -> Result<LockHandle<S>, CoordinationError> {
        validate_resource(resource)?;
        let holder_id = self.config.holder_id.clone().unwrap_or_else(|| self.session.id().to_string());
        Ok(LockHandle {
            store: self.store.clone(),
            session: self.session.clone(),
            issuer: FencingIssuer::new(self.store.clone(), self.retry.clone()),
            retry: self.retry.clone(),
            health: self.health.clone(),
            resource: resource.to_string(),
            holder_id,
            machine: Arc::new(OwnershipMachine::new()),
            monitor: Mutex::new(None),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMode {
    Wait,
    NoWait,
}

/// A granted lock.
///
/// Dropping the handle releases the lock in the background.
pub struct LockHandle<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    session: Session,
    issuer: FencingIssuer<S>,
    retry: RetryConfig,
    health: Option<HealthSignal>,
    resource: String,
    holder_id: String,
    machine: Arc<OwnershipMachine<LockEvent>>,
    monitor: Mutex<Option<HolderMonitor>>,
}

impl<S: KeyValueStore + ?Sized + 'static> LockHandle<S> {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    async fn enqueue(
        &self,
        mode: QueueMode,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<(), CoordinationError> {
        self.session.ensure_live()?;
        if !self.machine.begin_contending() {
            return CancelledSnafu { operation: "acquire" }.fail();
        }
        let _contending = ContendingGuard::new(&self.machine);

        let result = run_bounded("acquire lock", cancel, deadline, self.wait_in_queue(mode)).await;
        match &result {
            Ok(token) => info!(
                resource = %self.resource,
                holder = %self.holder_id,
                fencing_token = token.value,
                "lock acquired"
            ),
            Err(error) => debug!(resource = %self.resource, error = %error, "lock acquire ended"),
        }
        result.map(|_| ())
    }

    async fn wait_in_queue(&self, mode: QueueMode) -> Result<FencingToken, CoordinationError> {
        let prefix = queue_prefix(&self.resource);
        let attempt_id: u64 = rand::rng().random();
        let value = serde_json::to_string(&WaiterEntry {
            holder_id: self.holder_id.clone(),
            session_id: self.session.id(),
            enqueued_at_ms: now_unix_ms(),
            attempt_id,
        })?;

        let own = enqueue(self.store.as_ref(), &self.retry, &self.session, &prefix, &value, attempt_id).await?;
        let own_key = own.key.clone();
        let create_revision = own.create_revision;
        let guard = RecordGuard::new(self.store.clone(), self.retry.clone(), own_key.clone(), create_revision);
        debug!(resource = %self.resource, key = %own_key, "enqueued lock waiter");

        loop {
            self.session.ensure_live()?;
            let scan = with_retry("scan lock queue", &self.retry, || self.store.scan(queue_scan(&prefix))).await?;
            let entries = queue_entries(&prefix, &scan.kvs);
            let keys: Vec<&str> = entries.iter().map(|kv| kv.key.as_str()).collect();

            match compute_waiter_position(&keys, &own_key) {
                WaiterPosition::Holder => {
                    let token = self.claim(&own_key, create_revision).await?;
                    guard.disarm();
                    return Ok(token);
                }
                WaiterPosition::Waiting { predecessor, position } => {
                    if mode == QueueMode::NoWait {
                        let holder = entries
                            .first()
                            .and_then(|kv| serde_json::from_str::<WaiterEntry>(&kv.value).ok())
                            .map(|entry| entry.holder_id)
                            .unwrap_or_default();
                        guard.disarm();
                        if let Err(error) = delete_if_owned(self.store.as_ref(), &self.retry, &own_key, create_revision).await
                        {
                            debug!(key = %own_key, error = %error, "failed to withdraw lock waiter");
                        }
                        return ConflictSnafu {
                            key: self.resource.clone(),
                            holder,
                        }
                        .fail();
                    }
                    debug!(resource = %self.resource, position, predecessor = %predecessor, "waiting for lock");
                    wait_for_delete(self.store.as_ref(), &self.retry, &self.session, &predecessor, scan.header_revision)
                        .await?;
                }
                WaiterPosition::Missing if scan.is_truncated => {
                    return InvalidArgumentSnafu {
                        reason: format!("lock queue for '{}' exceeds {MAX_QUEUE_ENTRIES} waiters", self.resource),
                    }
                    .fail();
                }
                WaiterPosition::Missing => {
                    self.session.ensure_live()?;
                    warn!(resource = %self.resource, key = %own_key, "lock waiter entry disappeared");
                    return OwnershipLostSnafu { key: own_key }.fail();
                }
            }
        }
    }

    async fn claim(&self, key: &str, create_revision: u64) -> Result<FencingToken, CoordinationError> {
        let proof = HolderProof {
            key: key.to_string(),
            create_revision,
        };
        let token = self.issuer.issue_token(&lock_scope(&self.resource), self.session.id(), &proof).await?;
        let record = HeldRecord {
            key: key.to_string(),
            create_revision,
            token: token.clone(),
        };
        if !self.machine.acquire(record.clone()) {
            return CancelledSnafu { operation: "acquire" }.fail();
        }
        let monitor = HolderMonitor::spawn(self.store.clone(), self.session.clone(), self.machine.clone(), record);
        *self.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(monitor);
        Ok(token)
    }

    /// Release the lock. Idempotent; releasing a lost lock is not an error.
    pub async fn release(&self) -> Result<(), CoordinationError> {
        let Some(record) = self.machine.revoke(RevokeReason::Released) else {
            return Ok(());
        };
        self.stop_monitor();
        info!(resource = %self.resource, fencing_token = record.token.value, "lock released");
        delete_if_owned(self.store.as_ref(), &self.retry, &record.key, record.create_revision).await?;
        Ok(())
    }

    /// Token of the current grant, if still held.
    pub fn token(&self) -> Option<FencingToken> {
        self.machine.held().map(|held| held.token)
    }

    /// Obtain a fresh, strictly larger token for the current grant.
    pub async fn refresh_token(&self) -> Result<FencingToken, CoordinationError> {
        let Some(held) = self.machine.held() else {
            return OwnershipLostSnafu {
                key: self.resource.clone(),
            }
            .fail();
        };
        self.session.ensure_live()?;
        let proof = HolderProof {
            key: held.key.clone(),
            create_revision: held.create_revision,
        };
        match self.issuer.issue_token(&lock_scope(&self.resource), self.session.id(), &proof).await {
            Ok(token) => {
                self.machine.refresh(&held.key, token.clone());
                Ok(token)
            }
            Err(error) => {
                if error.is_ownership_loss() && self.machine.revoke(RevokeReason::RecordLost).is_some() {
                    warn!(resource = %self.resource, "lock entry lost during token refresh");
                    self.stop_monitor();
                }
                Err(error)
            }
        }
    }

    /// True while held and the session is live.
    pub fn is_held(&self) -> bool {
        self.machine.state().is_holder() && self.session.ensure_live().is_ok()
    }

    /// Whether side effects may be started under this lock right now.
    pub fn ownership(&self) -> OwnershipStatus {
        let is_degraded = self.health.as_ref().is_some_and(HealthSignal::is_degraded);
        self.machine.status(&self.session, is_degraded)
    }

    pub fn state(&self) -> OwnershipState {
        self.machine.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<OwnershipState> {
        self.machine.subscribe()
    }

    /// The handle's ordered event stream. `None` after the first call.
    pub fn event_stream(&self) -> Option<EventStream<LockEvent>> {
        self.machine.take_events()
    }

    fn stop_monitor(&self) {
        self.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Drop for LockHandle<S> {
    fn drop(&mut self) {
        let Some(record) = self.machine.revoke(RevokeReason::Released) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!(resource = %self.resource, "lock handle dropped while held, releasing");
        let store = self.store.clone();
        let retry = self.retry.clone();
        runtime.spawn(async move {
            if let Err(error) = delete_if_owned(store.as_ref(), &retry, &record.key, record.create_revision).await {
                debug!(key = %record.key, error = %error, "background release failed");
            }
        });
    }
}

fn queue_prefix(resource: &str) -> String {
    format!("{LOCK_PREFIX}{resource}/")
}

fn lock_scope(resource: &str) -> String {
    format!("lock/{resource}")
}

/// Resource keys may not contain `/`: one resource's queue must never be a
/// prefix of another's.
fn validate_resource(resource: &str) -> Result<(), CoordinationError> {
    if resource.is_empty() || resource.len() > MAX_NAME_LEN || resource.contains('/') {
        return InvalidArgumentSnafu {
            reason: format!("lock resource key must be 1..={MAX_NAME_LEN} bytes without '/'"),
        }
        .fail();
    }
    Ok(())
}

fn parse_lock_record(resource: &str, kv: &KeyValueWithRevision, position: u32) -> Result<LockRecord, CoordinationError> {
    let entry: WaiterEntry = serde_json::from_str(&kv.value).map_err(|e| CoordinationError::CorruptedData {
        key: kv.key.clone(),
        reason: e.to_string(),
    })?;
    Ok(LockRecord {
        resource_key: resource.to_string(),
        holder_id: entry.holder_id,
        holder_session_id: entry.session_id,
        acquisition_revision: kv.create_revision,
        queue_position: position,
    })
}
