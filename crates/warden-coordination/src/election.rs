//! Session-scoped leader election.
//!
//! Provides leader election with:
//! - One leader record per path at `/election/{path}`, attached to the
//!   candidate's session lease
//! - A campaign queue under `/election-candidates/{path}/`: only its head
//!   may insert the leader record, so the earliest campaign by store
//!   revision wins each vacancy
//! - Waiting on a watch for a deletion instead of polling
//! - Fencing tokens issued through a guarded store write on every win
//! - An ordered event stream of `Elected`/`Revoked` per handle
//!
//! Leadership ends the moment the session is expired or closed, or the
//! leader record is deleted or replaced in the store, whichever the holder
//! monitor sees first.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use warden_core::KeyValueStore;
use warden_core::KeyValueWithRevision;
use warden_core::ReadRequest;
use warden_core::WatchRequest;
use warden_core::WatchStream;
use warden_core::WriteRequest;

use crate::config::ElectionConfig;
use crate::config::RetryConfig;
use crate::constants::CANDIDATE_PREFIX;
use crate::constants::ELECTION_PREFIX;
use crate::constants::MAX_CANDIDATE_ID_LEN;
use crate::constants::MAX_NAME_LEN;
use crate::constants::MAX_QUEUE_ENTRIES;
use crate::error::CancelledSnafu;
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
use crate::types::CandidateEntry;
use crate::types::ElectionRecord;
use crate::types::FencingToken;
use crate::types::OwnershipStatus;
use crate::types::now_unix_ms;
use crate::verified::WaiterPosition;
use crate::verified::compute_backoff_with_jitter;
use crate::verified::compute_waiter_position;

/// Leadership change for one election handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    /// This handle became leader.
    Elected { token: FencingToken },
    /// This handle stopped being leader.
    Revoked { reason: RevokeReason },
}

impl From<Transition> for ElectionEvent {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Acquired { token } => ElectionEvent::Elected { token },
            Transition::Revoked { reason } => ElectionEvent::Revoked { reason },
        }
    }
}

/// Runs elections for one session.
///
/// # Example
///
/// ```ignore
/// let coordinator = ElectionCoordinator::new(store, session, ElectionConfig::default());
/// let handle = coordinator.election("scheduler", "node-1")?;
/// let mut events = handle.event_stream().expect("first call");
///
/// let token = handle.campaign(&cancel).await?;
/// while let Some(event) = events.next().await {
///     if let ElectionEvent::Revoked { reason } = event {
///         // stop acting as leader
///     }
/// }
/// ```
pub struct ElectionCoordinator<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    session: Session,
    config: ElectionConfig,
    retry: RetryConfig,
    health: Option<HealthSignal>,
}

impl<S: KeyValueStore + ?Sized + 'static> ElectionCoordinator<S> {
    pub fn new(store: Arc<S>, session: Session, config: ElectionConfig) -> Self {
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

    /// Create an idle handle for `path`. Take its event stream before campaigning
    /// to observe every transition.
    pub fn election(&self, path: &str, candidate_id: &str) -> Result<ElectionHandle<S>, CoordinationError> {
        validate_path(path)?;
        if candidate_id.is_empty() || candidate_id.len() > MAX_CANDIDATE_ID_LEN {
            return InvalidArgumentSnafu {
                reason: format!("candidate ID must be 1..={MAX_CANDIDATE_ID_LEN} bytes"),
            }
            .fail();
        }
        Ok(ElectionHandle {
            store: self.store.clone(),
            session: self.session.clone(),
            issuer: FencingIssuer::new(self.store.clone(), self.retry.clone()),
            config: self.config.clone(),
            retry: self.retry.clone(),
            health: self.health.clone(),
            path: path.to_string(),
            key: election_key(path),
            candidate_id: candidate_id.to_string(),
            machine: Arc::new(OwnershipMachine::new()),
            monitor: Mutex::new(None),
        })
    }

    /// Create a handle and campaign on it.
    pub async fn campaign(
        &self,
        path: &str,
        candidate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ElectionHandle<S>, CoordinationError> {
        let handle = self.election(path, candidate_id)?;
        handle.campaign(cancel).await?;
        Ok(handle)
    }

    /// Current leader of `path`, if any.
    pub async fn leader(&self, path: &str) -> Result<Option<ElectionRecord>, CoordinationError> {
        validate_path(path)?;
        read_leader(self.store.as_ref(), &self.retry, path).await.map(|(leader, _)| leader)
    }

    /// Follow leader changes on `path` without campaigning.
    pub async fn observe(&self, path: &str, cancel: CancellationToken) -> Result<LeaderObserver<S>, CoordinationError> {
        validate_path(path)?;
        let mut observer = LeaderObserver {
            store: self.store.clone(),
            retry: self.retry.clone(),
            path: path.to_string(),
            key: election_key(path),
            current: None,
            stream: None,
            cancel,
        };
        observer.resync().await?;
        Ok(observer)
    }
}

/// One candidate's participation in one election.
///
/// Dropping a leading handle resigns in the background.
pub struct ElectionHandle<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    session: Session,
    issuer: FencingIssuer<S>,
    config: ElectionConfig,
    retry: RetryConfig,
    health: Option<HealthSignal>,
    path: String,
    key: String,
    candidate_id: String,
    machine: Arc<OwnershipMachine<ElectionEvent>>,
    monitor: Mutex<Option<HolderMonitor>>,
}

impl<S: KeyValueStore + ?Sized + 'static> ElectionHandle<S> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    /// Block until elected, cancelled, timed out, or the session dies.
    ///
    /// Returns the fencing token of this term. Campaigning while already
    /// leader returns the current token.
    pub async fn campaign(&self, cancel: &CancellationToken) -> Result<FencingToken, CoordinationError> {
        if let Some(held) = self.machine.held() {
            return Ok(held.token);
        }
        self.session.ensure_live()?;
        if !self.machine.begin_contending() {
            return InvalidArgumentSnafu {
                reason: format!("campaign on '{}' already in progress", self.path),
            }
            .fail();
        }
        let _contending = ContendingGuard::new(&self.machine);

        debug!(election = %self.path, candidate = %self.candidate_id, session_id = %self.session.id(), "campaigning");
        let deadline = deadline_after(self.config.campaign_timeout());
        let result = run_bounded("campaign", cancel, deadline, self.contend()).await;
        match &result {
            Ok(token) => info!(
                election = %self.path,
                candidate = %self.candidate_id,
                fencing_token = token.value,
                "elected leader"
            ),
            Err(error) => debug!(election = %self.path, candidate = %self.candidate_id, error = %error, "campaign ended"),
        }
        result
    }

    async fn contend(&self) -> Result<FencingToken, CoordinationError> {
        let attempt_id: u64 = rand::rng().random();
        let value = serde_json::to_string(&CandidateEntry {
            candidate_id: self.candidate_id.clone(),
            session_id: self.session.id(),
            campaigned_at_ms: now_unix_ms(),
            attempt_id,
        })?;
        let prefix = candidate_prefix(&self.path);
        let ticket = enqueue(self.store.as_ref(), &self.retry, &self.session, &prefix, &value, attempt_id).await?;
        // Leaves the queue however the campaign ends, including on a win.
        let _ticket_guard = RecordGuard::new(self.store.clone(), self.retry.clone(), ticket.key.clone(), ticket.create_revision);
        debug!(election = %self.path, ticket = %ticket.key, "queued campaign");
        let mut backoff_ms = self.config.min_backoff_ms;

        loop {
            self.session.ensure_live()?;
            let scan = with_retry("scan candidates", &self.retry, || self.store.scan(queue_scan(&prefix))).await?;
            let keys: Vec<&str> = queue_entries(&prefix, &scan.kvs).into_iter().map(|kv| kv.key.as_str()).collect();
            match compute_waiter_position(&keys, &ticket.key) {
                WaiterPosition::Holder => {}
                WaiterPosition::Waiting { predecessor, position } => {
                    debug!(election = %self.path, position, predecessor = %predecessor, "earlier campaign queued, waiting");
                    wait_for_delete(self.store.as_ref(), &self.retry, &self.session, &predecessor, scan.header_revision)
                        .await?;
                    continue;
                }
                WaiterPosition::Missing if scan.is_truncated => {
                    return InvalidArgumentSnafu {
                        reason: format!("campaign queue for '{}' exceeds {MAX_QUEUE_ENTRIES} candidates", self.path),
                    }
                    .fail();
                }
                WaiterPosition::Missing => {
                    self.session.ensure_live()?;
                    warn!(election = %self.path, ticket = %ticket.key, "campaign ticket disappeared");
                    return OwnershipLostSnafu { key: ticket.key.clone() }.fail();
                }
            }

            let lease_id = self.session.lease_id();
            let result = with_retry("campaign insert", &self.retry, || {
                self.store.write(WriteRequest::put_if_absent(self.key.clone(), value.clone(), Some(lease_id)))
            })
            .await
            .map_err(|error| self.session.map_lease_error(error))?;

            let create_revision = match (result.succeeded, result.existing) {
                (Some(true), _) => result.header_revision,
                // Our own insert whose reply was lost.
                (_, Some(existing)) if is_written_by(&existing, attempt_id) => {
                    debug!(election = %self.path, revision = existing.create_revision, "adopting leader record from a retried insert");
                    existing.create_revision
                }
                (_, Some(existing)) => {
                    let leader = parse_election_record(&self.path, &existing)?;
                    debug!(election = %self.path, leader = %leader.candidate_id, "leader present, waiting for vacancy");
                    wait_for_delete(self.store.as_ref(), &self.retry, &self.session, &self.key, result.header_revision).await?;

                    let jitter_seed: u64 = rand::rng().random();
                    let backoff = compute_backoff_with_jitter(backoff_ms, self.config.max_backoff_ms, jitter_seed);
                    backoff_ms = backoff.next_backoff_ms;
                    tokio::time::sleep(Duration::from_millis(backoff.sleep_ms)).await;
                    continue;
                }
                // Record vanished between compare and read; try again at once.
                (_, None) => continue,
            };

            match self.claim(create_revision).await {
                Ok(token) => return Ok(token),
                Err(error) if error.is_ownership_loss() => {
                    debug!(election = %self.path, "leader record lost before token issuance, retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Turn a leader record we own into leadership.
    async fn claim(&self, create_revision: u64) -> Result<FencingToken, CoordinationError> {
        let guard = RecordGuard::new(self.store.clone(), self.retry.clone(), self.key.clone(), create_revision);
        let proof = HolderProof {
            key: self.key.clone(),
            create_revision,
        };
        let token = self.issuer.issue_token(&election_scope(&self.path), self.session.id(), &proof).await?;
        guard.disarm();

        let record = HeldRecord {
            key: self.key.clone(),
            create_revision,
            token: token.clone(),
        };
        if !self.machine.acquire(record.clone()) {
            return CancelledSnafu { operation: "campaign" }.fail();
        }
        let monitor = HolderMonitor::spawn(self.store.clone(), self.session.clone(), self.machine.clone(), record);
        *self.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(monitor);
        Ok(token)
    }

    /// Give up leadership. Idempotent; a no-op unless currently leader.
    ///
    /// Ownership ends locally before the record is deleted. An error means
    /// the delete failed and the record will linger until the lease expires.
    pub async fn resign(&self) -> Result<(), CoordinationError> {
        let Some(record) = self.machine.revoke(RevokeReason::Released) else {
            return Ok(());
        };
        self.stop_monitor();
        info!(election = %self.path, candidate = %self.candidate_id, fencing_token = record.token.value, "resigned leadership");
        delete_if_owned(self.store.as_ref(), &self.retry, &record.key, record.create_revision).await?;
        Ok(())
    }

    /// Obtain a fresh, strictly larger token for the current term.
    pub async fn refresh_token(&self) -> Result<FencingToken, CoordinationError> {
        let Some(held) = self.machine.held() else {
            return OwnershipLostSnafu { key: self.key.clone() }.fail();
        };
        self.session.ensure_live()?;
        let proof = HolderProof {
            key: held.key.clone(),
            create_revision: held.create_revision,
        };
        match self.issuer.issue_token(&election_scope(&self.path), self.session.id(), &proof).await {
            Ok(token) => {
                self.machine.refresh(&held.key, token.clone());
                Ok(token)
            }
            Err(error) => {
                if error.is_ownership_loss() && self.machine.revoke(RevokeReason::RecordLost).is_some() {
                    warn!(election = %self.path, "leader record lost during token refresh");
                    self.stop_monitor();
                }
                Err(error)
            }
        }
    }

    /// True while leader and the session is live.
    pub fn is_leader(&self) -> bool {
        self.machine.state().is_holder() && self.session.ensure_live().is_ok()
    }

    /// Whether side effects may be started as leader right now.
    pub fn ownership(&self) -> OwnershipStatus {
        let is_degraded = self.health.as_ref().is_some_and(HealthSignal::is_degraded);
        self.machine.status(&self.session, is_degraded)
    }

    /// Token of the current term.
    pub fn token(&self) -> Option<FencingToken> {
        self.machine.held().map(|held| held.token)
    }

    pub fn state(&self) -> OwnershipState {
        self.machine.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<OwnershipState> {
        self.machine.subscribe()
    }

    /// The handle's ordered event stream. `None` after the first call.
    pub fn event_stream(&self) -> Option<EventStream<ElectionEvent>> {
        self.machine.take_events()
    }

    fn stop_monitor(&self) {
        self.monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Drop for ElectionHandle<S> {
    fn drop(&mut self) {
        let Some(record) = self.machine.revoke(RevokeReason::Released) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!(election = %self.path, "election handle dropped while leader, resigning");
        let store = self.store.clone();
        let retry = self.retry.clone();
        runtime.spawn(async move {
            if let Err(error) = delete_if_owned(store.as_ref(), &retry, &record.key, record.create_revision).await {
                debug!(key = %record.key, error = %error, "background resign failed");
            }
        });
    }
}

/// Follows the leader of one election without campaigning.
pub struct LeaderObserver<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    retry: RetryConfig,
    path: String,
    key: String,
    current: Option<ElectionRecord>,
    stream: Option<WatchStream>,
    cancel: CancellationToken,
}

impl<S: KeyValueStore + ?Sized + 'static> LeaderObserver<S> {
    /// Leader as of the last observed change.
    pub fn current(&self) -> Option<&ElectionRecord> {
        self.current.as_ref()
    }

    /// Wait for the leader to change. Returns the new leader (`None` = vacant).
    pub async fn next_change(&mut self) -> Result<Option<ElectionRecord>, CoordinationError> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                if self.resync_changed().await? {
                    return Ok(self.current.clone());
                }
                continue;
            };
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return CancelledSnafu { operation: "observe" }.fail(),
                event = stream.next_event() => event,
            };
            match event {
                Some(event) if event.key() != self.key => continue,
                Some(event) if event.is_delete() => {
                    if self.current.take().is_some() {
                        return Ok(None);
                    }
                }
                Some(event) => {
                    let leader = parse_election_record(&self.path, &event.kv)?;
                    if self.current.as_ref() != Some(&leader) {
                        self.current = Some(leader);
                        return Ok(self.current.clone());
                    }
                }
                None => self.stream = None,
            }
        }
    }

    async fn resync(&mut self) -> Result<(), CoordinationError> {
        let (leader, header_revision) = read_leader(self.store.as_ref(), &self.retry, &self.path).await?;
        let request = WatchRequest::from_revision(self.key.clone(), header_revision.saturating_add(1));
        self.stream = Some(with_retry("observe leader", &self.retry, || self.store.watch(request.clone())).await?);
        self.current = leader;
        Ok(())
    }

    /// Reopen the watch; true if the leader changed while it was down.
    async fn resync_changed(&mut self) -> Result<bool, CoordinationError> {
        let before = self.current.clone();
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => return CancelledSnafu { operation: "observe" }.fail(),
            result = self.resync() => result?,
        }
        Ok(before != self.current)
    }
}

/// Store key of the leader record for `path`.
pub fn election_key(path: &str) -> String {
    format!("{ELECTION_PREFIX}{path}")
}

/// Prefix of the campaign queue for `path`.
pub fn candidate_prefix(path: &str) -> String {
    format!("{CANDIDATE_PREFIX}{path}/")
}

fn election_scope(path: &str) -> String {
    format!("election/{path}")
}

fn validate_path(path: &str) -> Result<(), CoordinationError> {
    if path.is_empty() || path.len() > MAX_NAME_LEN {
        return InvalidArgumentSnafu {
            reason: format!("election path must be 1..={MAX_NAME_LEN} bytes"),
        }
        .fail();
    }
    Ok(())
}

async fn read_leader<S: KeyValueStore + ?Sized>(
    store: &S,
    retry: &RetryConfig,
    path: &str,
) -> Result<(Option<ElectionRecord>, u64), CoordinationError> {
    let key = election_key(path);
    let read = with_retry("read leader", retry, || store.read(ReadRequest::new(key.clone()))).await?;
    let leader = read.kv.as_ref().map(|kv| parse_election_record(path, kv)).transpose()?;
    Ok((leader, read.header_revision))
}

fn is_written_by(kv: &KeyValueWithRevision, attempt_id: u64) -> bool {
    serde_json::from_str::<CandidateEntry>(&kv.value).is_ok_and(|entry| entry.attempt_id == attempt_id)
}

fn parse_election_record(path: &str, kv: &KeyValueWithRevision) -> Result<ElectionRecord, CoordinationError> {
    let entry: CandidateEntry = serde_json::from_str(&kv.value).map_err(|e| CoordinationError::CorruptedData {
        key: kv.key.clone(),
        reason: e.to_string(),
    })?;
    Ok(ElectionRecord {
        election_path: path.to_string(),
        candidate_id: entry.candidate_id,
        session_id: entry.session_id,
        insertion_revision: kv.create_revision,
    })
}
