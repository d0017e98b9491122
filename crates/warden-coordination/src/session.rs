//! Sessions: a store lease plus the task that keeps it alive.
//!
//! Every election record and lock waiter entry is attached to a session's
//! lease, so the lease is the single source of truth for "is this owner
//! still alive". The renewal task is the only writer of the session state:
//!
//! ```text
//!   Active ⇄ Degraded ──▶ Expired   (terminal)
//!      │         │
//!      └─────────┴──────▶ Closed    (terminal)
//! ```
//!
//! Local expiry is measured from the moment the last *confirmed* keep-alive
//! was sent. When that is more than one TTL ago the session expires itself
//! even if the store has not said so, because the store may already have
//! handed our records to someone else.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use warden_core::KeyValueStore;
use warden_core::KeyValueStoreError;
use warden_core::WriteRequest;

use crate::config::RetryConfig;
use crate::config::SessionConfig;
use crate::error::CoordinationError;
use crate::error::InvalidArgumentSnafu;
use crate::retry::with_retry;
use crate::types::SessionId;
use crate::types::saturating_millis;
use crate::verified::RenewalDecision;
use crate::verified::compute_backoff_with_jitter;
use crate::verified::compute_retry_delay_ms;
use crate::verified::evaluate_renewal;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Last renewal succeeded.
    Active,
    /// Renewals are failing; the lease may still be alive in the store.
    Degraded,
    /// The lease is gone or presumed gone. Permanent.
    Expired,
    /// The owner closed the session. Permanent.
    Closed,
}

impl SessionState {
    /// Returns true for `Expired` and `Closed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

/// Starts sessions against a store.
pub struct SessionManager<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    config: SessionConfig,
    retry: RetryConfig,
}

impl<S: KeyValueStore + ?Sized + 'static> SessionManager<S> {
    /// Create a session manager.
    pub fn new(store: Arc<S>, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry budget used for the lease grant.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Start a session with the configured default TTL.
    pub async fn start_default(&self) -> Result<Session, CoordinationError> {
        self.start(self.config.ttl()).await
    }

    /// Grant a lease of `ttl` and start renewing it in the background.
    pub async fn start(&self, ttl: Duration) -> Result<Session, CoordinationError> {
        let ttl_ms = saturating_millis(ttl);
        if ttl_ms == 0 {
            return InvalidArgumentSnafu {
                reason: "session TTL must be positive",
            }
            .fail();
        }
        let renew_interval = self.config.renew_interval_for(ttl_ms);

        let sent_at = Instant::now();
        let granted =
            with_retry("lease grant", &self.retry, || self.store.write(WriteRequest::lease_grant(ttl_ms))).await?;
        let lease_id = granted.lease_id.ok_or_else(|| CoordinationError::Storage {
            source: KeyValueStoreError::Failed {
                reason: "lease grant returned no lease ID".to_string(),
            },
        })?;
        let id = SessionId::new(lease_id);

        let (state_tx, state_rx) = watch::channel(SessionState::Active);
        let stats = Arc::new(RenewalStats::new(sent_at));
        let cancel = CancellationToken::new();

        let task = RenewalTask {
            store: self.store.clone(),
            id,
            ttl_ms,
            renew_interval,
            config: self.config.clone(),
            state_tx,
            stats: stats.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        info!(session_id = %id, ttl_ms, renew_interval_ms = saturating_millis(renew_interval), "session started");

        Ok(Session {
            shared: Arc::new(SessionShared {
                id,
                ttl,
                renew_interval,
                state_rx,
                stats,
                cancel,
            }),
        })
    }
}

/// A live claim on a store lease.
///
/// Cheap to clone; all clones share one renewal task. Dropping the last
/// clone closes the session (best-effort lease revoke in the background).
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    id: SessionId,
    ttl: Duration,
    renew_interval: Duration,
    state_rx: watch::Receiver<SessionState>,
    stats: Arc<RenewalStats>,
    cancel: CancellationToken,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("ttl", &self.shared.ttl)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn lease_id(&self) -> u64 {
        self.shared.id.lease_id()
    }

    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    pub fn renew_interval(&self) -> Duration {
        self.shared.renew_interval
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.shared.state_rx.borrow()
    }

    /// Watch state changes. The final value of a dead session is terminal.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_rx.clone()
    }

    /// When the last confirmed keep-alive was sent.
    pub fn last_renewal(&self) -> Instant {
        self.shared.stats.last_renewal()
    }

    /// Failed keep-alives since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.shared.stats.consecutive_failures.load(Ordering::Acquire)
    }

    /// Ok while the session is `Active` or `Degraded`.
    pub fn ensure_live(&self) -> Result<(), CoordinationError> {
        match self.state() {
            SessionState::Active | SessionState::Degraded => Ok(()),
            state => Err(self.terminal_error(state)),
        }
    }

    /// Resolves once the session is dead, with the reason.
    ///
    /// Race this against work that must stop when the session ends.
    pub async fn invalidated(&self) -> CoordinationError {
        let mut rx = self.shared.state_rx.clone();
        let state = match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => *state,
            // Renewal task gone without publishing a terminal state.
            Err(_) => SessionState::Expired,
        };
        self.terminal_error(state)
    }

    /// Stop renewing and revoke the lease.
    ///
    /// Returns once the session is terminal. The revoke itself is
    /// best-effort and never blocks this call; the lease TTL is the backstop.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let mut rx = self.shared.state_rx.clone();
        let _ = rx.wait_for(SessionState::is_terminal).await;
    }

    pub(crate) fn terminal_error(&self, state: SessionState) -> CoordinationError {
        let session_id = self.shared.id;
        match state {
            SessionState::Closed => CoordinationError::SessionClosed { session_id },
            _ => CoordinationError::SessionExpired { session_id },
        }
    }

    /// The store rejecting our lease is proof the session is gone.
    pub(crate) fn map_lease_error(&self, error: CoordinationError) -> CoordinationError {
        match error {
            CoordinationError::Storage {
                source: KeyValueStoreError::LeaseNotFound { lease_id },
            } if lease_id == self.lease_id() => CoordinationError::SessionExpired { session_id: self.id() },
            error => error,
        }
    }
}

struct RenewalStats {
    last_renewal: Mutex<Instant>,
    consecutive_failures: AtomicU32,
}

impl RenewalStats {
    fn new(granted_at: Instant) -> Self {
        Self {
            last_renewal: Mutex::new(granted_at),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn last_renewal(&self) -> Instant {
        *self.last_renewal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_success(&self, sent_at: Instant) {
        *self.last_renewal.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = sent_at;
        self.consecutive_failures.store(0, Ordering::Release);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }
}

struct RenewalTask<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    id: SessionId,
    ttl_ms: u64,
    renew_interval: Duration,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    stats: Arc<RenewalStats>,
    cancel: CancellationToken,
}

impl<S: KeyValueStore + ?Sized + 'static> RenewalTask<S> {
    async fn run(self) {
        let keepalive_timeout = Duration::from_millis(self.config.keepalive_timeout_ms);
        let mut backoff_ms = self.config.renew_initial_backoff_ms;
        let mut next_delay = self.renew_interval;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return self.close().await,
                _ = tokio::time::sleep(next_delay) => {}
            }

            let failures = self.stats.consecutive_failures.load(Ordering::Acquire);
            if evaluate_renewal(self.elapsed_since_renewal_ms(), self.ttl_ms, failures) == RenewalDecision::Expired {
                return self.expire("ttl elapsed without confirmed renewal").await;
            }

            let sent_at = Instant::now();
            let keepalive = self.store.write(WriteRequest::lease_keepalive(self.id.lease_id()));
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return self.close().await,
                outcome = tokio::time::timeout(keepalive_timeout, keepalive) => outcome,
            };

            let error = match outcome {
                Ok(Ok(_)) => {
                    self.stats.record_success(sent_at);
                    backoff_ms = self.config.renew_initial_backoff_ms;
                    next_delay = self.renew_interval;
                    if self.set_state(SessionState::Active) {
                        info!(session_id = %self.id, "session renewal recovered");
                    } else {
                        debug!(session_id = %self.id, "session renewed");
                    }
                    continue;
                }
                Ok(Err(KeyValueStoreError::LeaseNotFound { .. })) => {
                    return self.expire("lease not found in store").await;
                }
                Ok(Err(error)) => error.to_string(),
                Err(_) => format!("keep-alive timed out after {}ms", keepalive_timeout.as_millis()),
            };

            let failures = self.stats.record_failure();
            let elapsed_ms = self.elapsed_since_renewal_ms();
            if evaluate_renewal(elapsed_ms, self.ttl_ms, failures) == RenewalDecision::Expired {
                return self.expire("ttl elapsed without confirmed renewal").await;
            }

            let jitter_seed: u64 = rand::rng().random();
            let backoff = compute_backoff_with_jitter(backoff_ms, self.config.renew_max_backoff_ms, jitter_seed);
            backoff_ms = backoff.next_backoff_ms;
            next_delay = Duration::from_millis(compute_retry_delay_ms(backoff.sleep_ms, elapsed_ms, self.ttl_ms));

            self.set_state(SessionState::Degraded);
            warn!(
                session_id = %self.id,
                failures,
                elapsed_ms,
                retry_in_ms = saturating_millis(next_delay),
                error = %error,
                "session renewal failed"
            );
        }
    }

    fn elapsed_since_renewal_ms(&self) -> u64 {
        saturating_millis(self.stats.last_renewal().elapsed())
    }

    /// Publish `state` unless already there or terminal. Returns true if it changed.
    fn set_state(&self, state: SessionState) -> bool {
        self.state_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                return false;
            }
            *current = state;
            true
        })
    }

    async fn expire(&self, reason: &str) {
        if self.set_state(SessionState::Expired) {
            warn!(session_id = %self.id, reason, "session expired");
        }
        // Local expiry may precede the store's; give our records up now.
        self.revoke().await;
    }

    async fn close(&self) {
        if self.set_state(SessionState::Closed) {
            info!(session_id = %self.id, "session closed");
        }
        self.revoke().await;
    }

    async fn revoke(&self) {
        let timeout = Duration::from_millis(self.config.revoke_timeout_ms);
        let revoke = self.store.write(WriteRequest::lease_revoke(self.id.lease_id()));
        match tokio::time::timeout(timeout, revoke).await {
            Ok(Ok(_)) => debug!(session_id = %self.id, "lease revoked"),
            Ok(Err(KeyValueStoreError::LeaseNotFound { .. })) => {}
            Ok(Err(error)) => debug!(session_id = %self.id, error = %error, "best-effort lease revoke failed"),
            Err(_) => debug!(session_id = %self.id, "best-effort lease revoke timed out"),
        }
    }
}
