//! Ownership state shared by elections and locks.
//!
//! An [`OwnershipMachine`] is the single writer for one election handle or
//! lock handle. Every transition and the event it produces happen under one
//! mutex, so consumers see events in exactly the order the state changed,
//! and the unbounded event channel means a slow consumer never stalls the
//! session renewal task or the holder monitor.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use warden_core::KeyValueStore;
use warden_core::KeyValueStoreError;
use warden_core::ReadRequest;
use warden_core::TxnCompare;
use warden_core::TxnOp;
use warden_core::WatchRequest;
use warden_core::WatchStream;
use warden_core::WriteCommand;
use warden_core::WriteRequest;

use crate::config::RetryConfig;
use crate::constants::WATCH_REOPEN_BACKOFF_MS;
use crate::error::CoordinationError;
use crate::retry::with_retry;
use crate::session::Session;
use crate::session::SessionState;
use crate::types::FencingToken;
use crate::types::OwnershipStatus;
use crate::verified::OwnershipPhase;
use crate::verified::OwnershipTrigger;
use crate::verified::next_phase;

/// Why ownership ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    /// The owner resigned or released.
    Released,
    /// The backing session expired.
    SessionExpired,
    /// The backing session was closed.
    SessionClosed,
    /// The record was deleted or replaced in the store.
    RecordLost,
}

/// Explicit ownership state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipState {
    /// Not contending.
    Idle,
    /// Record written (or about to be), waiting to be first in line.
    Contending,
    /// Owner, with the token issued on winning.
    Holder { token: FencingToken },
    /// Was owner; ownership ended.
    Revoked { reason: RevokeReason },
}

impl OwnershipState {
    pub fn phase(&self) -> OwnershipPhase {
        match self {
            OwnershipState::Idle => OwnershipPhase::Idle,
            OwnershipState::Contending => OwnershipPhase::Contending,
            OwnershipState::Holder { .. } => OwnershipPhase::Holder,
            OwnershipState::Revoked { .. } => OwnershipPhase::Revoked,
        }
    }

    pub fn is_holder(&self) -> bool {
        matches!(self, OwnershipState::Holder { .. })
    }
}

/// Ownership transition, converted into an election or lock event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Acquired { token: FencingToken },
    Revoked { reason: RevokeReason },
}

/// The record backing a held ownership claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeldRecord {
    pub key: String,
    pub create_revision: u64,
    pub token: FencingToken,
}

/// Ordered stream of ownership events for one handle.
///
/// There is exactly one stream per handle; it ends when the handle is dropped.
#[derive(Debug)]
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> EventStream<E> {
    /// Wait for the next event. `None` once the handle is gone.
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_next(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

pub(crate) struct OwnershipMachine<E> {
    inner: Mutex<MachineInner<E>>,
    state_tx: watch::Sender<OwnershipState>,
}

struct MachineInner<E> {
    held: Option<HeldRecord>,
    events_tx: mpsc::UnboundedSender<E>,
    events_rx: Option<mpsc::UnboundedReceiver<E>>,
}

impl<E: From<Transition>> OwnershipMachine<E> {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(OwnershipState::Idle);
        Self {
            inner: Mutex::new(MachineInner {
                held: None,
                events_tx,
                events_rx: Some(events_rx),
            }),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner<E>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `trigger` if valid from the current phase.
    fn apply(&self, _inner: &MutexGuard<'_, MachineInner<E>>, trigger: OwnershipTrigger, next: OwnershipState) -> bool {
        let current = self.state_tx.borrow().phase();
        match next_phase(current, trigger) {
            Some(phase) if phase == next.phase() => {
                self.state_tx.send_replace(next);
                true
            }
            _ => false,
        }
    }

    /// Idle or Revoked → Contending.
    pub fn begin_contending(&self) -> bool {
        let inner = self.lock();
        self.apply(&inner, OwnershipTrigger::Contend, OwnershipState::Contending)
    }

    /// Contending → Idle. No-op from any other state.
    pub fn abandon(&self) {
        let inner = self.lock();
        self.apply(&inner, OwnershipTrigger::Abandon, OwnershipState::Idle);
    }

    /// Contending → Holder, emitting `Acquired`.
    pub fn acquire(&self, record: HeldRecord) -> bool {
        let mut inner = self.lock();
        let token = record.token.clone();
        if !self.apply(&inner, OwnershipTrigger::Win, OwnershipState::Holder { token: token.clone() }) {
            return false;
        }
        inner.held = Some(record);
        let _ = inner.events_tx.send(E::from(Transition::Acquired { token }));
        true
    }

    /// Holder → Revoked, emitting `Revoked`. Returns the record that was held.
    pub fn revoke(&self, reason: RevokeReason) -> Option<HeldRecord> {
        let mut inner = self.lock();
        if !self.apply(&inner, OwnershipTrigger::Revoke, OwnershipState::Revoked { reason }) {
            return None;
        }
        let _ = inner.events_tx.send(E::from(Transition::Revoked { reason }));
        inner.held.take()
    }

    /// Replace the held token after a refresh. False if no longer holder.
    pub fn refresh(&self, key: &str, token: FencingToken) -> bool {
        let mut inner = self.lock();
        let Some(held) = inner.held.as_mut().filter(|held| held.key == key) else {
            return false;
        };
        held.token = token.clone();
        self.state_tx.send_replace(OwnershipState::Holder { token });
        true
    }

    pub fn held(&self) -> Option<HeldRecord> {
        self.lock().held.clone()
    }

    pub fn state(&self) -> OwnershipState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OwnershipState> {
        self.state_tx.subscribe()
    }

    pub fn take_events(&self) -> Option<EventStream<E>> {
        self.lock().events_rx.take().map(|rx| EventStream { rx })
    }

    /// Classify a claim for callers about to perform a side effect.
    pub fn status(&self, session: &Session, is_cluster_degraded: bool) -> OwnershipStatus {
        if !self.state_tx.borrow().is_holder() {
            return OwnershipStatus::NotHeld;
        }
        match session.state() {
            SessionState::Expired | SessionState::Closed => OwnershipStatus::NotHeld,
            SessionState::Degraded => OwnershipStatus::Unverifiable,
            SessionState::Active if is_cluster_degraded => OwnershipStatus::Unverifiable,
            SessionState::Active => OwnershipStatus::Held,
        }
    }
}

/// Resets a machine stuck in `Contending` when a campaign or acquire future
/// fails or is dropped.
pub(crate) struct ContendingGuard<'a, E: From<Transition>> {
    machine: &'a OwnershipMachine<E>,
}

impl<'a, E: From<Transition>> ContendingGuard<'a, E> {
    pub fn new(machine: &'a OwnershipMachine<E>) -> Self {
        Self { machine }
    }
}

impl<E: From<Transition>> Drop for ContendingGuard<'_, E> {
    fn drop(&mut self) {
        self.machine.abandon();
    }
}

/// Background task watching a held record and the session behind it.
pub(crate) struct HolderMonitor {
    cancel: CancellationToken,
}

impl HolderMonitor {
    /// Start monitoring. The first of these revokes ownership:
    /// - the session reaches a terminal state
    /// - the record is deleted or recreated by someone else
    pub fn spawn<S, E>(store: Arc<S>, session: Session, machine: Arc<OwnershipMachine<E>>, record: HeldRecord) -> Self
    where
        S: KeyValueStore + ?Sized + 'static,
        E: From<Transition> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        tokio::spawn(monitor_holder(store, session, machine, record, cancel.clone()));
        Self { cancel }
    }
}

impl Drop for HolderMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn revoke_reason_for(state: SessionState) -> Option<RevokeReason> {
    match state {
        SessionState::Expired => Some(RevokeReason::SessionExpired),
        SessionState::Closed => Some(RevokeReason::SessionClosed),
        SessionState::Active | SessionState::Degraded => None,
    }
}

async fn monitor_holder<S, E>(
    store: Arc<S>,
    session: Session,
    machine: Arc<OwnershipMachine<E>>,
    record: HeldRecord,
    cancel: CancellationToken,
) where
    S: KeyValueStore + ?Sized + 'static,
    E: From<Transition> + Send + 'static,
{
    let mut session_rx = session.subscribe();
    let mut watch: Option<WatchStream> = None;
    let mut resume_from = record.create_revision.saturating_add(1);
    let mut needs_verify = false;

    loop {
        if let Some(reason) = revoke_reason_for(*session_rx.borrow_and_update()) {
            machine.revoke(reason);
            return;
        }

        if watch.is_none() {
            match open_record_watch(store.as_ref(), &record, resume_from, needs_verify).await {
                Ok(WatchOpen::Watching(stream, from)) => {
                    watch = Some(stream);
                    resume_from = from;
                }
                Ok(WatchOpen::RecordGone) => {
                    warn!(key = %record.key, fencing_token = record.token.value, "held record disappeared");
                    machine.revoke(RevokeReason::RecordLost);
                    return;
                }
                Err(error) => {
                    debug!(key = %record.key, error = %error, "holder watch unavailable, retrying");
                    needs_verify = true;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = session_rx.changed() => {
                if changed.is_err() {
                    let reason = revoke_reason_for(*session_rx.borrow()).unwrap_or(RevokeReason::SessionExpired);
                    machine.revoke(reason);
                    return;
                }
            }
            event = next_watch_event(&mut watch) => match event {
                Some(event) => {
                    resume_from = event.revision.saturating_add(1);
                    if event.key() == record.key && (event.is_delete() || event.kv.create_revision != record.create_revision) {
                        warn!(key = %record.key, revision = event.revision, fencing_token = record.token.value, "held record deleted or replaced");
                        machine.revoke(RevokeReason::RecordLost);
                        return;
                    }
                }
                None => {
                    debug!(key = %record.key, "holder watch closed, reopening");
                    watch = None;
                    needs_verify = true;
                }
            },
            _ = tokio::time::sleep(Duration::from_millis(WATCH_REOPEN_BACKOFF_MS)), if watch.is_none() => {}
        }
    }
}

enum WatchOpen {
    Watching(WatchStream, u64),
    RecordGone,
}

/// Open a watch on the held key. After a gap, re-read the key first so a
/// deletion lost to compaction or a broken stream is still detected.
async fn open_record_watch<S>(
    store: &S,
    record: &HeldRecord,
    resume_from: u64,
    needs_verify: bool,
) -> Result<WatchOpen, CoordinationError>
where
    S: KeyValueStore + ?Sized,
{
    let mut from = resume_from;
    if needs_verify {
        let read = store.read(ReadRequest::new(record.key.clone())).await?;
        match read.kv {
            Some(kv) if kv.create_revision == record.create_revision => from = read.header_revision.saturating_add(1),
            _ => return Ok(WatchOpen::RecordGone),
        }
    }
    let stream = store.watch(WatchRequest::from_revision(record.key.clone(), from)).await?;
    Ok(WatchOpen::Watching(stream, from))
}

async fn next_watch_event(watch: &mut Option<WatchStream>) -> Option<warden_core::WatchEvent> {
    match watch {
        Some(stream) => stream.next_event().await,
        None => std::future::pending().await,
    }
}

/// Wait until `key` is deleted at some revision after `seen_revision`.
///
/// Returns early (Ok) when the watch closes or its history was compacted;
/// callers re-read the store and decide again. Returns the session's
/// terminal error if it dies while waiting.
pub(crate) async fn wait_for_delete<S>(
    store: &S,
    retry: &RetryConfig,
    session: &Session,
    key: &str,
    seen_revision: u64,
) -> Result<(), CoordinationError>
where
    S: KeyValueStore + ?Sized,
{
    let request = WatchRequest::from_revision(key.to_string(), seen_revision.saturating_add(1));
    let mut stream = match with_retry("watch for deletion", retry, || store.watch(request.clone())).await {
        Ok(stream) => stream,
        Err(CoordinationError::Storage {
            source: KeyValueStoreError::Compacted { .. },
        }) => return Ok(()),
        Err(error) => return Err(error),
    };

    loop {
        tokio::select! {
            error = session.invalidated() => return Err(error),
            event = stream.next_event() => match event {
                Some(event) if event.key() == key && event.is_delete() => return Ok(()),
                Some(_) => continue,
                None => return Ok(()),
            },
        }
    }
}

/// Delete `key` only if it still has `create_revision`.
///
/// Never removes a successor's record that happens to reuse the key.
pub(crate) async fn delete_if_owned<S>(
    store: &S,
    retry: &RetryConfig,
    key: &str,
    create_revision: u64,
) -> Result<bool, CoordinationError>
where
    S: KeyValueStore + ?Sized,
{
    let request = || {
        store.write(WriteRequest::from_command(WriteCommand::Transaction {
            compare: vec![TxnCompare::CreateRevisionEquals {
                key: key.to_string(),
                revision: create_revision,
            }],
            success: vec![TxnOp::Delete { key: key.to_string() }],
            failure: vec![],
        }))
    };
    let result = with_retry("delete owned record", retry, request).await?;
    Ok(result.succeeded.unwrap_or(false))
}

/// Deletes a partially written record on drop unless disarmed.
///
/// Covers cancellation, timeouts, errors, and a dropped future alike: the
/// cleanup is spawned, so it runs even though the caller is gone.
pub(crate) struct RecordGuard<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    retry: RetryConfig,
    key: String,
    create_revision: u64,
    is_armed: bool,
}

impl<S: KeyValueStore + ?Sized + 'static> RecordGuard<S> {
    pub fn new(store: Arc<S>, retry: RetryConfig, key: String, create_revision: u64) -> Self {
        Self {
            store,
            retry,
            key,
            create_revision,
            is_armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.is_armed = false;
    }
}

impl<S: KeyValueStore + ?Sized + 'static> Drop for RecordGuard<S> {
    fn drop(&mut self) {
        if !self.is_armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let retry = self.retry.clone();
        let key = std::mem::take(&mut self.key);
        let create_revision = self.create_revision;
        runtime.spawn(async move {
            match delete_if_owned(store.as_ref(), &retry, &key, create_revision).await {
                Ok(is_deleted) => debug!(key = %key, is_deleted, "cleaned up abandoned record"),
                Err(error) => debug!(key = %key, error = %error, "abandoned record cleanup failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use warden_testing::DeterministicKeyValueStore;

    use super::*;
    use crate::types::SessionId;

    #[derive(Debug, PartialEq, Eq)]
    struct Recorded(Transition);

    impl From<Transition> for Recorded {
        fn from(t: Transition) -> Self {
            Recorded(t)
        }
    }

    fn token(value: u64) -> FencingToken {
        FencingToken {
            value,
            scope: "lock/r".to_string(),
            session_id: SessionId::new(1),
        }
    }

    fn record(value: u64) -> HeldRecord {
        HeldRecord {
            key: "/locks/r/00000000000000000001".to_string(),
            create_revision: 1,
            token: token(value),
        }
    }

    #[test]
    fn transitions_emit_events_in_order() {
        let machine = OwnershipMachine::<Recorded>::new();
        let mut events = machine.take_events().unwrap();
        assert!(machine.take_events().is_none());

        assert!(machine.begin_contending());
        assert!(machine.acquire(record(3)));
        assert_eq!(machine.revoke(RevokeReason::Released), Some(record(3)));
        assert!(machine.revoke(RevokeReason::SessionExpired).is_none());

        assert_eq!(events.try_next(), Some(Recorded(Transition::Acquired { token: token(3) })));
        assert_eq!(
            events.try_next(),
            Some(Recorded(Transition::Revoked {
                reason: RevokeReason::Released
            }))
        );
        assert_eq!(events.try_next(), None);
        assert_eq!(machine.state(), OwnershipState::Revoked {
            reason: RevokeReason::Released
        });
    }

    #[test]
    fn acquire_requires_contending() {
        let machine = OwnershipMachine::<Recorded>::new();
        assert!(!machine.acquire(record(1)));
        assert_eq!(machine.state(), OwnershipState::Idle);
    }

    #[test]
    fn contending_guard_resets_to_idle() {
        let machine = OwnershipMachine::<Recorded>::new();
        assert!(machine.begin_contending());
        drop(ContendingGuard::new(&machine));
        assert_eq!(machine.state(), OwnershipState::Idle);
    }

    #[test]
    fn refresh_replaces_token_silently() {
        let machine = OwnershipMachine::<Recorded>::new();
        let mut events = machine.take_events().unwrap();
        machine.begin_contending();
        machine.acquire(record(3));
        let _ = events.try_next();

        assert!(machine.refresh(&record(3).key, token(8)));
        assert_eq!(machine.held().unwrap().token.value, 8);
        assert_eq!(machine.state(), OwnershipState::Holder { token: token(8) });
        assert_eq!(events.try_next(), None);
        assert!(!machine.refresh("/locks/other", token(9)));
    }

    #[tokio::test]
    async fn guarded_delete_spares_successor_record() {
        let store = DeterministicKeyValueStore::new();
        let first = store.write(WriteRequest::put_if_absent("/election/a", "one", None)).await.unwrap();
        store.delete(warden_core::DeleteRequest::new("/election/a")).await.unwrap();
        store.write(WriteRequest::put_if_absent("/election/a", "two", None)).await.unwrap();

        let is_deleted =
            delete_if_owned(store.as_ref(), &RetryConfig::default(), "/election/a", first.header_revision).await.unwrap();
        assert!(!is_deleted);
        assert_eq!(store.keys_with_prefix("/election/"), vec!["/election/a".to_string()]);
    }

    #[tokio::test]
    async fn record_guard_cleans_up_on_drop() {
        let store = DeterministicKeyValueStore::new();
        let created = store.write(WriteRequest::put_if_absent("/election/b", "x", None)).await.unwrap();
        drop(RecordGuard::new(store.clone(), RetryConfig::default(), "/election/b".to_string(), created.header_revision));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.keys_with_prefix("/election/").is_empty());
    }
}
