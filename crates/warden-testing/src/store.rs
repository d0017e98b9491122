//! In-memory linearizable store with leases and watches.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use warden_core::ClusterProbe;
use warden_core::ClusterStatus;
use warden_core::DeleteRequest;
use warden_core::DeleteResult;
use warden_core::KeyValueStore;
use warden_core::KeyValueStoreError;
use warden_core::KeyValueWithRevision;
use warden_core::MemberStatus;
use warden_core::ReadRequest;
use warden_core::ReadResult;
use warden_core::ScanRequest;
use warden_core::ScanResult;
use warden_core::TxnCompare;
use warden_core::TxnOp;
use warden_core::WatchEvent;
use warden_core::WatchEventType;
use warden_core::WatchRequest;
use warden_core::WatchStream;
use warden_core::WriteCommand;
use warden_core::WriteRequest;
use warden_core::WriteResult;
use warden_core::sequential_key;

/// Number of change events retained for watch replay.
const MAX_HISTORY_EVENTS: usize = 10_000;

/// Maximum entries returned by one scan.
const MAX_SCAN_RESULTS: usize = 10_000;

/// How often the background reaper checks lease deadlines.
const LEASE_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// First lease ID handed out.
const FIRST_LEASE_ID: u64 = 0x1000;

#[derive(Clone)]
struct Entry {
    value: String,
    create_revision: u64,
    mod_revision: u64,
    version: u64,
    lease_id: Option<u64>,
}

impl Entry {
    fn to_kv(&self, key: &str) -> KeyValueWithRevision {
        KeyValueWithRevision {
            key: key.to_string(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease_id: self.lease_id,
        }
    }
}

struct LeaseState {
    ttl_ms: u64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// Injected failure conditions.
struct Faults {
    is_unreachable: bool,
    member_count: u32,
    reachable_members: u32,
    blocked_keepalives: HashSet<u64>,
}

impl Faults {
    fn quorum(&self) -> u32 {
        if self.member_count == 0 {
            return 0;
        }
        self.member_count / 2 + 1
    }

    fn check(&self) -> Result<(), KeyValueStoreError> {
        if self.is_unreachable {
            return Err(KeyValueStoreError::Unavailable {
                reason: "store unreachable (injected partition)".to_string(),
            });
        }
        if self.reachable_members < self.quorum() {
            return Err(KeyValueStoreError::QuorumUnavailable {
                reachable: self.reachable_members,
                required: self.quorum(),
            });
        }
        Ok(())
    }
}

struct StoreState {
    revision: u64,
    data: BTreeMap<String, Entry>,
    leases: HashMap<u64, LeaseState>,
    next_lease_id: u64,
    history: VecDeque<WatchEvent>,
    /// Highest revision evicted from `history` (0 = nothing evicted).
    compacted_revision: u64,
    watchers: Vec<Watcher>,
    faults: Faults,
}

impl StoreState {
    fn new() -> Self {
        Self {
            revision: 0,
            data: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease_id: FIRST_LEASE_ID,
            history: VecDeque::new(),
            compacted_revision: 0,
            watchers: Vec::new(),
            faults: Faults {
                is_unreachable: false,
                member_count: 3,
                reachable_members: 3,
                blocked_keepalives: HashSet::new(),
            },
        }
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn emit(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if !event.kv.key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
        if self.history.len() >= MAX_HISTORY_EVENTS
            && let Some(evicted) = self.history.pop_front()
        {
            self.compacted_revision = evicted.revision;
        }
        self.history.push_back(event);
    }

    fn ensure_lease(&self, lease_id: Option<u64>) -> Result<(), KeyValueStoreError> {
        match lease_id {
            Some(id) if !self.leases.contains_key(&id) => Err(KeyValueStoreError::LeaseNotFound { lease_id: id }),
            _ => Ok(()),
        }
    }

    fn apply_put(&mut self, key: &str, value: &str, lease_id: Option<u64>, revision: u64) {
        let previous = self.data.get(key).cloned();
        if let Some(old_lease) = previous.as_ref().and_then(|e| e.lease_id)
            && Some(old_lease) != lease_id
            && let Some(lease) = self.leases.get_mut(&old_lease)
        {
            lease.keys.remove(key);
        }
        let entry = match previous {
            Some(prev) => Entry {
                value: value.to_string(),
                create_revision: prev.create_revision,
                mod_revision: revision,
                version: prev.version + 1,
                lease_id,
            },
            None => Entry {
                value: value.to_string(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease_id,
            },
        };
        if let Some(id) = lease_id
            && let Some(lease) = self.leases.get_mut(&id)
        {
            lease.keys.insert(key.to_string());
        }
        let kv = entry.to_kv(key);
        self.data.insert(key.to_string(), entry);
        self.emit(WatchEvent {
            event_type: WatchEventType::Put,
            kv,
            revision,
        });
    }

    fn apply_delete(&mut self, key: &str, revision: u64) -> bool {
        let Some(entry) = self.data.remove(key) else {
            return false;
        };
        if let Some(id) = entry.lease_id
            && let Some(lease) = self.leases.get_mut(&id)
        {
            lease.keys.remove(key);
        }
        let mut kv = entry.to_kv(key);
        kv.mod_revision = revision;
        self.emit(WatchEvent {
            event_type: WatchEventType::Delete,
            kv,
            revision,
        });
        true
    }

    /// Remove a lease and every key attached to it under one revision.
    fn drop_lease(&mut self, lease_id: u64) -> Option<u32> {
        let lease = self.leases.remove(&lease_id)?;
        if lease.keys.is_empty() {
            return Some(0);
        }
        let revision = self.next_revision();
        let mut deleted = 0u32;
        for key in &lease.keys {
            if self.data.get(key).is_some_and(|e| e.lease_id == Some(lease_id)) && self.apply_delete(key, revision) {
                deleted += 1;
            }
        }
        Some(deleted)
    }

    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<u64> =
            self.leases.iter().filter(|(_, lease)| lease.deadline <= now).map(|(id, _)| *id).collect();
        for lease_id in expired {
            if let Some(deleted) = self.drop_lease(lease_id) {
                debug!(lease_id, keys_deleted = deleted, "lease expired");
            }
        }
    }

    fn compare_holds(&self, cmp: &TxnCompare) -> bool {
        match cmp {
            TxnCompare::Exists { key } => self.data.contains_key(key),
            TxnCompare::Absent { key } => !self.data.contains_key(key),
            TxnCompare::CreateRevisionEquals { key, revision } => {
                self.data.get(key).is_some_and(|e| e.create_revision == *revision)
            }
        }
    }

    fn apply_txn_ops(&mut self, ops: &[TxnOp]) -> Result<(), KeyValueStoreError> {
        for op in ops {
            if let TxnOp::Put { lease_id, .. } = op {
                self.ensure_lease(*lease_id)?;
            }
        }
        if ops.is_empty() {
            return Ok(());
        }
        let revision = self.next_revision();
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease_id } => self.apply_put(key, value, *lease_id, revision),
                TxnOp::Delete { key } => {
                    self.apply_delete(key, revision);
                }
            }
        }
        Ok(())
    }
}

/// A deterministic in-memory store for testing coordination primitives.
///
/// Behaves like a single linearizable replica group: one global revision
/// counter, leases that delete their keys on expiry, and prefix watches that
/// replay retained history from a start revision. Lease deadlines follow
/// `tokio::time`, so tests using a paused clock expire leases exactly.
///
/// Fault injection:
/// - [`set_unreachable`](Self::set_unreachable): every call fails as a transient error
/// - [`set_cluster_members`](Self::set_cluster_members): quorum loss
/// - [`block_keepalive`](Self::block_keepalive): one lease stops renewing
/// - [`expire_lease`](Self::expire_lease): store-side eviction, as after a long pause
pub struct DeterministicKeyValueStore {
    state: Mutex<StoreState>,
}

impl DeterministicKeyValueStore {
    /// Create a new store wrapped in Arc.
    ///
    /// When called inside a tokio runtime a background task reaps expired
    /// leases even if nobody touches the store. The task stops once the
    /// store is dropped.
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self {
            state: Mutex::new(StoreState::new()),
        });
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(run_reaper(Arc::downgrade(&store)));
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock state, reap expired leases, and apply injected faults.
    fn begin(&self) -> Result<MutexGuard<'_, StoreState>, KeyValueStoreError> {
        let mut state = self.lock();
        state.reap_expired(Instant::now());
        state.faults.check()?;
        Ok(state)
    }

    /// Current global revision.
    pub fn current_revision(&self) -> u64 {
        self.lock().revision
    }

    /// Make every operation fail with `Unavailable` (or undo it).
    pub fn set_unreachable(&self, is_unreachable: bool) {
        self.lock().faults.is_unreachable = is_unreachable;
    }

    /// Set how many voting members exist and how many are reachable.
    ///
    /// Below a majority, operations fail with `QuorumUnavailable`.
    pub fn set_cluster_members(&self, member_count: u32, reachable_members: u32) {
        let mut state = self.lock();
        state.faults.member_count = member_count;
        state.faults.reachable_members = reachable_members.min(member_count);
    }

    /// Reject keep-alives for one lease, as if its owner's renewals stopped arriving.
    pub fn block_keepalive(&self, lease_id: u64) {
        self.lock().faults.blocked_keepalives.insert(lease_id);
    }

    /// Undo [`block_keepalive`](Self::block_keepalive).
    pub fn unblock_keepalive(&self, lease_id: u64) {
        self.lock().faults.blocked_keepalives.remove(&lease_id);
    }

    /// Expire a lease immediately, deleting its keys. Returns false if unknown.
    pub fn expire_lease(&self, lease_id: u64) -> bool {
        let mut state = self.lock();
        let dropped = state.drop_lease(lease_id);
        if let Some(keys_deleted) = dropped {
            debug!(lease_id, keys_deleted, "lease force-expired");
        }
        dropped.is_some()
    }

    /// Whether a lease is still alive.
    pub fn lease_exists(&self, lease_id: u64) -> bool {
        let mut state = self.lock();
        state.reap_expired(Instant::now());
        state.leases.contains_key(&lease_id)
    }

    /// Keys currently stored under a prefix, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut state = self.lock();
        state.reap_expired(Instant::now());
        state.data.range(prefix.to_string()..).take_while(|(k, _)| k.starts_with(prefix)).map(|(k, _)| k.clone()).collect()
    }

    fn reap(&self) {
        self.lock().reap_expired(Instant::now());
    }
}

async fn run_reaper(store: Weak<DeterministicKeyValueStore>) {
    let mut interval = tokio::time::interval(LEASE_REAP_INTERVAL);
    loop {
        interval.tick().await;
        match store.upgrade() {
            Some(store) => store.reap(),
            None => return,
        }
    }
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        let mut state = self.begin()?;

        match request.command {
            WriteCommand::Put { key, value, lease_id } => {
                state.ensure_lease(lease_id)?;
                let revision = state.next_revision();
                state.apply_put(&key, &value, lease_id, revision);
                Ok(WriteResult {
                    header_revision: revision,
                    succeeded: Some(true),
                    ..Default::default()
                })
            }
            WriteCommand::PutIfAbsent { key, value, lease_id } => {
                if let Some(existing) = state.data.get(&key) {
                    return Ok(WriteResult {
                        header_revision: state.revision,
                        succeeded: Some(false),
                        existing: Some(existing.to_kv(&key)),
                        ..Default::default()
                    });
                }
                state.ensure_lease(lease_id)?;
                let revision = state.next_revision();
                state.apply_put(&key, &value, lease_id, revision);
                Ok(WriteResult {
                    header_revision: revision,
                    succeeded: Some(true),
                    ..Default::default()
                })
            }
            WriteCommand::CreateSequential { prefix, value, lease_id } => {
                state.ensure_lease(lease_id)?;
                let revision = state.next_revision();
                let key = sequential_key(&prefix, revision);
                state.apply_put(&key, &value, lease_id, revision);
                Ok(WriteResult {
                    header_revision: revision,
                    succeeded: Some(true),
                    created_key: Some(key),
                    ..Default::default()
                })
            }
            WriteCommand::Transaction {
                compare,
                success,
                failure,
            } => {
                let is_met = compare.iter().all(|cmp| state.compare_holds(cmp));
                let branch = if is_met { &success } else { &failure };
                state.apply_txn_ops(branch)?;
                Ok(WriteResult {
                    header_revision: state.revision,
                    succeeded: Some(is_met),
                    ..Default::default()
                })
            }
            WriteCommand::LeaseGrant { ttl_ms } => {
                if ttl_ms == 0 {
                    return Err(KeyValueStoreError::InvalidRequest {
                        reason: "lease TTL must be positive".to_string(),
                    });
                }
                let lease_id = state.next_lease_id;
                state.next_lease_id += 1;
                state.leases.insert(lease_id, LeaseState {
                    ttl_ms,
                    deadline: Instant::now() + Duration::from_millis(ttl_ms),
                    keys: BTreeSet::new(),
                });
                Ok(WriteResult {
                    header_revision: state.revision,
                    lease_id: Some(lease_id),
                    ttl_ms: Some(ttl_ms),
                    ..Default::default()
                })
            }
            WriteCommand::LeaseRevoke { lease_id } => {
                let keys_deleted = state.drop_lease(lease_id).ok_or(KeyValueStoreError::LeaseNotFound { lease_id })?;
                Ok(WriteResult {
                    header_revision: state.revision,
                    lease_id: Some(lease_id),
                    keys_deleted: Some(keys_deleted),
                    ..Default::default()
                })
            }
            WriteCommand::LeaseKeepalive { lease_id } => {
                if state.faults.blocked_keepalives.contains(&lease_id) {
                    return Err(KeyValueStoreError::Unavailable {
                        reason: format!("keepalive for lease {lease_id} blocked"),
                    });
                }
                let header_revision = state.revision;
                let lease = state.leases.get_mut(&lease_id).ok_or(KeyValueStoreError::LeaseNotFound { lease_id })?;
                lease.deadline = Instant::now() + Duration::from_millis(lease.ttl_ms);
                Ok(WriteResult {
                    header_revision,
                    lease_id: Some(lease_id),
                    ttl_ms: Some(lease.ttl_ms),
                    ..Default::default()
                })
            }
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        let state = self.begin()?;
        Ok(ReadResult {
            kv: state.data.get(&request.key).map(|e| e.to_kv(&request.key)),
            header_revision: state.revision,
        })
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        let mut state = self.begin()?;
        let is_deleted = if state.data.contains_key(&request.key) {
            let revision = state.next_revision();
            state.apply_delete(&request.key, revision)
        } else {
            false
        };
        Ok(DeleteResult {
            key: request.key,
            is_deleted,
            header_revision: state.revision,
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        let state = self.begin()?;
        let limit = request.limit.map(|l| l as usize).unwrap_or(MAX_SCAN_RESULTS).min(MAX_SCAN_RESULTS);
        let mut matching = state
            .data
            .range(request.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&request.prefix))
            .map(|(k, e)| e.to_kv(k));
        let kvs: Vec<KeyValueWithRevision> = matching.by_ref().take(limit).collect();
        let is_truncated = matching.next().is_some();
        Ok(ScanResult {
            kvs,
            header_revision: state.revision,
            is_truncated,
        })
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        let mut state = self.begin()?;
        let start = request.start_revision.unwrap_or(state.revision + 1);
        if state.compacted_revision > 0 && start <= state.compacted_revision {
            return Err(KeyValueStoreError::Compacted {
                requested: start,
                compacted: state.compacted_revision,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for event in state.history.iter() {
            if event.revision >= start && event.kv.key.starts_with(&request.prefix) {
                // Receiver is alive: we hold it.
                let _ = tx.send(event.clone());
            }
        }
        state.watchers.push(Watcher {
            prefix: request.prefix,
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}

#[async_trait]
impl ClusterProbe for DeterministicKeyValueStore {
    async fn cluster_status(&self) -> Result<ClusterStatus, KeyValueStoreError> {
        let state = self.lock();
        if state.faults.is_unreachable {
            return Err(KeyValueStoreError::Unavailable {
                reason: "store unreachable (injected partition)".to_string(),
            });
        }
        let members = (1..=u64::from(state.faults.member_count))
            .map(|node_id| MemberStatus {
                node_id,
                is_reachable: node_id <= u64::from(state.faults.reachable_members),
            })
            .collect();
        let has_quorum = state.faults.reachable_members >= state.faults.quorum();
        Ok(ClusterStatus {
            members,
            leader: has_quorum.then_some(1),
            revision: state.revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_reports_existing() {
        let store = DeterministicKeyValueStore::new();
        let first = store.write(WriteRequest::put_if_absent("/a", "1", None)).await.unwrap();
        assert_eq!(first.succeeded, Some(true));
        let second = store.write(WriteRequest::put_if_absent("/a", "2", None)).await.unwrap();
        assert_eq!(second.succeeded, Some(false));
        let existing = second.existing.unwrap();
        assert_eq!(existing.value, "1");
        assert_eq!(existing.create_revision, first.header_revision);
    }

    #[tokio::test]
    async fn sequential_keys_embed_revision() {
        let store = DeterministicKeyValueStore::new();
        let a = store.write(WriteRequest::create_sequential("/q/", "a", None)).await.unwrap();
        let b = store.write(WriteRequest::create_sequential("/q/", "b", None)).await.unwrap();
        assert!(a.created_key.unwrap() < b.created_key.unwrap());
        let scan = store.scan(ScanRequest::prefix("/q/")).await.unwrap();
        assert_eq!(scan.kvs.len(), 2);
        assert_eq!(scan.kvs[0].value, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_deletes_keys_and_notifies_watchers() {
        let store = DeterministicKeyValueStore::new();
        let grant = store.write(WriteRequest::lease_grant(100)).await.unwrap();
        let lease_id = grant.lease_id.unwrap();
        store.write(WriteRequest::put_if_absent("/k", "v", Some(lease_id))).await.unwrap();

        let mut watch = store.watch(WatchRequest::prefix("/k")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let event = watch.next_event().await.unwrap();
        assert!(event.is_delete());
        assert_eq!(event.key(), "/k");
        assert!(!store.lease_exists(lease_id));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_extends_lease() {
        let store = DeterministicKeyValueStore::new();
        let lease_id = store.write(WriteRequest::lease_grant(100)).await.unwrap().lease_id.unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            store.write(WriteRequest::lease_keepalive(lease_id)).await.unwrap();
        }
        assert!(store.lease_exists(lease_id));
    }

    #[tokio::test]
    async fn watch_replays_from_start_revision() {
        let store = DeterministicKeyValueStore::new();
        let r1 = store.write(WriteRequest::put_if_absent("/w/a", "1", None)).await.unwrap().header_revision;
        store.delete(DeleteRequest::new("/w/a")).await.unwrap();

        let mut watch = store.watch(WatchRequest::from_revision("/w/", r1)).await.unwrap();
        let put = watch.next_event().await.unwrap();
        assert_eq!(put.event_type, WatchEventType::Put);
        let del = watch.next_event().await.unwrap();
        assert!(del.is_delete());
        assert!(del.revision > put.revision);
    }

    #[tokio::test]
    async fn transaction_guards_on_create_revision() {
        let store = DeterministicKeyValueStore::new();
        let rev = store.write(WriteRequest::put_if_absent("/owner", "me", None)).await.unwrap().header_revision;
        let ok = store
            .write(WriteRequest::from_command(WriteCommand::Transaction {
                compare: vec![TxnCompare::CreateRevisionEquals {
                    key: "/owner".into(),
                    revision: rev,
                }],
                success: vec![TxnOp::Put {
                    key: "/fence".into(),
                    value: "x".into(),
                    lease_id: None,
                }],
                failure: vec![],
            }))
            .await
            .unwrap();
        assert_eq!(ok.succeeded, Some(true));
        assert!(ok.header_revision > rev);

        let stale = store
            .write(WriteRequest::from_command(WriteCommand::Transaction {
                compare: vec![TxnCompare::CreateRevisionEquals {
                    key: "/owner".into(),
                    revision: rev + 100,
                }],
                success: vec![TxnOp::Delete { key: "/owner".into() }],
                failure: vec![],
            }))
            .await
            .unwrap();
        assert_eq!(stale.succeeded, Some(false));
        assert_eq!(store.keys_with_prefix("/owner"), vec!["/owner".to_string()]);
    }

    #[tokio::test]
    async fn quorum_loss_fails_operations() {
        let store = DeterministicKeyValueStore::new();
        store.set_cluster_members(3, 1);
        let err = store.read(ReadRequest::new("/x")).await.unwrap_err();
        assert!(err.is_quorum_loss());
        let status = store.cluster_status().await.unwrap();
        assert_eq!(status.reachable_count(), 1);
        assert_eq!(status.leader, None);
    }

    #[tokio::test]
    async fn unreachable_is_transient() {
        let store = DeterministicKeyValueStore::new();
        store.set_unreachable(true);
        let err = store.write(WriteRequest::lease_grant(1000)).await.unwrap_err();
        assert!(err.is_transient());
        store.set_unreachable(false);
        assert!(store.write(WriteRequest::lease_grant(1000)).await.is_ok());
    }
}
