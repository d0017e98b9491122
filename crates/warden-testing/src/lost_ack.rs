//! Store wrapper whose writes commit but whose replies can go missing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tracing::debug;
use warden_core::ClusterProbe;
use warden_core::ClusterStatus;
use warden_core::DeleteRequest;
use warden_core::DeleteResult;
use warden_core::KeyValueStore;
use warden_core::KeyValueStoreError;
use warden_core::ReadRequest;
use warden_core::ReadResult;
use warden_core::ScanRequest;
use warden_core::ScanResult;
use warden_core::WatchRequest;
use warden_core::WatchStream;
use warden_core::WriteCommand;
use warden_core::WriteRequest;
use warden_core::WriteResult;

/// Reported duration of a write whose reply was dropped.
const LOST_ACK_TIMEOUT_MS: u64 = 1_000;

/// Write command families a [`LostAckStore`] can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Put,
    PutIfAbsent,
    CreateSequential,
    Transaction,
    Lease,
}

impl WriteKind {
    pub fn of(command: &WriteCommand) -> Self {
        match command {
            WriteCommand::Put { .. } => WriteKind::Put,
            WriteCommand::PutIfAbsent { .. } => WriteKind::PutIfAbsent,
            WriteCommand::CreateSequential { .. } => WriteKind::CreateSequential,
            WriteCommand::Transaction { .. } => WriteKind::Transaction,
            WriteCommand::LeaseGrant { .. } | WriteCommand::LeaseRevoke { .. } | WriteCommand::LeaseKeepalive { .. } => {
                WriteKind::Lease
            }
        }
    }
}

/// Applies every write to the inner store, then reports selected ones as
/// timed out.
///
/// This is the failure a client sees when the leader commits a proposal and
/// the connection drops before the reply arrives: the write happened, but
/// the caller only knows it might have. Retrying such a write must not
/// leave a second copy behind.
///
/// ```ignore
/// let store = LostAckStore::new(DeterministicKeyValueStore::new());
/// store.lose_next(WriteKind::CreateSequential, 1);
/// // The next sequential create commits and returns `Timeout`.
/// ```
pub struct LostAckStore<S: ?Sized> {
    inner: Arc<S>,
    pending: Mutex<HashMap<WriteKind, u32>>,
    lost: AtomicU32,
}

impl<S: KeyValueStore + ?Sized> LostAckStore<S> {
    pub fn new(inner: Arc<S>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            pending: Mutex::new(HashMap::new()),
            lost: AtomicU32::new(0),
        })
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Drop the replies of the next `count` writes of `kind`.
    pub fn lose_next(&self, kind: WriteKind, count: u32) {
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *pending.entry(kind).or_insert(0) += count;
    }

    /// Number of replies dropped so far.
    pub fn lost_acks(&self) -> u32 {
        self.lost.load(Ordering::SeqCst)
    }

    fn take(&self, kind: WriteKind) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match pending.get_mut(&kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for LostAckStore<S> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        let kind = WriteKind::of(&request.command);
        let result = self.inner.write(request).await?;
        if self.take(kind) {
            self.lost.fetch_add(1, Ordering::SeqCst);
            debug!(?kind, header_revision = result.header_revision, "write committed, reply dropped");
            return Err(KeyValueStoreError::Timeout {
                duration_ms: LOST_ACK_TIMEOUT_MS,
            });
        }
        Ok(result)
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        self.inner.read(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        self.inner.delete(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        self.inner.scan(request).await
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        self.inner.watch(request).await
    }
}

#[async_trait]
impl<S: KeyValueStore + ClusterProbe + ?Sized> ClusterProbe for LostAckStore<S> {
    async fn cluster_status(&self) -> Result<ClusterStatus, KeyValueStoreError> {
        self.inner.cluster_status().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeterministicKeyValueStore;

    #[tokio::test]
    async fn dropped_reply_still_commits() {
        let store = LostAckStore::new(DeterministicKeyValueStore::new());
        store.lose_next(WriteKind::CreateSequential, 1);

        let err = store.write(WriteRequest::create_sequential("/q/", "a", None)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.inner().keys_with_prefix("/q/").len(), 1);
        assert_eq!(store.lost_acks(), 1);

        store.write(WriteRequest::create_sequential("/q/", "b", None)).await.unwrap();
        assert_eq!(store.inner().keys_with_prefix("/q/").len(), 2);
        assert_eq!(store.lost_acks(), 1);
    }

    #[tokio::test]
    async fn other_kinds_pass_through() {
        let store = LostAckStore::new(DeterministicKeyValueStore::new());
        store.lose_next(WriteKind::Transaction, 1);
        store.write(WriteRequest::put_if_absent("/k", "v", None)).await.unwrap();
        assert_eq!(store.lost_acks(), 0);
    }
}
