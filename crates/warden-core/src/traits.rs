//! Traits implemented by store clients.

use async_trait::async_trait;

use crate::cluster::ClusterStatus;
use crate::error::KeyValueStoreError;
use crate::kv::DeleteRequest;
use crate::kv::DeleteResult;
use crate::kv::ReadRequest;
use crate::kv::ReadResult;
use crate::kv::ScanRequest;
use crate::kv::ScanResult;
use crate::kv::WriteRequest;
use crate::kv::WriteResult;
use crate::watch::WatchRequest;
use crate::watch::WatchStream;

/// Linearizable key-value store with leases and watches.
///
/// Implementations must assign every mutation (including lease-driven
/// deletions) a revision from one globally monotonic counter, and deliver
/// watch events in that order.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Apply a write command.
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError>;

    /// Read a single key.
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError>;

    /// Delete a single key.
    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError>;

    /// List keys under a prefix in key order.
    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError>;

    /// Stream changes under a prefix.
    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        (**self).read(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        (**self).delete(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        (**self).scan(request).await
    }

    async fn watch(&self, request: WatchRequest) -> Result<WatchStream, KeyValueStoreError> {
        (**self).watch(request).await
    }
}

/// Source of store membership and reachability.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Report which voting members are reachable.
    async fn cluster_status(&self) -> Result<ClusterStatus, KeyValueStoreError>;
}

#[async_trait]
impl<T: ClusterProbe + ?Sized> ClusterProbe for std::sync::Arc<T> {
    async fn cluster_status(&self) -> Result<ClusterStatus, KeyValueStoreError> {
        (**self).cluster_status().await
    }
}
