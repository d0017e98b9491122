//! Error types returned by store implementations.

use snafu::Snafu;

/// Errors from [`crate::KeyValueStore`] and [`crate::ClusterProbe`] operations.
///
/// Variants are split along the lines the coordination layer cares about:
/// transient failures are retried, quorum loss drives degraded mode, and
/// lease absence is proof that the owning session is gone.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum KeyValueStoreError {
    /// Key does not exist.
    #[snafu(display("key '{key}' not found"))]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The lease is unknown to the store (never granted, revoked, or expired).
    #[snafu(display("lease {lease_id} not found"))]
    LeaseNotFound {
        /// The lease that was referenced.
        lease_id: u64,
    },

    /// Store could not be reached (network failure, connection reset).
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },

    /// The store is reachable but cannot serve linearizable operations.
    #[snafu(display("quorum unavailable: {reachable} of {required} required members reachable"))]
    QuorumUnavailable {
        /// Members currently reachable.
        reachable: u32,
        /// Members required for a majority.
        required: u32,
    },

    /// Operation exceeded its deadline.
    #[snafu(display("operation timed out after {duration_ms}ms"))]
    Timeout {
        /// How long the operation waited.
        duration_ms: u64,
    },

    /// Watch start revision has been compacted away.
    #[snafu(display("revision {requested} compacted (oldest retained {compacted})"))]
    Compacted {
        /// The start revision requested by the watcher.
        requested: u64,
        /// Oldest revision still in history.
        compacted: u64,
    },

    /// Request was malformed.
    #[snafu(display("invalid request: {reason}"))]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// Any other failure.
    #[snafu(display("operation failed: {reason}"))]
    Failed {
        /// Description of the failure.
        reason: String,
    },
}

impl KeyValueStoreError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeyValueStoreError::Unavailable { .. } | KeyValueStoreError::Timeout { .. })
    }

    /// Returns true if the store reported loss of quorum.
    pub fn is_quorum_loss(&self) -> bool {
        matches!(self, KeyValueStoreError::QuorumUnavailable { .. })
    }
}
