//! Key-value request and result types.
//!
//! Every mutation is assigned a revision from the store's single global
//! counter. Entries remember the revision that created them
//! (`create_revision`) and the one that last changed them (`mod_revision`).

use serde::Deserialize;
use serde::Serialize;

/// Width of the zero-padded revision suffix on sequential keys.
///
/// 20 digits hold `u64::MAX`, so lexicographic order equals numeric order.
pub const SEQUENTIAL_KEY_WIDTH: usize = 20;

/// A stored entry together with its revision metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValueWithRevision {
    pub key: String,
    pub value: String,
    /// Revision at which this key was created.
    pub create_revision: u64,
    /// Revision of the last modification.
    pub mod_revision: u64,
    /// Number of modifications since creation (1 on create).
    pub version: u64,
    /// Lease the key is attached to, if any.
    pub lease_id: Option<u64>,
}

/// Request to read a single key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: String,
}

impl ReadRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Response from a read. `header_revision` is the store revision at read time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResult {
    pub kv: Option<KeyValueWithRevision>,
    pub header_revision: u64,
}

/// Request to list every key under a prefix, ordered by key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRequest {
    pub prefix: String,
    /// Maximum entries to return (`None` = implementation maximum).
    pub limit: Option<u32>,
}

impl ScanRequest {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            limit: None,
        }
    }
}

/// Result of a prefix scan. Entries are sorted lexicographically by key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    pub kvs: Vec<KeyValueWithRevision>,
    pub header_revision: u64,
    pub is_truncated: bool,
}

/// Request to delete a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: String,
}

impl DeleteRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Result of a delete. Deleting an absent key succeeds with `is_deleted = false`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub key: String,
    pub is_deleted: bool,
    pub header_revision: u64,
}

/// Condition evaluated atomically before a transaction applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxnCompare {
    /// Key must exist.
    Exists { key: String },
    /// Key must not exist.
    Absent { key: String },
    /// Key must exist and have been created at exactly this revision.
    CreateRevisionEquals { key: String, revision: u64 },
}

/// Operation applied by a transaction branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: String,
        lease_id: Option<u64>,
    },
    Delete {
        key: String,
    },
}

/// Commands that modify store state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    /// Unconditional put.
    Put {
        key: String,
        value: String,
        lease_id: Option<u64>,
    },
    /// Insert only if the key is absent. On failure `existing` holds the current entry.
    PutIfAbsent {
        key: String,
        value: String,
        lease_id: Option<u64>,
    },
    /// Create `{prefix}{revision}` where revision is the one assigned to this write.
    CreateSequential {
        prefix: String,
        value: String,
        lease_id: Option<u64>,
    },
    /// If/Then/Else over the current state.
    Transaction {
        compare: Vec<TxnCompare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    },
    /// Grant a new lease.
    LeaseGrant { ttl_ms: u64 },
    /// Revoke a lease and delete every key attached to it.
    LeaseRevoke { lease_id: u64 },
    /// Reset a lease's deadline to now + TTL.
    LeaseKeepalive { lease_id: u64 },
}

/// Request to perform a write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: WriteCommand,
}

impl WriteRequest {
    pub fn from_command(command: WriteCommand) -> Self {
        Self { command }
    }

    pub fn put_if_absent(key: impl Into<String>, value: impl Into<String>, lease_id: Option<u64>) -> Self {
        Self {
            command: WriteCommand::PutIfAbsent {
                key: key.into(),
                value: value.into(),
                lease_id,
            },
        }
    }

    pub fn create_sequential(prefix: impl Into<String>, value: impl Into<String>, lease_id: Option<u64>) -> Self {
        Self {
            command: WriteCommand::CreateSequential {
                prefix: prefix.into(),
                value: value.into(),
                lease_id,
            },
        }
    }

    pub fn lease_grant(ttl_ms: u64) -> Self {
        Self {
            command: WriteCommand::LeaseGrant { ttl_ms },
        }
    }

    pub fn lease_revoke(lease_id: u64) -> Self {
        Self {
            command: WriteCommand::LeaseRevoke { lease_id },
        }
    }

    pub fn lease_keepalive(lease_id: u64) -> Self {
        Self {
            command: WriteCommand::LeaseKeepalive { lease_id },
        }
    }
}

/// Result of a write. Fields are populated depending on the command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WriteResult {
    /// Store revision after the command was applied.
    pub header_revision: u64,
    /// Conditional commands: whether the condition held.
    pub succeeded: Option<bool>,
    /// `PutIfAbsent` failures: the entry that was already present.
    pub existing: Option<KeyValueWithRevision>,
    /// `CreateSequential`: the generated key.
    pub created_key: Option<String>,
    /// Lease commands: the lease involved.
    pub lease_id: Option<u64>,
    /// Lease grant/keepalive: TTL now in force.
    pub ttl_ms: Option<u64>,
    /// Lease revoke: keys deleted along with the lease.
    pub keys_deleted: Option<u32>,
}

/// Build the key `CreateSequential` generates for `prefix` at `revision`.
pub fn sequential_key(prefix: &str, revision: u64) -> String {
    format!("{prefix}{revision:0width$}", width = SEQUENTIAL_KEY_WIDTH)
}

/// Extract the revision suffix from a sequential key.
pub fn parse_sequential_revision(prefix: &str, key: &str) -> Option<u64> {
    let suffix = key.strip_prefix(prefix)?;
    if suffix.len() != SEQUENTIAL_KEY_WIDTH {
        return None;
    }
    suffix.parse().ok()
}
