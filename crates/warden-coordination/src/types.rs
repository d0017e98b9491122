//! Shared types for coordination primitives.

use serde::Deserialize;
use serde::Serialize;

/// Identity of a session: the store lease it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a store lease ID.
    pub fn new(lease_id: u64) -> Self {
        Self(lease_id)
    }

    /// The lease ID this session renews.
    pub fn lease_id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Fencing token handed to a new lock holder or leader.
///
/// `value` is the store revision of the write that issued it, so tokens for a
/// scope strictly increase across holders, sessions, and process restarts.
/// Pass the token with every mutation of a guarded resource and let the
/// resource reject anything not newer than what it last accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FencingToken {
    /// Monotonic token value.
    pub value: u64,
    /// Resource or election the token fences.
    pub scope: String,
    /// Session that held ownership when the token was issued.
    pub session_id: SessionId,
}

impl FencingToken {
    /// Get the raw token value.
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FencingToken({}@{})", self.value, self.scope)
    }
}

/// Candidate entry serialized into an election record and its queue ticket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct CandidateEntry {
    pub candidate_id: String,
    pub session_id: SessionId,
    pub campaigned_at_ms: u64,
    /// Random per campaign; tells this campaign's writes apart from any other
    /// handle on the same session.
    pub attempt_id: u64,
}

/// Waiter entry serialized into a lock queue record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct WaiterEntry {
    pub holder_id: String,
    pub session_id: SessionId,
    pub enqueued_at_ms: u64,
    /// Random per acquire.
    pub attempt_id: u64,
}

/// Record of the most recent token issued for a scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct FenceRecord {
    pub session_id: SessionId,
    pub holder_key: String,
    pub issued_at_ms: u64,
}

/// Current leader of an election path as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionRecord {
    /// Election the record belongs to.
    pub election_path: String,
    /// Caller-chosen identifier of the leader.
    pub candidate_id: String,
    /// Session that owns the record.
    pub session_id: SessionId,
    /// Revision at which the record was created.
    pub insertion_revision: u64,
}

/// One entry of a lock's waiter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Resource the entry queues for.
    pub resource_key: String,
    /// Caller-chosen identifier of the waiter.
    pub holder_id: String,
    /// Session that owns the entry.
    pub holder_session_id: SessionId,
    /// Revision at which the entry was enqueued.
    pub acquisition_revision: u64,
    /// Zero-based position; 0 is the holder.
    pub queue_position: u32,
}

/// Whether the caller may act on an ownership claim right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipStatus {
    /// Held, and the session and cluster look healthy.
    Held,
    /// Locally still held, but renewal is failing or quorum is degraded.
    ///
    /// Holders should finish in-flight work and refuse to start new side effects.
    Unverifiable,
    /// Not held.
    NotHeld,
}

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).map(saturating_millis).unwrap_or(0)
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[inline]
pub(crate) fn saturating_millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
