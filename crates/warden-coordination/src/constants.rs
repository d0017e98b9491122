//! Fixed limits and key layout for coordination primitives.
//!
//! Every loop and collection in this crate is bounded by one of these.

/// Namespace holding one leader record per election path.
pub const ELECTION_PREFIX: &str = "/election/";

/// Namespace holding campaign queues, one sub-prefix per election path.
///
/// Only the head of a queue may contend for the leader record, so leadership
/// passes in campaign order.
pub const CANDIDATE_PREFIX: &str = "/election-candidates/";

/// Namespace holding lock waiter queues, one sub-prefix per resource.
pub const LOCK_PREFIX: &str = "/locks/";

/// Namespace holding the most recent fencing issuance per scope.
pub const FENCING_PREFIX: &str = "/fencing/";

/// Namespace for health monitor probe writes.
pub const HEALTH_PROBE_PREFIX: &str = "/health/probe/";

/// Maximum length of an election path or lock resource key.
pub const MAX_NAME_LEN: usize = 512;

/// Maximum length of a candidate or holder identifier.
pub const MAX_CANDIDATE_ID_LEN: usize = 256;

/// Maximum entries inspected when evaluating a lock or candidate queue.
pub const MAX_QUEUE_ENTRIES: u32 = 10_000;

/// Default session lease TTL.
pub const DEFAULT_SESSION_TTL_MS: u64 = 10_000;

/// Default per-call keep-alive timeout.
pub const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = 1_000;

/// Default timeout for the best-effort revoke issued on close.
pub const DEFAULT_REVOKE_TIMEOUT_MS: u64 = 1_000;

/// Bounds for renewal retry backoff after a failed keep-alive.
pub const DEFAULT_RENEW_INITIAL_BACKOFF_MS: u64 = 50;
pub const DEFAULT_RENEW_MAX_BACKOFF_MS: u64 = 1_000;

/// Bounds for randomized re-contention backoff after a leader record disappears.
pub const DEFAULT_CAMPAIGN_MIN_BACKOFF_MS: u64 = 10;
pub const DEFAULT_CAMPAIGN_MAX_BACKOFF_MS: u64 = 250;

/// Transient store errors are retried at most this many times per call.
pub const MAX_TRANSIENT_RETRIES: u32 = 5;
pub const TRANSIENT_RETRY_INITIAL_BACKOFF_MS: u64 = 20;
pub const TRANSIENT_RETRY_MAX_BACKOFF_MS: u64 = 1_000;

/// Delay before reopening a holder-monitor watch that closed or failed.
pub const WATCH_REOPEN_BACKOFF_MS: u64 = 50;

/// Default health poll cadence and per-poll timeout.
pub const DEFAULT_HEALTH_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_HEALTH_PROBE_TIMEOUT_MS: u64 = 500;

/// Maximum entries held by a last-known-good read cache.
pub const MAX_CACHED_READS: usize = 1_024;
