//! Error types for coordination primitives.

use snafu::Snafu;
use warden_core::KeyValueStoreError;

use crate::types::SessionId;

/// Errors from coordination primitives.
///
/// Every variant that means "you no longer own what you thought you owned"
/// is distinct so callers can stop side effects without string matching.
/// See [`CoordinationError::is_ownership_loss`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// The session's lease has expired, locally or in the store.
    #[snafu(display("session {session_id} expired"))]
    SessionExpired {
        /// The expired session.
        session_id: SessionId,
    },

    /// The session was closed by its owner.
    #[snafu(display("session {session_id} closed"))]
    SessionClosed {
        /// The closed session.
        session_id: SessionId,
    },

    /// The key is already held by another session.
    #[snafu(display("'{key}' is held by '{holder}'"))]
    Conflict {
        /// The contended key.
        key: String,
        /// Identifier of the current holder.
        holder: String,
    },

    /// The ownership record vanished or was replaced before the operation completed.
    #[snafu(display("ownership of '{key}' lost"))]
    OwnershipLost {
        /// The record that is no longer ours.
        key: String,
    },

    /// The store cannot serve linearizable operations.
    #[snafu(display("quorum unavailable during {operation}: {reachable} reachable, {required} required"))]
    QuorumUnavailable {
        /// Description of the operation.
        operation: String,
        /// Members currently reachable.
        reachable: u32,
        /// Members required for a majority.
        required: u32,
    },

    /// A resource rejected a fencing token.
    #[snafu(display("fencing rejected: {source}"))]
    FencingRejected {
        /// The validator's verdict.
        source: FenceError,
    },

    /// Operation exceeded its configured timeout.
    #[snafu(display("operation timed out: {operation}"))]
    Timeout {
        /// Description of the operation.
        operation: String,
    },

    /// Operation was cancelled by the caller.
    #[snafu(display("operation cancelled: {operation}"))]
    Cancelled {
        /// Description of the operation.
        operation: String,
    },

    /// Transient failures persisted past the retry budget.
    #[snafu(display("max retries exceeded for {operation}: {attempts} attempts, last error: {source}"))]
    MaxRetriesExceeded {
        /// Description of the operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The last transient error observed.
        source: KeyValueStoreError,
    },

    /// Caller supplied an unusable argument.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: String,
    },

    /// Data in storage is corrupted or unparseable.
    #[snafu(display("corrupted data in key '{key}': {reason}"))]
    CorruptedData {
        /// The key with corrupted data.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// Underlying storage error.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying error.
        source: KeyValueStoreError,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },
}

impl CoordinationError {
    /// Returns true if the caller must treat any held lock or leadership as gone.
    pub fn is_ownership_loss(&self) -> bool {
        matches!(
            self,
            CoordinationError::SessionExpired { .. }
                | CoordinationError::SessionClosed { .. }
                | CoordinationError::OwnershipLost { .. }
                | CoordinationError::FencingRejected { .. }
        )
    }

    /// Returns true if the error came from quorum loss and cached reads may help.
    pub fn is_quorum_loss(&self) -> bool {
        match self {
            CoordinationError::QuorumUnavailable { .. } => true,
            CoordinationError::Storage { source } => source.is_quorum_loss(),
            _ => false,
        }
    }

    /// Map a store error into the coordination taxonomy for `operation`.
    pub(crate) fn from_store(operation: &str, source: KeyValueStoreError) -> Self {
        match source {
            KeyValueStoreError::QuorumUnavailable { reachable, required } => CoordinationError::QuorumUnavailable {
                operation: operation.to_string(),
                reachable,
                required,
            },
            source => CoordinationError::Storage { source },
        }
    }
}

impl From<KeyValueStoreError> for CoordinationError {
    fn from(source: KeyValueStoreError) -> Self {
        CoordinationError::Storage { source }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(source: serde_json::Error) -> Self {
        CoordinationError::Serialization { source }
    }
}

impl From<FenceError> for CoordinationError {
    fn from(source: FenceError) -> Self {
        CoordinationError::FencingRejected { source }
    }
}

/// Error when a fencing token is rejected.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum FenceError {
    /// The presented token is not newer than the last one accepted for its scope.
    #[snafu(display("stale fencing token for '{scope}': presented {presented}, last accepted {last_accepted}"))]
    StaleToken {
        /// Scope the token was presented for.
        scope: String,
        /// The token that was presented.
        presented: u64,
        /// The highest token accepted so far.
        last_accepted: u64,
    },

    /// The token was issued for a different scope.
    #[snafu(display("fencing token for '{token_scope}' presented to '{scope}'"))]
    ScopeMismatch {
        /// Scope the validator guards.
        scope: String,
        /// Scope written in the token.
        token_scope: String,
    },
}

/// Errors loading or validating [`crate::CoordinationConfig`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Config file could not be read.
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile {
        /// Path that was read.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema.
    #[snafu(display("failed to parse config: {source}"))]
    Parse {
        /// The underlying TOML error.
        source: toml::de::Error,
    },

    /// An environment override could not be parsed.
    #[snafu(display("invalid value '{value}' for {variable}"))]
    InvalidEnv {
        /// Environment variable name.
        variable: String,
        /// The raw value.
        value: String,
    },

    /// A field violates a cross-field or range constraint.
    #[snafu(display("invalid config field {field}: {reason}"))]
    Validation {
        /// Dotted field path.
        field: String,
        /// The violated constraint.
        reason: String,
    },
}
