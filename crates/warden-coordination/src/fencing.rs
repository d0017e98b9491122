//! Fencing token issuance and validation.
//!
//! Tokens come from the store, never from local memory. Issuing a token is
//! a transaction that writes `/fencing/{scope}` only while the caller's
//! election or lock record still exists with its original create revision;
//! the revision assigned to that write is the token. Because the store has
//! one global revision counter, tokens for a scope strictly increase across
//! holders, sessions, and restarts of either side.
//!
//! The validator lives next to the guarded resource and rejects any token
//! that is not strictly newer than the last one it accepted for the scope.
//! A paused holder that resumes after losing its lock is turned away even
//! though it still believes it is the owner.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use snafu::ResultExt;
use tracing::debug;
use tracing::warn;
use warden_core::KeyValueStore;
use warden_core::TxnCompare;
use warden_core::TxnOp;
use warden_core::WriteCommand;
use warden_core::WriteRequest;

use crate::config::RetryConfig;
use crate::constants::FENCING_PREFIX;
use crate::error::CoordinationError;
use crate::error::FenceError;
use crate::error::FencingRejectedSnafu;
use crate::error::OwnershipLostSnafu;
use crate::retry::with_retry;
use crate::types::FenceRecord;
use crate::types::FencingToken;
use crate::types::SessionId;
use crate::types::now_unix_ms;
use crate::verified::should_accept_token;

/// Proof of ownership presented when issuing a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderProof {
    /// Key of the election record or lock waiter entry.
    pub key: String,
    /// Create revision of that record when ownership was won.
    pub create_revision: u64,
}

/// Issues fencing tokens through guarded store writes.
pub struct FencingIssuer<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    retry: RetryConfig,
}

impl<S: KeyValueStore + ?Sized + 'static> Clone for FencingIssuer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<S: KeyValueStore + ?Sized + 'static> FencingIssuer<S> {
    pub fn new(store: Arc<S>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Issue a token for `scope` to `session_id`.
    ///
    /// Fails with `OwnershipLost` if the record in `proof` is gone or was
    /// recreated, so a token is never handed to someone who is no longer the
    /// owner at the moment of issuance.
    pub async fn issue_token(
        &self,
        scope: &str,
        session_id: SessionId,
        proof: &HolderProof,
    ) -> Result<FencingToken, CoordinationError> {
        let fence_key = fencing_key(scope);
        let value = serde_json::to_string(&FenceRecord {
            session_id,
            holder_key: proof.key.clone(),
            issued_at_ms: now_unix_ms(),
        })?;

        let request = || {
            self.store.write(WriteRequest::from_command(WriteCommand::Transaction {
                compare: vec![TxnCompare::CreateRevisionEquals {
                    key: proof.key.clone(),
                    revision: proof.create_revision,
                }],
                success: vec![TxnOp::Put {
                    key: fence_key.clone(),
                    value: value.clone(),
                    lease_id: None,
                }],
                failure: vec![],
            }))
        };
        let result = with_retry("issue fencing token", &self.retry, request).await?;

        if result.succeeded != Some(true) {
            warn!(scope, session_id = %session_id, key = %proof.key, "fencing token refused: ownership record gone");
            return OwnershipLostSnafu { key: proof.key.clone() }.fail();
        }

        debug!(scope, session_id = %session_id, fencing_token = result.header_revision, "issued fencing token");
        Ok(FencingToken {
            value: result.header_revision,
            scope: scope.to_string(),
            session_id,
        })
    }
}

/// Store key holding the latest issuance for `scope`.
pub fn fencing_key(scope: &str) -> String {
    format!("{FENCING_PREFIX}{scope}")
}

/// Resource-side gate that accepts only strictly increasing tokens per scope.
///
/// Shared freely between tasks; check-and-update is atomic per validator.
#[derive(Debug, Default)]
pub struct FencingValidator {
    last_accepted: Mutex<HashMap<String, u64>>,
}

impl FencingValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` for `scope` if it is newer than anything accepted so far.
    pub fn validate_and_accept(&self, scope: &str, token: u64) -> bool {
        self.check_value(scope, token).is_ok()
    }

    /// Accept a token for the scope it was issued for.
    pub fn accept(&self, token: &FencingToken) -> bool {
        self.validate_and_accept(&token.scope, token.value)
    }

    /// Like [`accept`](Self::accept), but checks the token belongs to `scope`
    /// and explains a rejection.
    pub fn check(&self, scope: &str, token: &FencingToken) -> Result<(), FenceError> {
        if token.scope != scope {
            return Err(FenceError::ScopeMismatch {
                scope: scope.to_string(),
                token_scope: token.scope.clone(),
            });
        }
        self.check_value(scope, token.value)
    }

    /// [`check`](Self::check) for callers that propagate coordination errors.
    ///
    /// A rejection is an ownership loss: the caller must stop acting as holder.
    pub fn enforce(&self, scope: &str, token: &FencingToken) -> Result<(), CoordinationError> {
        self.check(scope, token).context(FencingRejectedSnafu)
    }

    /// Highest token accepted for `scope`.
    pub fn last_accepted(&self, scope: &str) -> Option<u64> {
        self.lock().get(scope).copied()
    }

    fn check_value(&self, scope: &str, token: u64) -> Result<(), FenceError> {
        let mut last_accepted = self.lock();
        let last = last_accepted.get(scope).copied();
        if !should_accept_token(token, last) {
            debug!(scope, presented = token, last_accepted = ?last, "rejected stale fencing token");
            return Err(FenceError::StaleToken {
                scope: scope.to_string(),
                presented: token,
                last_accepted: last.unwrap_or(0),
            });
        }
        last_accepted.insert(scope.to_string(), token);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.last_accepted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
