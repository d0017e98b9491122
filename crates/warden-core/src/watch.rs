//! Prefix watch types.

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::kv::KeyValueWithRevision;

/// Request to stream changes under a key prefix.
///
/// An exact key is watched by passing the full key as the prefix; callers
/// that need exact matching filter on [`WatchEvent::key`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchRequest {
    pub prefix: String,
    /// First revision to deliver. Earlier history is replayed when retained.
    /// `None` starts from the next revision.
    pub start_revision: Option<u64>,
}

impl WatchRequest {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            start_revision: None,
        }
    }

    pub fn from_revision(prefix: impl Into<String>, start_revision: u64) -> Self {
        Self {
            prefix: prefix.into(),
            start_revision: Some(start_revision),
        }
    }
}

/// Type of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted (explicitly, or because its lease ended).
    Delete,
}

/// A single change, delivered in revision order within one watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    /// Entry after the change. For deletes this is the last value with
    /// `mod_revision` set to the deletion revision.
    pub kv: KeyValueWithRevision,
    /// Revision assigned to the change.
    pub revision: u64,
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        &self.kv.key
    }

    pub fn is_delete(&self) -> bool {
        self.event_type == WatchEventType::Delete
    }
}

/// Receiving end of a watch.
///
/// The store keeps the sending half; dropping this cancels the watch.
/// `None` from [`WatchStream::next_event`] means the store closed the watch.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}
