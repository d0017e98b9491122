//! Store vocabulary for the warden coordination layer.
//!
//! The coordination primitives never talk to a concrete store. They consume
//! the [`KeyValueStore`] and [`ClusterProbe`] traits defined here, which
//! describe what any linearizable backend (etcd-like, Raft-backed KV, or the
//! in-memory store in `warden-testing`) must provide:
//!
//! - conditional insert, sequential create, and small transactions
//! - reads and prefix scans stamped with the current revision
//! - prefix watches replayable from a start revision
//! - lease grant, keep-alive, and revoke with attached-key deletion
//! - a single global revision counter

mod cluster;
mod error;
mod kv;
mod traits;
mod watch;

pub use cluster::ClusterStatus;
pub use cluster::MemberStatus;
pub use error::KeyValueStoreError;
pub use kv::DeleteRequest;
pub use kv::DeleteResult;
pub use kv::KeyValueWithRevision;
pub use kv::ReadRequest;
pub use kv::ReadResult;
pub use kv::SEQUENTIAL_KEY_WIDTH;
pub use kv::ScanRequest;
pub use kv::ScanResult;
pub use kv::TxnCompare;
pub use kv::TxnOp;
pub use kv::WriteCommand;
pub use kv::WriteRequest;
pub use kv::WriteResult;
pub use kv::parse_sequential_revision;
pub use kv::sequential_key;
pub use traits::ClusterProbe;
pub use traits::KeyValueStore;
pub use watch::WatchEvent;
pub use watch::WatchEventType;
pub use watch::WatchRequest;
pub use watch::WatchStream;
