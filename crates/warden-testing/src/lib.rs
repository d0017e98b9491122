//! Test fixtures for warden.
//!
//! [`DeterministicKeyValueStore`] implements both store traits from
//! `warden-core` entirely in memory, so coordination scenarios (crashes,
//! pauses past TTL, partitions, quorum loss) can be scripted without a real
//! cluster. [`LostAckStore`] wraps any store to model writes that commit
//! while their reply is lost.

mod lost_ack;
mod store;

pub use lost_ack::LostAckStore;
pub use lost_ack::WriteKind;
pub use store::DeterministicKeyValueStore;
