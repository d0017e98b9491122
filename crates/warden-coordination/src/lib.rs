//! Coordination primitives over a linearizable key-value store.
//!
//! Everything here is built on the [`warden_core::KeyValueStore`] trait:
//! leases, conditional puts, sequential creates, and revision-ordered
//! watches. The store's global revision counter is the only clock that
//! matters for ordering and fencing.
//!
//! - [`SessionManager`] / [`Session`] - a renewed lease; its expiry is the
//!   sole signal that an owner has died
//! - [`ElectionCoordinator`] - leader election per path, served in
//!   campaign order
//! - [`LockManager`] - FIFO mutual exclusion per resource key
//! - [`FencingIssuer`] / [`FencingValidator`] - store-issued tokens that
//!   let a guarded resource turn away zombie owners
//! - [`HealthMonitor`] - quorum tracking and the degraded signal
//!
//! Every election or lock handle runs the same ownership state machine
//! (`Idle -> Contending -> Holder -> Revoked`) and publishes its changes on
//! one ordered [`EventStream`].
//!
//! ## Leader Election Example
//!
//! ```ignore
//! use warden_coordination::{ElectionConfig, ElectionCoordinator, SessionConfig, SessionManager};
//!
//! let session = SessionManager::new(store.clone(), SessionConfig::default()).start_default().await?;
//! let elections = ElectionCoordinator::new(store, session, ElectionConfig::default());
//!
//! let handle = elections.campaign("scheduler", "node-1", &cancel).await?;
//! let mut events = handle.event_stream().expect("first call");
//!
//! // Present the token with every write to the guarded resource.
//! let token = handle.token().expect("elected");
//!
//! handle.resign().await?;
//! ```
//!
//! ## Lock Example
//!
//! ```ignore
//! use warden_coordination::{LockConfig, LockManager};
//!
//! let locks = LockManager::new(store, session, LockConfig::default());
//! let lock = locks.acquire("orders", &cancel).await?;
//!
//! // Protected critical section
//! validator.enforce("lock/orders", &lock.token().expect("held"))?;
//!
//! lock.release().await?;
//! ```

mod config;
pub mod constants;
mod election;
mod error;
mod fencing;
mod health;
mod lock;
mod ownership;
mod queue;
mod retry;
mod session;
mod types;
pub mod verified;

pub use config::CoordinationConfig;
pub use config::ElectionConfig;
pub use config::HealthConfig;
pub use config::LockConfig;
pub use config::RetryConfig;
pub use config::SessionConfig;
pub use election::ElectionCoordinator;
pub use election::ElectionEvent;
pub use election::ElectionHandle;
pub use election::LeaderObserver;
pub use election::candidate_prefix;
pub use election::election_key;
pub use error::ConfigError;
pub use error::CoordinationError;
pub use error::FenceError;
pub use fencing::FencingIssuer;
pub use fencing::FencingValidator;
pub use fencing::HolderProof;
pub use fencing::fencing_key;
pub use health::ClusterHealth;
pub use health::HealthMonitor;
pub use health::HealthSignal;
pub use health::HealthSnapshot;
pub use health::LastKnownGood;
pub use health::ReadOutcome;
pub use lock::LockEvent;
pub use lock::LockHandle;
pub use lock::LockManager;
pub use ownership::EventStream;
pub use ownership::OwnershipState;
pub use ownership::RevokeReason;
pub use ownership::Transition;
pub use session::Session;
pub use session::SessionManager;
pub use session::SessionState;
pub use types::ElectionRecord;
pub use types::FencingToken;
pub use types::LockRecord;
pub use types::OwnershipStatus;
pub use types::SessionId;
pub use types::now_unix_ms;
