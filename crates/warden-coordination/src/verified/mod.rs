//! Pure decision functions for coordination primitives.
//!
//! Everything here is deterministic: no I/O, no clocks, no randomness.
//! Time and jitter seeds come in as parameters, so the async shells in
//! `session`, `election`, `lock`, and `health` stay thin and every branch
//! they take can be tested in isolation.
//!
//! # Module Organization
//!
//! - [`backoff`]: exponential backoff with jitter
//! - [`session`]: renewal cadence and the Active/Degraded/Expired decision
//! - [`ownership`]: the Idle/Contending/Holder/Revoked transition table
//! - [`lock`]: waiter queue position
//! - [`fencing`]: token acceptance and quorum thresholds
//! - [`health`]: quorum-loss duration and the degraded flag
//!
//! # Tiger Style
//!
//! - Saturating arithmetic (no panics)
//! - Explicit integer widths
//! - All functions are total

pub mod backoff;
pub mod fencing;
pub mod health;
pub mod lock;
pub mod ownership;
pub mod session;

pub use backoff::BackoffResult;
pub use backoff::compute_backoff_with_jitter;
pub use fencing::compute_quorum_threshold;
pub use fencing::has_quorum;
pub use fencing::should_accept_token;
pub use health::is_degraded;
pub use health::next_quorum_loss_start;
pub use lock::WaiterPosition;
pub use lock::compute_waiter_position;
pub use ownership::OwnershipPhase;
pub use ownership::OwnershipTrigger;
pub use ownership::next_phase;
pub use session::RenewalDecision;
pub use session::compute_renew_interval_ms;
pub use session::compute_retry_delay_ms;
pub use session::evaluate_renewal;
