//! Ownership state machine shared by elections and locks.
//!
//! ```text
//!            Contend           Win
//!   Idle ─────────────▶ Contending ─────▶ Holder
//!    ▲                     │                 │
//!    └──── Abandon ────────┘                 │ Revoke
//!                          ▲                 ▼
//!                          └──── Contend ─ Revoked
//! ```

/// Payload-free view of an ownership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipPhase {
    Idle,
    Contending,
    Holder,
    Revoked,
}

/// Inputs that drive the ownership state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipTrigger {
    /// Caller starts a campaign or acquire.
    Contend,
    /// The caller's record is first in line and a token was issued.
    Win,
    /// Campaign cancelled, timed out, or failed before winning.
    Abandon,
    /// Ownership ended: resign, release, session end, or record loss.
    Revoke,
}

/// Compute the next phase, or `None` if the trigger is not valid here.
///
/// Invalid triggers are not errors: a late `Revoke` after a resign, or a
/// second `Abandon`, is simply ignored by the caller.
#[inline]
pub fn next_phase(current: OwnershipPhase, trigger: OwnershipTrigger) -> Option<OwnershipPhase> {
    use OwnershipPhase::*;
    use OwnershipTrigger::*;

    match (current, trigger) {
        (Idle | Revoked, Contend) => Some(Contending),
        (Contending, Win) => Some(Holder),
        (Contending, Abandon) => Some(Idle),
        (Holder, Revoke) => Some(Revoked),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::OwnershipPhase::*;
    use super::OwnershipTrigger::*;
    use super::*;

    #[test]
    fn happy_path() {
        assert_eq!(next_phase(Idle, Contend), Some(Contending));
        assert_eq!(next_phase(Contending, Win), Some(Holder));
        assert_eq!(next_phase(Holder, Revoke), Some(Revoked));
        assert_eq!(next_phase(Revoked, Contend), Some(Contending));
    }

    #[test]
    fn abandon_returns_to_idle() {
        assert_eq!(next_phase(Contending, Abandon), Some(Idle));
        assert_eq!(next_phase(Idle, Abandon), None);
    }

    #[test]
    fn holder_cannot_contend_or_win_again() {
        assert_eq!(next_phase(Holder, Contend), None);
        assert_eq!(next_phase(Holder, Win), None);
    }

    #[test]
    fn revoke_only_from_holder() {
        for phase in [Idle, Contending, Revoked] {
            assert_eq!(next_phase(phase, Revoke), None);
        }
    }
}
