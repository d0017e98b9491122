//! Cluster membership status as reported by the store.

use serde::Deserialize;
use serde::Serialize;

/// Reachability of one voting member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberStatus {
    pub node_id: u64,
    pub is_reachable: bool,
}

/// Snapshot of store membership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterStatus {
    /// Voting members and whether the client can reach them.
    pub members: Vec<MemberStatus>,
    /// Current consensus leader, if one is known.
    pub leader: Option<u64>,
    /// Store revision when the status was taken.
    pub revision: u64,
}

impl ClusterStatus {
    /// Number of voting members.
    pub fn voter_count(&self) -> u32 {
        u32::try_from(self.members.len()).unwrap_or(u32::MAX)
    }

    /// Number of voting members currently reachable.
    pub fn reachable_count(&self) -> u32 {
        let reachable = self.members.iter().filter(|m| m.is_reachable).count();
        u32::try_from(reachable).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_reachable_members() {
        let status = ClusterStatus {
            members: vec![
                MemberStatus {
                    node_id: 1,
                    is_reachable: true,
                },
                MemberStatus {
                    node_id: 2,
                    is_reachable: false,
                },
                MemberStatus {
                    node_id: 3,
                    is_reachable: true,
                },
            ],
            leader: Some(1),
            revision: 10,
        };
        assert_eq!(status.voter_count(), 3);
        assert_eq!(status.reachable_count(), 2);
    }
}
