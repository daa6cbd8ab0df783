//! Read-only introspection and management surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::access::MemberName;
use crate::snapshot::Snapshot;
use crate::types::{LogIndex, RaftRole, Term};

/// Reply to a leader lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindLeaderReply {
    /// The current leader, if any is known.
    pub leader: Option<MemberName>,

    /// The leader's network address, if known.
    pub leader_address: Option<String>,
}

/// Replication progress of one follower, as tracked by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerInfo {
    /// The follower's member name.
    pub id: MemberName,

    /// Next index the leader will send.
    pub next_index: LogIndex,

    /// Highest index known replicated.
    pub match_index: LogIndex,

    /// Whether the follower has responded within the election timeout.
    pub active: bool,

    /// Time since the follower's last activity, formatted `HH:mm:ss.SSS`.
    pub time_since_last_activity: String,

    /// Whether the follower votes.
    pub voting: bool,
}

/// Point-in-time diagnostic view of a member's Raft state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnDemandRaftState {
    /// Current term.
    pub current_term: Term,

    /// Commit index.
    pub commit_index: LogIndex,

    /// Last applied index.
    pub last_applied: LogIndex,

    /// Last log index.
    pub last_log_index: LogIndex,

    /// Last log term.
    pub last_log_term: Term,

    /// Snapshot boundary index.
    pub snapshot_index: LogIndex,

    /// Snapshot boundary term.
    pub snapshot_term: Term,

    /// Highest index replicated to all followers (leader only, else 0).
    pub replicated_to_all_index: LogIndex,

    /// Number of in-memory journal entries.
    pub in_memory_journal_log_size: usize,

    /// Payload bytes held in the in-memory journal.
    pub in_memory_journal_data_size: usize,

    /// The member voted for in the current term.
    pub voted_for: Option<MemberName>,

    /// The known leader.
    pub leader: Option<MemberName>,

    /// This member's role.
    pub raft_state: Option<RaftRole>,

    /// Whether this member votes.
    pub is_voting: bool,

    /// Whether a snapshot capture is in progress.
    pub is_snapshot_capture_initiated: bool,

    /// Known peer addresses.
    pub peer_addresses: HashMap<String, String>,

    /// Voting flag per peer.
    pub peer_voting_states: HashMap<String, bool>,

    /// Per-follower replication progress; populated only on a leader.
    pub follower_info_list: Vec<FollowerInfo>,
}

/// Reply to an on-demand snapshot capture.
#[derive(Debug, Clone)]
pub struct GetSnapshotReply {
    /// The member the snapshot was taken on.
    pub member: MemberName,

    /// The captured snapshot.
    pub snapshot: Snapshot,
}

/// Ask the leader to hand leadership to a specific member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLeadership {
    /// The member that should become leader.
    pub leader_to_be: MemberName,
}

/// Render a duration as `HH:mm:ss.SSS`, saturating at one day.
pub(crate) fn format_activity_age(age: std::time::Duration) -> String {
    let capped = age.min(std::time::Duration::from_millis(86_399_999));
    let total_ms = capped.as_millis() as u64;
    let (hrs, rem) = (total_ms / 3_600_000, total_ms % 3_600_000);
    let (mins, rem) = (rem / 60_000, rem % 60_000);
    let (secs, ms) = (rem / 1_000, rem % 1_000);
    format!("{hrs:02}:{mins:02}:{secs:02}.{ms:03}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format_activity_age() {
        assert_eq!(format_activity_age(Duration::from_millis(0)), "00:00:00.000");
        assert_eq!(format_activity_age(Duration::from_millis(61_005)), "00:01:01.005");
        // Saturates rather than overflowing the format.
        assert_eq!(
            format_activity_age(Duration::from_secs(90_000)),
            "23:59:59.999"
        );
    }

    #[test]
    fn test_on_demand_state_default() {
        let state = OnDemandRaftState::default();
        assert_eq!(state.current_term, 0);
        assert!(state.raft_state.is_none());
        assert!(state.follower_info_list.is_empty());
    }
}
