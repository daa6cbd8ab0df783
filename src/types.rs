//! Core types used throughout the consensus engine.

use serde::{Deserialize, Serialize};

use crate::access::MemberName;

/// A Raft term. Term 0 means "no term yet".
pub type Term = u64;

/// A log index. Index 0 is reserved as the "none" sentinel; real entries start at 1.
pub type LogIndex = u64;

/// Sentinel for "no index" / "no term".
pub const NONE: u64 = 0;

/// The role a member currently plays in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Passively replicating entries from a leader.
    Follower,

    /// Soliciting votes for a new term.
    Candidate,

    /// Elected, but still committing the first entry of its own term.
    PreLeader,

    /// Serving client operations and replicating to followers.
    Leader,

    /// Elected leader that cannot currently reach a quorum of voting followers.
    IsolatedLeader,
}

impl RaftRole {
    /// Whether this role is any of the leader variants.
    pub fn is_leader(self) -> bool {
        matches!(
            self,
            RaftRole::Leader | RaftRole::PreLeader | RaftRole::IsolatedLeader
        )
    }
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RaftRole::Follower => "Follower",
            RaftRole::Candidate => "Candidate",
            RaftRole::PreLeader => "PreLeader",
            RaftRole::Leader => "Leader",
            RaftRole::IsolatedLeader => "IsolatedLeader",
        };
        f.write_str(s)
    }
}

/// Voting capability of a member within the cluster configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingState {
    /// Full participant: votes in elections and counts toward commit.
    Voting,

    /// Replicates entries but never votes and never counts toward commit.
    NonVoting,

    /// Will become voting once the leader has installed a snapshot on it.
    /// Used while an added server catches up.
    VotingNotInitialized,
}

impl VotingState {
    /// Whether the member currently counts as a voter.
    pub fn is_voting(self) -> bool {
        matches!(self, VotingState::Voting)
    }
}

/// Information about one peer as seen by the local member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's member name.
    pub name: MemberName,

    /// Network address, if known. Absent for peers learned from a voting
    /// configuration that have not yet announced themselves.
    pub address: Option<String>,

    /// Voting capability.
    pub voting_state: VotingState,
}

impl PeerInfo {
    /// Create a voting peer.
    pub fn voting(name: MemberName, address: impl Into<String>) -> Self {
        Self {
            name,
            address: Some(address.into()),
            voting_state: VotingState::Voting,
        }
    }

    /// Create a non-voting peer.
    pub fn non_voting(name: MemberName, address: impl Into<String>) -> Self {
        Self {
            name,
            address: Some(address.into()),
            voting_state: VotingState::NonVoting,
        }
    }

    /// Whether the peer counts as a voter.
    pub fn is_voting(&self) -> bool {
        self.voting_state.is_voting()
    }
}

/// One server's entry in a replicated voting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// The server's member name.
    pub name: MemberName,

    /// Whether the server votes.
    pub voting: bool,
}

impl ServerInfo {
    /// Create a server entry.
    pub fn new(name: MemberName, voting: bool) -> Self {
        Self { name, voting }
    }
}

/// The replicated cluster configuration: every known server and its voting flag.
///
/// Carried as a log payload and on the final snapshot chunk. Applied to the local peer
/// table when *appended*, not when committed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// All servers in the cluster, including the one persisting this entry.
    pub servers: Vec<ServerInfo>,
}

impl ServerConfig {
    /// Create a configuration from server entries.
    pub fn new(servers: Vec<ServerInfo>) -> Self {
        Self { servers }
    }

    /// Look up one server.
    pub fn get(&self, name: &MemberName) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| &s.name == name)
    }

    /// Whether the configuration contains `name`.
    pub fn contains(&self, name: &MemberName) -> bool {
        self.get(name).is_some()
    }

    /// Number of voting servers.
    pub fn voting_count(&self) -> usize {
        self.servers.iter().filter(|s| s.voting).count()
    }
}

/// Result returned once a proposed entry has been committed and applied.
#[derive(Debug, Clone, Copy)]
pub struct ProposalResult {
    /// The index at which the entry was committed.
    pub index: LogIndex,

    /// The term under which the entry was committed.
    pub term: Term,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raft_role_leader_variants() {
        assert!(RaftRole::Leader.is_leader());
        assert!(RaftRole::PreLeader.is_leader());
        assert!(RaftRole::IsolatedLeader.is_leader());
        assert!(!RaftRole::Follower.is_leader());
        assert!(!RaftRole::Candidate.is_leader());
    }

    #[test]
    fn test_server_config_lookup() {
        let config = ServerConfig::new(vec![
            ServerInfo::new(MemberName::new("n1"), true),
            ServerInfo::new(MemberName::new("n2"), true),
            ServerInfo::new(MemberName::new("n3"), false),
        ]);

        assert!(config.contains(&MemberName::new("n1")));
        assert!(!config.contains(&MemberName::new("n4")));
        assert_eq!(config.voting_count(), 2);
    }

    #[test]
    fn test_voting_state() {
        assert!(VotingState::Voting.is_voting());
        assert!(!VotingState::NonVoting.is_voting());
        assert!(!VotingState::VotingNotInitialized.is_voting());
    }
}
