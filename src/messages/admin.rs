//! Server-administration requests: dynamic cluster membership change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::access::MemberName;

/// Add a server to the cluster configuration.
///
/// A voting joiner is first brought up to date with a snapshot while carrying the
/// `VotingNotInitialized` state, then the new configuration is replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddServer {
    /// The joining member.
    pub server: MemberName,

    /// Network address of the joining member.
    pub address: String,

    /// Whether the member should become a voter.
    pub voting: bool,
}

/// Remove a server from the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveServer {
    /// The member to remove.
    pub server: MemberName,
}

/// Flip the voting flag of one or more servers in a single configuration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeServersVotingStatus {
    /// Requested voting flag per member.
    pub changes: BTreeMap<MemberName, bool>,
}

/// Outcome of a server-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerChangeStatus {
    /// The change was committed.
    Ok,

    /// This member is not the leader and knows of none to forward to.
    NoLeader,

    /// Consensus on the new configuration was not reached in time.
    Timeout,

    /// AddServer: the server is already in the configuration.
    AlreadyExists,

    /// RemoveServer / ChangeServersVotingStatus: the server is not in the configuration.
    DoesNotExist,

    /// The request is structurally invalid, e.g. it would leave the cluster without a
    /// voting member.
    InvalidRequest,

    /// A queued request was abandoned because the change ahead of it timed out.
    PriorRequestConsensusTimeout,

    /// AddServer: the catch-up snapshot could not be installed on the joiner.
    SnapshotInstallFailed,
}

/// Reply to any server-change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerChangeReply {
    /// The outcome.
    pub status: ServerChangeStatus,

    /// The current leader, when this member is not it.
    pub leader_hint: Option<MemberName>,
}

impl ServerChangeReply {
    /// A successful reply.
    pub fn ok() -> Self {
        Self {
            status: ServerChangeStatus::Ok,
            leader_hint: None,
        }
    }

    /// A failure reply.
    pub fn failed(status: ServerChangeStatus) -> Self {
        Self {
            status,
            leader_hint: None,
        }
    }

    /// A "not leader" reply with a hint.
    pub fn no_leader(leader_hint: Option<MemberName>) -> Self {
        Self {
            status: ServerChangeStatus::NoLeader,
            leader_hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_voting_status_roundtrip() {
        let mut changes = BTreeMap::new();
        changes.insert(MemberName::new("n2"), false);
        changes.insert(MemberName::new("n3"), true);
        let msg = ChangeServersVotingStatus { changes };

        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: ChangeServersVotingStatus = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_reply_constructors() {
        assert_eq!(ServerChangeReply::ok().status, ServerChangeStatus::Ok);

        let reply = ServerChangeReply::no_leader(Some(MemberName::new("n1")));
        assert_eq!(reply.status, ServerChangeStatus::NoLeader);
        assert_eq!(reply.leader_hint, Some(MemberName::new("n1")));
    }
}
