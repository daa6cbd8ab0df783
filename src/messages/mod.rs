//! The RPC vocabulary of the consensus protocol.
//!
//! Consensus RPCs travel between members; the `admin` module holds the server-change
//! requests and the `client` module the read-only introspection surface.

pub mod admin;
pub mod client;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::access::MemberName;
use crate::log::LogEntry;
use crate::types::{LogIndex, ServerConfig, Term};

/// Chunk index sent in an [`InstallSnapshotReply`] when the follower rejected the chunk
/// sequence outright; tells the leader to restart the transfer from the first chunk.
pub const INVALID_CHUNK_INDEX: u32 = 0;

/// First chunk index of a snapshot transfer.
pub const FIRST_CHUNK_INDEX: u32 = 1;

/// Replicate entries / heartbeat (§5.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    /// Leader's term.
    pub term: Term,

    /// The leader, so followers can redirect clients.
    pub leader: MemberName,

    /// Index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,

    /// Term of `prev_log_index`.
    pub prev_log_term: Term,

    /// Entries to store; empty for heartbeats.
    pub entries: Vec<LogEntry>,

    /// Leader's commit index, 0 when withheld (inactive follower, snapshot install in
    /// progress).
    pub leader_commit: LogIndex,

    /// Highest index replicated to all followers; lets followers trim their own logs.
    pub replicated_to_all: LogIndex,

    /// Leader's network address, sent when the follower asked for it.
    pub leader_address: Option<String>,
}

/// Reply to [`AppendEntries`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// Follower's current term.
    pub term: Term,

    /// The replying follower.
    pub follower: MemberName,

    /// True if the follower's log matched `prev_log_index`/`prev_log_term`.
    pub success: bool,

    /// Follower's last log index, for next/match bookkeeping.
    pub last_log_index: LogIndex,

    /// Follower's last log term.
    pub last_log_term: Term,

    /// The follower determined its log cannot be reconciled and requires a snapshot.
    pub force_install_snapshot: bool,

    /// The follower does not know the leader's address yet.
    pub needs_leader_address: bool,
}

/// Solicit a vote (§5.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    /// Candidate's term.
    pub term: Term,

    /// The candidate requesting the vote.
    pub candidate: MemberName,

    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Reply to [`RequestVote`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// Current term of the replying member, for the candidate to update itself.
    pub term: Term,

    /// True means the candidate received the vote.
    pub vote_granted: bool,
}

/// One chunk of a snapshot being installed on a follower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    /// Leader's term.
    pub term: Term,

    /// The sending leader.
    pub leader: MemberName,

    /// Index of the last entry covered by the snapshot.
    pub last_included_index: LogIndex,

    /// Term of that entry.
    pub last_included_term: Term,

    /// This chunk's bytes.
    pub data: Bytes,

    /// 1-based chunk number.
    pub chunk_index: u32,

    /// Total number of chunks in this transfer.
    pub total_chunks: u32,

    /// Hash of the previous chunk, echoed so the follower can verify sequencing.
    /// Absent on the first chunk.
    pub last_chunk_hash: Option<u32>,

    /// The voting configuration as of the snapshot; present only on the final chunk.
    pub server_config: Option<ServerConfig>,
}

/// Reply to one [`InstallSnapshot`] chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    /// Follower's current term.
    pub term: Term,

    /// The replying follower.
    pub follower: MemberName,

    /// The chunk being acknowledged, or [`INVALID_CHUNK_INDEX`] when the follower
    /// rejected the sequence and the transfer must restart.
    pub chunk_index: u32,

    /// Whether the chunk was accepted.
    pub success: bool,
}

/// Prompt a follower to start an election immediately, bypassing its election timer.
/// Sent by a leader transferring leadership once the target is fully caught up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutNow {
    /// Leader's term.
    pub term: Term,

    /// The transferring leader.
    pub leader: MemberName,
}

/// Any consensus RPC exchanged between members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftRpc {
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotReply(InstallSnapshotReply),
    TimeoutNow(TimeoutNow),
}

impl RaftRpc {
    /// The term carried by the RPC. Every RPC carries one: any message with a term above
    /// the receiver's forces term adoption (§5.1).
    pub fn term(&self) -> Term {
        match self {
            RaftRpc::AppendEntries(m) => m.term,
            RaftRpc::AppendEntriesReply(m) => m.term,
            RaftRpc::RequestVote(m) => m.term,
            RaftRpc::RequestVoteReply(m) => m.term,
            RaftRpc::InstallSnapshot(m) => m.term,
            RaftRpc::InstallSnapshotReply(m) => m.term,
            RaftRpc::TimeoutNow(m) => m.term,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftRpc::AppendEntries(_) => "AppendEntries",
            RaftRpc::AppendEntriesReply(_) => "AppendEntriesReply",
            RaftRpc::RequestVote(_) => "RequestVote",
            RaftRpc::RequestVoteReply(_) => "RequestVoteReply",
            RaftRpc::InstallSnapshot(_) => "InstallSnapshot",
            RaftRpc::InstallSnapshotReply(_) => "InstallSnapshotReply",
            RaftRpc::TimeoutNow(_) => "TimeoutNow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_term_extraction() {
        let rpc = RaftRpc::RequestVote(RequestVote {
            term: 7,
            candidate: MemberName::new("n1"),
            last_log_index: 10,
            last_log_term: 6,
        });
        assert_eq!(rpc.term(), 7);
        assert_eq!(rpc.kind(), "RequestVote");
    }

    #[test]
    fn test_install_snapshot_roundtrip() {
        let msg = RaftRpc::InstallSnapshot(InstallSnapshot {
            term: 3,
            leader: MemberName::new("n1"),
            last_included_index: 100,
            last_included_term: 2,
            data: Bytes::from_static(b"chunk"),
            chunk_index: 2,
            total_chunks: 5,
            last_chunk_hash: Some(0xdead_beef),
            server_config: None,
        });
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: RaftRpc = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
