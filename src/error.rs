//! Error types for the consensus engine.

use std::io;
use thiserror::Error;

use crate::access::MemberName;

/// Result type alias for consensus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the consensus engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Raft protocol errors.
    #[error("raft error: {0}")]
    Raft(#[from] RaftError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Storage errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cluster membership errors.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was cancelled (e.g. the node shut down).
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Raft protocol related errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader, includes leader hint if known.
    #[error("not leader, leader is: {leader:?}")]
    NotLeader { leader: Option<MemberName> },

    /// Proposal was dropped (e.g. due to leader change before commit).
    #[error("proposal dropped")]
    ProposalDropped,

    /// Leadership could not be transferred to the requested member.
    #[error("leadership transfer failed: {0}")]
    LeadershipTransferFailed(String),

    /// Snapshot capture or installation failed.
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    /// Internal protocol error.
    #[error("raft internal: {0}")]
    Internal(String),
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to send a message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The peer spoke a wire version this build no longer supports.
    #[error("peer {peer} uses retired wire version {version}")]
    PastVersion { peer: String, version: u16 },

    /// The peer spoke a wire version this build does not know yet.
    #[error("peer {peer} uses future wire version {version}")]
    FutureVersion { peer: String, version: u16 },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Address parse error.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Entry not found.
    #[error("entry not found: index {0}")]
    EntryNotFound(u64),

    /// Snapshot not found.
    #[error("snapshot not found")]
    SnapshotNotFound,

    /// Non-contiguous entries within a single append operation.
    #[error("non-contiguous entries in append: index {prev_index} followed by {curr_index}")]
    NonContiguous { prev_index: u64, curr_index: u64 },

    /// Log gap detected - entries are not contiguous with the existing log.
    #[error("log gap detected: last_index={last_index}, first_new={first_new}")]
    LogGap { last_index: u64, first_new: u64 },

    /// Entry is behind the snapshot boundary and no longer available.
    #[error("log compacted at index {0}")]
    Compacted(u64),

    /// A journal segment or snapshot file failed its checksum.
    #[error("corrupt record in {file}: {reason}")]
    Corrupt { file: String, reason: String },

    /// I/O error.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
}

/// Cluster membership errors.
#[derive(Error, Debug)]
pub enum MembershipError {
    /// Server not found in the cluster configuration.
    #[error("server not found: {0}")]
    ServerNotFound(MemberName),

    /// Server already exists in the cluster configuration.
    #[error("server already exists: {0}")]
    ServerAlreadyExists(MemberName),

    /// The change would leave the cluster without any voting member.
    #[error("change would leave no voting member")]
    NoVotingMember,

    /// A prior server change is still in progress.
    #[error("prior server change in progress")]
    ChangeInProgress,
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Storage(StorageError::Io(e))
    }
}
