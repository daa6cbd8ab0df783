//! Snapshot model, persistence and chunked transfer.

mod manager;
mod store;
mod transfer;

pub use manager::SnapshotManager;
pub use store::SnapshotStore;
pub use transfer::{
    ChunkError, FollowerInstallSnapshotState, LeaderInstallSnapshotState, OutboundChunk,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::journal::TermInfo;
use crate::log::LogEntry;
use crate::types::{LogIndex, ServerConfig, Term};

/// A captured snapshot: the serialized state machine as of `last_applied_index`, the
/// entries above it that were not yet applied, and the cluster metadata needed to
/// restart from this point alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Index of the last applied entry covered by `state`.
    pub last_applied_index: LogIndex,

    /// Term of that entry.
    pub last_applied_term: Term,

    /// Serialized state machine.
    pub state: Bytes,

    /// Entries above `last_applied_index` at capture time.
    pub unapplied_entries: Vec<LogEntry>,

    /// Election state at capture time.
    pub term_info: TermInfo,

    /// Cluster configuration at capture time, if one has been replicated.
    pub server_config: Option<ServerConfig>,
}

impl Snapshot {
    /// Index of the last entry represented by this snapshot, including unapplied ones.
    pub fn last_index(&self) -> LogIndex {
        self.unapplied_entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.last_applied_index)
    }
}
