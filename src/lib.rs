//! Raft consensus engine with chunked snapshot transfer, dynamic cluster membership
//! and entity ownership.
//!
//! This crate provides the consensus core of a replicated shard:
//! - **Leader election and log replication** with non-voting member support
//! - **Snapshot capture and chunked installation** for lagging or joining members
//! - **Dynamic membership**: AddServer / RemoveServer / ChangeServersVotingStatus
//! - **Entity ownership** selection strategies for electing per-entity owners
//! - **ABI-versioned wire frames** so mixed-version clusters keep talking
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tiller::{LocalNetwork, MemberName, RaftConfig, RaftNode};
//! use tiller::testing::KvStateMachine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = LocalNetwork::new();
//!     let name = MemberName::new("member-1");
//!     let (transport, inbound) = network.join(name.clone());
//!
//!     let node = RaftNode::spawn(
//!         name,
//!         RaftConfig::new().with_storage_dir("/var/lib/tiller/member-1"),
//!         Vec::new(), // peers join via AddServer
//!         true,
//!         KvStateMachine::new(),
//!         Arc::new(transport),
//!         inbound,
//!     )
//!     .await?;
//!
//!     // Writes go through consensus.
//!     node.propose(&b"put city antwerp"[..]).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                NodeHandle API                  │
//! │  propose / add_server / raft_state / ...       │
//! └───────────────────────────────────────────────┘
//!                       │ mpsc
//!                       ▼
//! ┌───────────────────────────────────────────────┐
//! │               RaftNode task                    │
//! │  ┌──────────┐  ┌───────────┐  ┌────────────┐  │
//! │  │ Behavior │  │ Replicated│  │  Snapshot  │  │
//! │  │ F/C/L    │  │    Log    │  │  Manager   │  │
//! │  └──────────┘  └───────────┘  └────────────┘  │
//! │        │             │              │          │
//! │        ▼             ▼              ▼          │
//! │  ┌──────────┐  ┌───────────┐  ┌────────────┐  │
//! │  │ Transport│  │  Entry    │  │  Snapshot  │  │
//! │  │ TCP/local│  │  Journal  │  │   Store    │  │
//! │  └──────────┘  └───────────┘  └────────────┘  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Consistency model
//!
//! - Writes are linearizable: a proposal resolves only after the entry is committed by
//!   a majority of voting members and applied locally.
//! - The commit index only advances over entries of the leader's own term; prior-term
//!   entries commit indirectly (a fresh leader runs a PreLeader phase until its no-op
//!   entry commits).
//! - Non-voting members replicate but never vote or count toward commit.

pub mod access;
mod behavior;
pub mod config;
mod context;
pub mod error;
pub mod journal;
pub mod log;
mod membership;
pub mod messages;
pub mod metrics;
pub mod network;
pub mod node;
pub mod ownership;
mod recovery;
pub mod snapshot;
pub mod state_machine;
pub mod testing;
pub mod types;

// Re-export the main types for convenience.
pub use access::{
    AbiVersion, FutureVersionError, MemberName, PastVersionError, ShardIdentifier,
    TransactionChainIdentifier, TransactionIdentifier,
};
pub use config::RaftConfig;
pub use error::{Error, MembershipError, NetworkError, RaftError, Result, StorageError};
pub use messages::admin::{
    AddServer, ChangeServersVotingStatus, RemoveServer, ServerChangeReply, ServerChangeStatus,
};
pub use messages::client::{
    FindLeaderReply, FollowerInfo, GetSnapshotReply, OnDemandRaftState, RequestLeadership,
};
pub use network::{LocalNetwork, LocalTransport, TcpTransport, Transport};
pub use node::{NodeHandle, RaftNode};
pub use ownership::{
    EntityId, FirstCandidateSelectionStrategy, LeastLoadedCandidateSelectionStrategy,
    OwnerSelectionStrategy, OwnershipRegistry, SelectionStrategyConfig,
};
pub use state_machine::StateMachine;
pub use types::{PeerInfo, ProposalResult, RaftRole, ServerConfig, ServerInfo, VotingState};
