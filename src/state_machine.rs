//! The state machine driven by committed log entries.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::{LogIndex, Term};

/// User state machine replicated by the consensus engine.
///
/// `apply` is invoked for committed entries, strictly in index order, exactly once per
/// index within a process lifetime. It must not fail: commands should be validated
/// before they are proposed, because by the time they are applied the cluster has
/// already agreed on them.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed command.
    async fn apply(&self, index: LogIndex, term: Term, data: &Bytes);

    /// Serialize the current state for a snapshot.
    async fn take_snapshot(&self) -> Result<Bytes>;

    /// Replace the current state with a snapshot received from the leader or loaded
    /// during recovery.
    async fn install_snapshot(&self, state: Bytes) -> Result<()>;
}
