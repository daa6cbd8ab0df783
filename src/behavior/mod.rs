//! The behavior state machine: Follower, Candidate and the Leader variants.

mod candidate;
mod follower;
mod leader;

pub(crate) use candidate::Candidate;
pub(crate) use follower::Follower;
pub(crate) use leader::{Leader, LeaderEvent};

use tracing::{debug, info};

use crate::access::MemberName;
use crate::context::RaftContext;
use crate::error::Result;
use crate::journal::TermInfo;
use crate::messages::{RaftRpc, RequestVote, RequestVoteReply};
use crate::types::RaftRole;

/// The active behavior of a member.
pub(crate) enum Behavior {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Behavior {
    /// The externally visible role.
    pub fn role(&self) -> RaftRole {
        match self {
            Behavior::Follower(_) => RaftRole::Follower,
            Behavior::Candidate(_) => RaftRole::Candidate,
            Behavior::Leader(leader) => leader.role(),
        }
    }

    /// The leader this behavior knows of, if any.
    pub fn leader_id(&self, ctx: &RaftContext) -> Option<MemberName> {
        match self {
            Behavior::Follower(f) => f.leader_id().cloned(),
            Behavior::Candidate(_) => None,
            Behavior::Leader(_) => Some(ctx.id.clone()),
        }
    }

    /// Handle one RPC. Returns the next behavior on a transition.
    pub async fn handle_rpc(
        &mut self,
        ctx: &mut RaftContext,
        from: &MemberName,
        rpc: RaftRpc,
    ) -> Result<Option<Behavior>> {
        match self {
            Behavior::Follower(f) => f.handle_rpc(ctx, from, rpc).await,
            Behavior::Candidate(c) => c.handle_rpc(ctx, from, rpc).await,
            Behavior::Leader(l) => l.handle_rpc(ctx, from, rpc).await,
        }
    }

    /// Advance timers. Returns the next behavior on a transition.
    pub async fn tick(&mut self, ctx: &mut RaftContext) -> Result<Option<Behavior>> {
        match self {
            Behavior::Follower(f) => f.tick(ctx),
            Behavior::Candidate(c) => c.tick(ctx),
            Behavior::Leader(l) => l.tick(ctx).await,
        }
    }

    /// Adopt a higher term seen in `rpc`, reverting to follower if needed.
    ///
    /// Returns the follower to re-dispatch the RPC to, or `None` when no adoption was
    /// necessary. Re-dispatching covers the transfer-in-progress case: a leader that
    /// receives a RequestVote from the member it is handing off to steps down and still
    /// answers the vote, so the target wins its election promptly.
    pub fn adopt_term_if_newer(
        &mut self,
        ctx: &mut RaftContext,
        rpc: &RaftRpc,
    ) -> Result<Option<Behavior>> {
        if rpc.term() <= ctx.current_term() {
            return Ok(None);
        }
        info!(
            member = %ctx.id,
            term = rpc.term(),
            kind = rpc.kind(),
            "message term is greater than ours, adopting"
        );
        ctx.persist_term_info(TermInfo::new(rpc.term()))?;
        Ok(Some(Behavior::Follower(Follower::new(ctx))))
    }
}

/// Shared vote decision (§5.2, §5.4.1). The caller has already normalized terms, so
/// `request.term <= ctx.current_term()` holds here.
pub(crate) fn decide_vote(ctx: &mut RaftContext, request: &RequestVote) -> Result<RequestVoteReply> {
    let current_term = ctx.current_term();
    let grant = request.term == current_term
        && ctx
            .term_info
            .voted_for
            .as_ref()
            .map(|voted| voted == &request.candidate)
            .unwrap_or(true)
        && ctx.candidate_log_up_to_date(request.last_log_index, request.last_log_term);

    if grant && ctx.term_info.voted_for.is_none() {
        // The vote must survive a crash; persist before replying.
        ctx.persist_term_info(TermInfo::voted(current_term, request.candidate.clone()))?;
    }

    debug!(
        member = %ctx.id,
        candidate = %request.candidate,
        term = request.term,
        grant,
        "vote decided"
    );
    Ok(RequestVoteReply {
        term: current_term,
        vote_granted: grant,
    })
}
