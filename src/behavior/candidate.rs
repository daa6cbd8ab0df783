//! Candidate behavior: solicit votes, count them, win or step back.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info};

use crate::access::MemberName;
use crate::behavior::{decide_vote, Behavior, Follower, Leader};
use crate::context::RaftContext;
use crate::error::Result;
use crate::journal::TermInfo;
use crate::messages::{AppendEntriesReply, RaftRpc, RequestVote};

/// The candidate behavior.
pub(crate) struct Candidate {
    votes: HashSet<MemberName>,
    election_deadline: Instant,
}

impl Candidate {
    /// Start a new election: bump the term, vote for ourselves, solicit the rest.
    ///
    /// A cluster without voting peers elects immediately.
    pub fn start_election(ctx: &mut RaftContext) -> Result<Behavior> {
        let term = ctx.current_term() + 1;
        ctx.persist_term_info(TermInfo::voted(term, ctx.id.clone()))?;
        ctx.metrics.incr_elections_started();
        info!(member = %ctx.id, term, "starting election");

        let mut candidate = Candidate {
            votes: HashSet::from([ctx.id.clone()]),
            election_deadline: Instant::now() + ctx.randomized_election_timeout(),
        };

        if candidate.votes.len() >= ctx.majority() {
            return Ok(Behavior::Leader(Leader::new(ctx)?));
        }

        let request = RequestVote {
            term,
            candidate: ctx.id.clone(),
            last_log_index: ctx.log.last_index(),
            last_log_term: ctx.log.last_term(),
        };
        for peer in ctx.peers.values().filter(|p| p.is_voting()) {
            ctx.send(&peer.name, RaftRpc::RequestVote(request.clone()));
        }
        candidate.election_deadline = Instant::now() + ctx.randomized_election_timeout();
        Ok(Behavior::Candidate(candidate))
    }

    pub async fn handle_rpc(
        &mut self,
        ctx: &mut RaftContext,
        from: &MemberName,
        rpc: RaftRpc,
    ) -> Result<Option<Behavior>> {
        match rpc {
            RaftRpc::RequestVoteReply(reply) => {
                if reply.term != ctx.current_term() || !reply.vote_granted {
                    return Ok(None);
                }
                self.votes.insert(from.clone());
                debug!(
                    member = %ctx.id,
                    votes = self.votes.len(),
                    needed = ctx.majority(),
                    "vote received"
                );
                if self.votes.len() >= ctx.majority() {
                    info!(member = %ctx.id, term = ctx.current_term(), "election won");
                    return Ok(Some(Behavior::Leader(Leader::new(ctx)?)));
                }
                Ok(None)
            }
            RaftRpc::RequestVote(req) => {
                // Same-term candidates reject each other: we voted for ourselves.
                let reply = decide_vote(ctx, &req)?;
                ctx.send(from, RaftRpc::RequestVoteReply(reply));
                Ok(None)
            }
            RaftRpc::AppendEntries(req) => {
                if req.term < ctx.current_term() {
                    // A deposed leader; reject and keep campaigning.
                    ctx.send(
                        &req.leader,
                        RaftRpc::AppendEntriesReply(AppendEntriesReply {
                            term: ctx.current_term(),
                            follower: ctx.id.clone(),
                            success: false,
                            last_log_index: ctx.log.last_index(),
                            last_log_term: ctx.log.last_term(),
                            force_install_snapshot: false,
                            needs_leader_address: false,
                        }),
                    );
                    return Ok(None);
                }
                // An established leader for this term; fall back and process.
                info!(member = %ctx.id, leader = %req.leader, "leader emerged, reverting to follower");
                let mut follower = Follower::new(ctx);
                follower.handle_append_entries(ctx, req).await?;
                Ok(Some(Behavior::Follower(follower)))
            }
            RaftRpc::InstallSnapshot(req) => {
                if req.term < ctx.current_term() {
                    return Ok(None);
                }
                let mut follower = Follower::new(ctx);
                let next = follower
                    .handle_rpc(ctx, from, RaftRpc::InstallSnapshot(req))
                    .await?;
                Ok(Some(next.unwrap_or(Behavior::Follower(follower))))
            }
            RaftRpc::AppendEntriesReply(_)
            | RaftRpc::InstallSnapshotReply(_)
            | RaftRpc::TimeoutNow(_) => Ok(None),
        }
    }

    pub fn tick(&mut self, ctx: &mut RaftContext) -> Result<Option<Behavior>> {
        if Instant::now() < self.election_deadline {
            return Ok(None);
        }
        info!(member = %ctx.id, term = ctx.current_term(), "election timed out, retrying");
        Candidate::start_election(ctx).map(Some)
    }
}
