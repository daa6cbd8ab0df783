//! Follower behavior: replicate from the leader, vote, reassemble snapshots.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::access::MemberName;
use crate::behavior::{decide_vote, Behavior, Candidate};
use crate::context::RaftContext;
use crate::error::Result;
use crate::messages::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, RaftRpc,
    INVALID_CHUNK_INDEX,
};
use crate::snapshot::{FollowerInstallSnapshotState, Snapshot, SnapshotManager};
use crate::types::NONE;

/// An in-flight snapshot transfer from a specific leader.
struct InstallTracker {
    leader: MemberName,
    state: FollowerInstallSnapshotState,
}

/// The follower behavior.
pub(crate) struct Follower {
    leader: Option<MemberName>,
    election_deadline: Instant,
    install: Option<InstallTracker>,
}

impl Follower {
    /// Create a follower with a freshly randomized election deadline.
    pub fn new(ctx: &RaftContext) -> Self {
        Self {
            leader: None,
            election_deadline: Instant::now() + ctx.randomized_election_timeout(),
            install: None,
        }
    }

    /// The leader this follower is tracking.
    pub fn leader_id(&self) -> Option<&MemberName> {
        self.leader.as_ref()
    }

    fn reset_election_deadline(&mut self, ctx: &RaftContext) {
        self.election_deadline = Instant::now() + ctx.randomized_election_timeout();
    }

    pub async fn handle_rpc(
        &mut self,
        ctx: &mut RaftContext,
        from: &MemberName,
        rpc: RaftRpc,
    ) -> Result<Option<Behavior>> {
        match rpc {
            RaftRpc::AppendEntries(req) => self.handle_append_entries(ctx, req).await,
            RaftRpc::InstallSnapshot(req) => self.handle_install_snapshot(ctx, req).await,
            RaftRpc::RequestVote(req) => {
                let reply = decide_vote(ctx, &req)?;
                if reply.vote_granted {
                    self.reset_election_deadline(ctx);
                }
                ctx.send(from, RaftRpc::RequestVoteReply(reply));
                Ok(None)
            }
            RaftRpc::TimeoutNow(req) => {
                if req.term < ctx.current_term() || !ctx.voting_member {
                    return Ok(None);
                }
                info!(member = %ctx.id, "leadership handed to us, starting election now");
                Candidate::start_election(ctx).map(Some)
            }
            // Stale replies from an earlier role.
            RaftRpc::AppendEntriesReply(_)
            | RaftRpc::RequestVoteReply(_)
            | RaftRpc::InstallSnapshotReply(_) => Ok(None),
        }
    }

    pub async fn handle_append_entries(
        &mut self,
        ctx: &mut RaftContext,
        req: AppendEntries,
    ) -> Result<Option<Behavior>> {
        if req.term < ctx.current_term() {
            debug!(member = %ctx.id, term = req.term, "rejecting AppendEntries from stale term");
            self.reply_append(ctx, &req.leader, false, false);
            return Ok(None);
        }

        self.leader = Some(req.leader.clone());
        self.reset_election_deadline(ctx);
        if let Some(address) = &req.leader_address {
            ctx.set_peer_address(&req.leader, address.clone());
        }

        // Consistency check against the entry preceding the batch.
        if req.prev_log_index != NONE {
            match ctx.log.term_of(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                Some(term) => {
                    info!(
                        member = %ctx.id,
                        prev_index = req.prev_log_index,
                        our_term = term,
                        leader_term = req.prev_log_term,
                        "conflicting previous entry"
                    );
                    self.reply_append(ctx, &req.leader, false, false);
                    return Ok(None);
                }
                None if ctx.log.is_in_snapshot(req.prev_log_index) => {
                    // Covered by our snapshot, hence committed; overlapping entries are
                    // skipped on append.
                }
                None => {
                    // The leader may already have trimmed the entries we are missing,
                    // in which case only a snapshot can catch us up.
                    let force = req.replicated_to_all != NONE
                        && req.replicated_to_all > ctx.log.last_index();
                    info!(
                        member = %ctx.id,
                        prev_index = req.prev_log_index,
                        last_index = ctx.log.last_index(),
                        force,
                        "log out of sync with leader"
                    );
                    self.reply_append(ctx, &req.leader, false, force);
                    return Ok(None);
                }
            }
        }

        if !req.entries.is_empty() {
            let prev_last = ctx.log.last_index();
            match ctx.log.append_received(&req.entries) {
                Ok(added) => ctx.store_received(prev_last, &added)?,
                Err(e) => {
                    warn!(member = %ctx.id, error = %e, "failed to append received entries");
                    self.reply_append(ctx, &req.leader, false, false);
                    return Ok(None);
                }
            }
        }

        if req.leader_commit != NONE && req.leader_commit > ctx.log.commit_index() {
            let new_commit = req.leader_commit.min(ctx.log.last_index());
            ctx.log.set_commit_index(new_commit);
            ctx.apply_committed().await;
            ctx.maybe_capture_snapshot().await?;
        }

        if req.replicated_to_all != NONE {
            ctx.log.trim_replicated(req.replicated_to_all);
        }

        self.reply_append(ctx, &req.leader, true, false);
        Ok(None)
    }

    fn reply_append(&self, ctx: &RaftContext, leader: &MemberName, success: bool, force: bool) {
        let needs_leader_address = ctx
            .peers
            .get(leader)
            .map(|p| p.address.is_none())
            .unwrap_or(true);
        ctx.send(
            leader,
            RaftRpc::AppendEntriesReply(AppendEntriesReply {
                term: ctx.current_term(),
                follower: ctx.id.clone(),
                success,
                last_log_index: ctx.log.last_index(),
                last_log_term: ctx.log.last_term(),
                force_install_snapshot: force,
                needs_leader_address,
            }),
        );
    }

    async fn handle_install_snapshot(
        &mut self,
        ctx: &mut RaftContext,
        req: InstallSnapshot,
    ) -> Result<Option<Behavior>> {
        if req.term < ctx.current_term() {
            self.reply_install(ctx, &req.leader, req.chunk_index, false);
            return Ok(None);
        }

        self.leader = Some(req.leader.clone());
        self.reset_election_deadline(ctx);

        if req.chunk_index == crate::messages::FIRST_CHUNK_INDEX {
            debug!(
                member = %ctx.id,
                total_chunks = req.total_chunks,
                index = req.last_included_index,
                "starting snapshot transfer"
            );
            self.install = Some(InstallTracker {
                leader: req.leader.clone(),
                state: FollowerInstallSnapshotState::new(req.total_chunks),
            });
        }

        let tracker = match &mut self.install {
            Some(tracker) if tracker.leader == req.leader => tracker,
            _ => {
                warn!(member = %ctx.id, chunk = req.chunk_index, "chunk without an active transfer");
                self.install = None;
                self.reply_install(ctx, &req.leader, INVALID_CHUNK_INDEX, false);
                return Ok(None);
            }
        };

        let complete = match tracker.state.add_chunk(
            req.chunk_index,
            req.total_chunks,
            req.last_chunk_hash,
            &req.data,
        ) {
            Ok(complete) => complete,
            Err(e) => {
                warn!(member = %ctx.id, error = %e, "rejecting snapshot chunk");
                self.install = None;
                self.reply_install(ctx, &req.leader, INVALID_CHUNK_INDEX, false);
                return Ok(None);
            }
        };

        if !complete {
            self.reply_install(ctx, &req.leader, req.chunk_index, true);
            return Ok(None);
        }

        let tracker = self.install.take().expect("transfer just completed");
        match self.apply_leader_snapshot(ctx, &req, tracker.state).await {
            Ok(()) => {
                info!(
                    member = %ctx.id,
                    index = req.last_included_index,
                    term = req.last_included_term,
                    "snapshot installed"
                );
                ctx.metrics.incr_snapshots_installed();
                self.reply_install(ctx, &req.leader, req.chunk_index, true);
            }
            Err(e) => {
                warn!(member = %ctx.id, error = %e, "failed to apply leader snapshot");
                self.reply_install(ctx, &req.leader, req.chunk_index, false);
            }
        }
        Ok(None)
    }

    async fn apply_leader_snapshot(
        &mut self,
        ctx: &mut RaftContext,
        req: &InstallSnapshot,
        state: FollowerInstallSnapshotState,
    ) -> Result<()> {
        let state_bytes = SnapshotManager::decode_install(&state.into_bytes())?;
        ctx.state_machine.install_snapshot(state_bytes.clone()).await?;
        ctx.log
            .reset_to_snapshot(req.last_included_index, req.last_included_term);
        if let Some(config) = &req.server_config {
            ctx.apply_server_config(config);
        }

        // Anything journaled before the install may conflict with the new boundary.
        if let Some(journal) = &mut ctx.journal {
            journal.truncate_from(1)?;
            journal.compact_to(req.last_included_index)?;
        }

        let snapshot = Snapshot {
            last_applied_index: req.last_included_index,
            last_applied_term: req.last_included_term,
            state: state_bytes,
            unapplied_entries: Vec::new(),
            term_info: ctx.term_info.clone(),
            server_config: req.server_config.clone(),
        };
        ctx.snapshots
            .persist_and_commit(&snapshot, &mut ctx.log, ctx.journal.as_mut())?;
        Ok(())
    }

    fn reply_install(&self, ctx: &RaftContext, leader: &MemberName, chunk_index: u32, success: bool) {
        ctx.send(
            leader,
            RaftRpc::InstallSnapshotReply(InstallSnapshotReply {
                term: ctx.current_term(),
                follower: ctx.id.clone(),
                chunk_index,
                success,
            }),
        );
    }

    pub fn tick(&mut self, ctx: &mut RaftContext) -> Result<Option<Behavior>> {
        if Instant::now() < self.election_deadline {
            return Ok(None);
        }
        if !ctx.voting_member {
            // Non-voting members wait for a leader indefinitely.
            self.reset_election_deadline(ctx);
            return Ok(None);
        }
        if self.install.is_some() {
            // Don't abandon an in-flight snapshot transfer for an election.
            self.reset_election_deadline(ctx);
            return Ok(None);
        }
        info!(member = %ctx.id, term = ctx.current_term(), "election timeout");
        Candidate::start_election(ctx).map(Some)
    }
}
