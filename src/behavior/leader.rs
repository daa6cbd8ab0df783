//! Leader behavior: replication bookkeeping, commit advancement, chunked snapshot
//! installation, isolation detection and leadership transfer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::access::MemberName;
use crate::behavior::{decide_vote, Behavior};
use crate::context::RaftContext;
use crate::error::{RaftError, Result};
use crate::log::Payload;
use crate::messages::{
    AppendEntries, AppendEntriesReply, InstallSnapshot, InstallSnapshotReply, RaftRpc, TimeoutNow,
    INVALID_CHUNK_INDEX,
};
use crate::snapshot::{LeaderInstallSnapshotState, SnapshotManager};
use crate::types::{LogIndex, RaftRole, VotingState, NONE};

/// Events surfaced to the node loop for coordination outside the behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeaderEvent {
    /// A snapshot finished installing on a follower that joined as
    /// `VotingNotInitialized`.
    SnapshotInstalled(MemberName),

    /// TimeoutNow was sent to the leadership-transfer target.
    TimeoutNowSent(MemberName),
}

/// Which flavor of leadership is currently being exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaderPhase {
    /// Committing the no-op entry of our own term before serving.
    Pre { pending: LogIndex },

    /// Full leadership.
    Normal,

    /// Cannot reach a quorum of voting followers.
    Isolated,
}

/// Replication progress the leader tracks per follower.
pub(crate) struct FollowerLogInformation {
    pub name: MemberName,
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    last_activity: Option<Instant>,
    sent_commit_index: LogIndex,
    install: Option<LeaderInstallSnapshotState>,
    needs_leader_address: bool,
}

impl FollowerLogInformation {
    fn new(name: MemberName, next_index: LogIndex) -> Self {
        Self {
            name,
            next_index,
            match_index: NONE,
            last_activity: None,
            sent_commit_index: NONE,
            install: None,
            needs_leader_address: false,
        }
    }

    fn mark_active(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// Whether the follower has replied within the election timeout.
    pub fn is_active(&self, election_timeout: Duration) -> bool {
        self.last_activity
            .map(|at| at.elapsed() < election_timeout)
            .unwrap_or(false)
    }

    /// Time since the last reply, or since the leader started tracking.
    pub fn activity_age(&self) -> Duration {
        self.last_activity
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn has_stale_commit_index(&self, commit: LogIndex) -> bool {
        self.sent_commit_index < commit
    }
}

struct SnapshotHolder {
    index: LogIndex,
    term: u64,
    bytes: Bytes,
}

struct Transfer {
    target: MemberName,
    timeout_now_sent: bool,
}

/// The leader behavior, covering the PreLeader and IsolatedLeader phases as well.
pub(crate) struct Leader {
    phase: LeaderPhase,
    followers: HashMap<MemberName, FollowerLogInformation>,
    snapshot_holder: Option<SnapshotHolder>,
    heartbeat_due: Instant,
    isolated_check_due: Instant,
    transfer: Option<Transfer>,
    /// Events for the node loop, drained after every message.
    pub events: Vec<LeaderEvent>,
}

impl Leader {
    /// Become leader for the current term.
    ///
    /// With uncommitted entries in the log we enter the PreLeader phase: a no-op entry
    /// of our own term is appended, and leadership is only announced as established
    /// once it commits (§5.4.1 forbids counting replicas for older terms).
    pub fn new(ctx: &mut RaftContext) -> Result<Self> {
        let phase = if ctx.log.last_index() > ctx.log.commit_index() {
            let pending = ctx.append_local(Payload::Noop)?;
            info!(member = %ctx.id, pending, "entering pre-leader phase");
            LeaderPhase::Pre { pending }
        } else {
            LeaderPhase::Normal
        };

        let next_index = ctx.log.last_index() + 1;
        let followers = ctx
            .peers
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    FollowerLogInformation::new(name.clone(), next_index),
                )
            })
            .collect();

        ctx.metrics.incr_leadership_changes();
        info!(member = %ctx.id, term = ctx.current_term(), "leadership acquired");

        Ok(Self {
            phase,
            followers,
            snapshot_holder: None,
            heartbeat_due: Instant::now() + ctx.config.heartbeat_interval,
            isolated_check_due: Instant::now() + ctx.config.isolated_check_interval,
            transfer: None,
            events: Vec::new(),
        })
    }

    /// Invoked by the node right after this behavior is installed: drives the
    /// single-member commit path and the initial heartbeat round.
    pub async fn post_transition(&mut self, ctx: &mut RaftContext) -> Result<()> {
        self.update_commit_and_apply(ctx).await?;
        self.send_append_entries(ctx, false).await?;
        Ok(())
    }

    /// The externally visible role for the current phase.
    pub fn role(&self) -> RaftRole {
        match self.phase {
            LeaderPhase::Pre { .. } => RaftRole::PreLeader,
            LeaderPhase::Normal => RaftRole::Leader,
            LeaderPhase::Isolated => RaftRole::IsolatedLeader,
        }
    }

    /// Per-follower progress, for introspection.
    pub fn followers(&self) -> impl Iterator<Item = &FollowerLogInformation> {
        self.followers.values()
    }

    /// Highest index replicated to every follower; `last_applied` with none.
    pub fn replicated_to_all(&self, ctx: &RaftContext) -> LogIndex {
        self.followers
            .values()
            .map(|f| f.match_index)
            .min()
            .unwrap_or_else(|| ctx.log.last_applied())
    }

    /// Reconcile the follower table with the peer table after a configuration change.
    pub fn sync_followers(&mut self, ctx: &RaftContext) {
        let next_index = ctx.log.last_index() + 1;
        for name in ctx.peers.keys() {
            self.followers
                .entry(name.clone())
                .or_insert_with(|| FollowerLogInformation::new(name.clone(), next_index));
        }
        self.followers.retain(|name, _| ctx.peers.contains_key(name));
    }

    pub async fn handle_rpc(
        &mut self,
        ctx: &mut RaftContext,
        from: &MemberName,
        rpc: RaftRpc,
    ) -> Result<Option<Behavior>> {
        match rpc {
            RaftRpc::AppendEntriesReply(reply) => {
                self.process_append_entries_reply(ctx, reply).await?;
                Ok(None)
            }
            RaftRpc::InstallSnapshotReply(reply) => {
                self.handle_install_snapshot_reply(ctx, reply).await?;
                Ok(None)
            }
            RaftRpc::RequestVote(req) => {
                let reply = decide_vote(ctx, &req)?;
                ctx.send(from, RaftRpc::RequestVoteReply(reply));
                Ok(None)
            }
            RaftRpc::AppendEntries(req) => {
                // Two leaders cannot share a term; this is a stale or confused sender.
                warn!(member = %ctx.id, from = %req.leader, term = req.term,
                    "ignoring AppendEntries while leader");
                Ok(None)
            }
            RaftRpc::RequestVoteReply(_) | RaftRpc::InstallSnapshot(_) | RaftRpc::TimeoutNow(_) => {
                Ok(None)
            }
        }
    }

    async fn process_append_entries_reply(
        &mut self,
        ctx: &mut RaftContext,
        reply: AppendEntriesReply,
    ) -> Result<()> {
        let election_timeout = ctx.config.election_timeout();
        let Some(info) = self.followers.get_mut(&reply.follower) else {
            warn!(member = %ctx.id, follower = %reply.follower, "reply from unknown follower");
            return Ok(());
        };

        info.mark_active();
        info.needs_leader_address = reply.needs_leader_address;

        let mut install_follower = None;
        if reply.last_log_index > ctx.log.last_index() {
            // Non-voting members can legitimately be ahead of a fresh leader (they do
            // not participate in elections); reset them with a snapshot.
            info!(
                member = %ctx.id,
                follower = %reply.follower,
                follower_last = reply.last_log_index,
                our_last = ctx.log.last_index(),
                "follower ahead of leader, forcing snapshot install"
            );
            info.match_index = NONE;
            info.next_index = NONE;
            install_follower = Some(reply.follower.clone());
        } else if reply.success {
            let term_here = ctx.log.term_of(reply.last_log_index);
            if reply.last_log_index != NONE
                && term_here.is_some()
                && term_here != Some(reply.last_log_term)
            {
                // The follower's last entry conflicts even though it reported success;
                // back up one entry and let replication repair it.
                info.next_index = reply.last_log_index.saturating_sub(1).max(1);
                info!(
                    member = %ctx.id,
                    follower = %reply.follower,
                    next_index = info.next_index,
                    "follower last entry term conflict, backing up"
                );
            } else {
                info.match_index = reply.last_log_index;
                info.next_index = reply.last_log_index + 1;
            }
        } else if reply.force_install_snapshot {
            info.match_index = NONE;
            info.next_index = NONE;
            install_follower = Some(reply.follower.clone());
        } else if reply.last_log_index == NONE
            || ctx.log.term_of(reply.last_log_index) == Some(reply.last_log_term)
        {
            // The follower is simply behind: catch it up from its own last entry.
            info.match_index = reply.last_log_index;
            info.next_index = reply.last_log_index + 1;
            info!(
                member = %ctx.id,
                follower = %reply.follower,
                next_index = info.next_index,
                "follower behind, catching up from its last index"
            );
        } else {
            // Conflict at an unknown point: decrement and probe.
            let decremented = info.next_index.saturating_sub(1);
            info.next_index = decremented.min(reply.last_log_index + 1);
            debug!(
                member = %ctx.id,
                follower = %reply.follower,
                next_index = info.next_index,
                "probing for log match point"
            );
        }

        let follower = reply.follower.clone();
        if let Some(follower) = install_follower {
            self.initiate_capture_to_install(ctx, &follower).await?;
        }

        self.update_commit_and_apply(ctx).await?;

        // Leadership transfer: once the target confirms the full log, prompt it.
        if let Some(transfer) = &mut self.transfer {
            if transfer.target == follower && !transfer.timeout_now_sent {
                let caught_up = self
                    .followers
                    .get(&follower)
                    .map(|f| f.match_index == ctx.log.last_index())
                    .unwrap_or(false);
                if caught_up {
                    info!(member = %ctx.id, target = %follower, "transfer target caught up");
                    ctx.send(
                        &follower,
                        RaftRpc::TimeoutNow(TimeoutNow {
                            term: ctx.current_term(),
                            leader: ctx.id.clone(),
                        }),
                    );
                    if let Some(transfer) = &mut self.transfer {
                        transfer.timeout_now_sent = true;
                    }
                    self.events.push(LeaderEvent::TimeoutNowSent(follower.clone()));
                }
            }
        }

        if self.phase == LeaderPhase::Isolated && !self.is_isolated(ctx, election_timeout) {
            info!(member = %ctx.id, "reconnected to a quorum, resuming leadership");
            self.phase = LeaderPhase::Normal;
        }

        self.send_updates_to_follower(ctx, &follower, false, false)
            .await?;
        Ok(())
    }

    /// §5.3/§5.4.1 commit rule: advance the commit index over entries of the current
    /// term replicated to a majority of voting members, then apply.
    async fn update_commit_and_apply(&mut self, ctx: &mut RaftContext) -> Result<()> {
        let majority = ctx.majority();
        let current_term = ctx.current_term();

        let mut index = ctx.log.commit_index() + 1;
        while let Some(term) = ctx.log.term_of(index).filter(|_| ctx.log.is_present(index)) {
            // We count ourselves: entries are journaled before they are proposed.
            let mut replicated = 1usize;
            for follower in self.followers.values() {
                let voting = ctx
                    .peers
                    .get(&follower.name)
                    .map(|p| p.is_voting())
                    .unwrap_or(false);
                if voting && follower.match_index >= index {
                    replicated += 1;
                }
            }
            if replicated < majority {
                trace!(index, replicated, majority, "replication quorum not reached");
                break;
            }
            if term == current_term {
                ctx.log.set_commit_index(index);
            } else {
                // Never commit entries of previous terms by counting replicas; keep
                // scanning so a current-term entry can commit them indirectly.
                debug!(index, term, current_term, "skipping prior-term entry for commit");
            }
            index += 1;
        }

        ctx.apply_committed().await;

        if let LeaderPhase::Pre { pending } = self.phase {
            if ctx.log.commit_index() >= pending {
                info!(member = %ctx.id, "pre-leader entry committed, leadership established");
                self.phase = LeaderPhase::Normal;
            }
        }

        ctx.maybe_capture_snapshot().await?;
        if !ctx.snapshots.is_capturing() {
            let replicated_to_all = self.replicated_to_all(ctx);
            ctx.log.trim_replicated(replicated_to_all);
        }
        Ok(())
    }

    /// Drive replication after a local append.
    pub async fn replicate(&mut self, ctx: &mut RaftContext) -> Result<()> {
        self.update_commit_and_apply(ctx).await?;
        if !self.followers.is_empty() {
            self.send_append_entries(ctx, false).await?;
        }
        Ok(())
    }

    async fn send_append_entries(&mut self, ctx: &mut RaftContext, is_heartbeat: bool) -> Result<()> {
        let names: Vec<MemberName> = self.followers.keys().cloned().collect();
        for name in names {
            self.send_updates_to_follower(ctx, &name, true, is_heartbeat)
                .await?;
        }
        Ok(())
    }

    /// Decide what one follower needs: entries, a snapshot chunk, a fresh capture, or
    /// just a heartbeat.
    async fn send_updates_to_follower(
        &mut self,
        ctx: &mut RaftContext,
        name: &MemberName,
        send_heartbeat: bool,
        _is_heartbeat: bool,
    ) -> Result<()> {
        let election_timeout = ctx.config.election_timeout();
        let chunk_timeout = ctx.config.chunk_timeout();
        let commit_index = ctx.log.commit_index();

        let Some(info) = self.followers.get_mut(name) else {
            return Ok(());
        };
        let active = info.is_active(election_timeout);

        if let Some(install) = &mut info.install {
            if active {
                if install.is_chunk_timed_out(chunk_timeout) {
                    warn!(member = %ctx.id, follower = %name, "snapshot chunk timed out, resending");
                    install.mark_send_status(false);
                    ctx.metrics.incr_snapshot_chunks_resent();
                    self.send_snapshot_chunk(ctx, name);
                } else if install.can_send_next_chunk() {
                    self.send_snapshot_chunk(ctx, name);
                } else if send_heartbeat || info.has_stale_commit_index(commit_index) {
                    self.send_append_entries_to_follower(ctx, name, Vec::new());
                }
            } else if send_heartbeat || info.has_stale_commit_index(commit_index) {
                // Keep heartbeating so the follower does not start an election.
                self.send_append_entries_to_follower(ctx, name, Vec::new());
            }
            return Ok(());
        }

        let next = info.next_index;
        let last = ctx.log.last_index();
        if active && ctx.log.is_present(next) {
            let entries = ctx
                .log
                .get_from(next, usize::MAX, ctx.config.maximum_message_slice_size);
            self.send_append_entries_to_follower(ctx, name, entries);
        } else if active
            && (next == NONE || (last > next && !ctx.log.is_present(next)))
            && !ctx.snapshots.is_capturing()
        {
            if Self::can_install_snapshot(ctx, next) {
                info!(
                    member = %ctx.id,
                    follower = %name,
                    next_index = next,
                    snapshot_index = ctx.log.snapshot_index(),
                    "initiating snapshot install for lagging follower"
                );
                let name = name.clone();
                self.initiate_capture_to_install(ctx, &name).await?;
            } else {
                warn!(
                    member = %ctx.id,
                    follower = %name,
                    next_index = next,
                    "follower behind but no snapshot covers its position"
                );
                self.send_append_entries_to_follower(ctx, name, Vec::new());
            }
        } else if send_heartbeat || info.has_stale_commit_index(commit_index) {
            self.send_append_entries_to_follower(ctx, name, Vec::new());
        }
        Ok(())
    }

    fn can_install_snapshot(ctx: &RaftContext, next_index: LogIndex) -> bool {
        next_index == NONE
            || (!ctx.log.is_present(next_index) && ctx.log.is_in_snapshot(next_index))
    }

    fn send_append_entries_to_follower(
        &mut self,
        ctx: &RaftContext,
        name: &MemberName,
        entries: Vec<crate::log::LogEntry>,
    ) {
        let replicated_to_all = self.replicated_to_all(ctx);
        let Some(info) = self.followers.get_mut(name) else {
            return;
        };

        // Withhold the commit index from followers whose state we cannot trust yet, so
        // they never apply conflicting prior-term entries (§5.4.2).
        let active = info.is_active(ctx.config.election_timeout());
        let leader_commit = if info.install.is_some() || !active {
            NONE
        } else {
            ctx.log.commit_index()
        };

        let prev_log_index = info.next_index.saturating_sub(1);
        let prev_log_term = ctx.log.term_of(prev_log_index).unwrap_or(NONE);
        let leader_address = if info.needs_leader_address {
            ctx.transport.local_address()
        } else {
            None
        };

        if !entries.is_empty() {
            debug!(
                member = %ctx.id,
                follower = %name,
                first = entries.first().map(|e| e.index).unwrap_or(NONE),
                count = entries.len(),
                "sending entries"
            );
        }

        info.sent_commit_index = leader_commit;
        ctx.send(
            name,
            RaftRpc::AppendEntries(AppendEntries {
                term: ctx.current_term(),
                leader: ctx.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                replicated_to_all,
                leader_address,
            }),
        );
    }

    /// Capture a snapshot for installation, or reuse the held one.
    ///
    /// The held snapshot is shared: a second lagging follower reuses it instead of
    /// triggering another capture.
    pub async fn initiate_capture_to_install(
        &mut self,
        ctx: &mut RaftContext,
        name: &MemberName,
    ) -> Result<()> {
        if self.snapshot_holder.is_none() {
            let state = ctx.state_machine.take_snapshot().await?;
            let index = ctx.log.last_applied();
            let term = ctx.log.term_of(index).unwrap_or(NONE);
            debug!(member = %ctx.id, index, term, "captured snapshot for installation");
            self.snapshot_holder = Some(SnapshotHolder {
                index,
                term,
                bytes: SnapshotManager::encode_install(&state),
            });
        }
        self.send_snapshot_chunk(ctx, name);
        Ok(())
    }

    fn send_snapshot_chunk(&mut self, ctx: &RaftContext, name: &MemberName) {
        let Some(holder) = &self.snapshot_holder else {
            // No snapshot to send; clear any dangling transfer state.
            if let Some(info) = self.followers.get_mut(name) {
                info.install = None;
            }
            return;
        };
        let Some(info) = self.followers.get_mut(name) else {
            return;
        };

        let install = info.install.get_or_insert_with(|| {
            LeaderInstallSnapshotState::new(
                holder.bytes.clone(),
                ctx.config.maximum_message_slice_size,
            )
        });
        let Some(chunk) = install.next_chunk() else {
            return;
        };

        let server_config = if chunk.chunk_index == chunk.total_chunks {
            Some(ctx.server_config())
        } else {
            None
        };
        ctx.metrics.incr_snapshot_chunks_sent();
        debug!(
            member = %ctx.id,
            follower = %name,
            chunk = chunk.chunk_index,
            total = chunk.total_chunks,
            "sending snapshot chunk"
        );
        ctx.send(
            name,
            RaftRpc::InstallSnapshot(InstallSnapshot {
                term: ctx.current_term(),
                leader: ctx.id.clone(),
                last_included_index: holder.index,
                last_included_term: holder.term,
                data: chunk.data,
                chunk_index: chunk.chunk_index,
                total_chunks: chunk.total_chunks,
                last_chunk_hash: chunk.last_chunk_hash,
                server_config,
            }),
        );
    }

    async fn handle_install_snapshot_reply(
        &mut self,
        ctx: &mut RaftContext,
        reply: InstallSnapshotReply,
    ) -> Result<()> {
        let Some(info) = self.followers.get_mut(&reply.follower) else {
            warn!(member = %ctx.id, follower = %reply.follower,
                "InstallSnapshotReply from unknown follower");
            return Ok(());
        };
        info.mark_active();
        let Some(install) = &mut info.install else {
            warn!(member = %ctx.id, follower = %reply.follower,
                "InstallSnapshotReply without transfer in progress");
            return Ok(());
        };

        if reply.chunk_index != install.chunk_index() {
            warn!(
                member = %ctx.id,
                follower = %reply.follower,
                got = reply.chunk_index,
                expected = install.chunk_index(),
                "chunk index mismatch"
            );
            if reply.chunk_index == INVALID_CHUNK_INDEX {
                install.reset();
            }
            return Ok(());
        }

        if !reply.success {
            warn!(member = %ctx.id, follower = %reply.follower, "chunk rejected, retrying");
            install.mark_send_status(false);
            self.send_snapshot_chunk(ctx, &reply.follower);
            return Ok(());
        }

        if !install.is_last_chunk(reply.chunk_index) {
            install.mark_send_status(true);
            self.send_snapshot_chunk(ctx, &reply.follower);
            return Ok(());
        }

        // Final chunk acknowledged.
        let snapshot_index = self
            .snapshot_holder
            .as_ref()
            .map(|h| h.index)
            .unwrap_or(NONE);
        info.match_index = snapshot_index;
        info.next_index = snapshot_index + 1;
        info.install = None;
        info!(
            member = %ctx.id,
            follower = %reply.follower,
            match_index = snapshot_index,
            "snapshot fully installed on follower"
        );

        if !self.followers.values().any(|f| f.install.is_some()) {
            self.snapshot_holder = None;
        }

        if ctx
            .peers
            .get(&reply.follower)
            .map(|p| p.voting_state == VotingState::VotingNotInitialized)
            .unwrap_or(false)
        {
            self.events
                .push(LeaderEvent::SnapshotInstalled(reply.follower.clone()));
        }

        self.update_commit_and_apply(ctx).await?;
        Ok(())
    }

    /// Begin handing leadership to `target`.
    pub fn request_transfer(&mut self, ctx: &RaftContext, target: &MemberName) -> Result<()> {
        let Some(info) = self.followers.get(target) else {
            return Err(RaftError::LeadershipTransferFailed(format!(
                "{target} is not a known follower"
            ))
            .into());
        };
        let voting = ctx
            .peers
            .get(target)
            .map(|p| p.is_voting())
            .unwrap_or(false);
        if !voting {
            return Err(RaftError::LeadershipTransferFailed(format!(
                "{target} is not a voting member"
            ))
            .into());
        }

        info!(member = %ctx.id, target = %target, "starting leadership transfer");
        let caught_up = info.match_index == ctx.log.last_index();
        self.transfer = Some(Transfer {
            target: target.clone(),
            timeout_now_sent: caught_up,
        });
        if caught_up {
            ctx.send(
                target,
                RaftRpc::TimeoutNow(TimeoutNow {
                    term: ctx.current_term(),
                    leader: ctx.id.clone(),
                }),
            );
            self.events.push(LeaderEvent::TimeoutNowSent(target.clone()));
        }
        Ok(())
    }

    /// Prompt the most caught-up voting follower to start an election right away.
    /// Used when this leader is leaving the cluster and will not wait for catch-up.
    pub fn prompt_successor(&self, ctx: &RaftContext) {
        let Some(target) = self.best_transfer_target(ctx) else {
            return;
        };
        info!(member = %ctx.id, target = %target, "prompting successor to take over");
        ctx.send(
            &target,
            RaftRpc::TimeoutNow(TimeoutNow {
                term: ctx.current_term(),
                leader: ctx.id.clone(),
            }),
        );
    }

    /// Pick the most caught-up voting follower, e.g. to hand leadership to when the
    /// leader is being removed.
    pub fn best_transfer_target(&self, ctx: &RaftContext) -> Option<MemberName> {
        self.followers
            .values()
            .filter(|f| {
                ctx.peers
                    .get(&f.name)
                    .map(|p| p.is_voting())
                    .unwrap_or(false)
            })
            .max_by_key(|f| f.match_index)
            .map(|f| f.name.clone())
    }

    fn is_isolated(&self, ctx: &RaftContext, election_timeout: Duration) -> bool {
        // The leader's own vote is part of the majority, so quorum contact requires
        // majority - 1 active voting followers.
        let mut required = ctx.majority().saturating_sub(1);
        if required == 0 {
            return false;
        }
        for follower in self.followers.values() {
            let voting = ctx
                .peers
                .get(&follower.name)
                .map(|p| p.is_voting())
                .unwrap_or(false);
            if voting && follower.is_active(election_timeout) {
                required -= 1;
                if required == 0 {
                    return false;
                }
            }
        }
        true
    }

    pub async fn tick(&mut self, ctx: &mut RaftContext) -> Result<Option<Behavior>> {
        let now = Instant::now();
        if now >= self.isolated_check_due {
            self.isolated_check_due = now + ctx.config.isolated_check_interval;
            let election_timeout = ctx.config.election_timeout();
            match self.phase {
                LeaderPhase::Normal if self.is_isolated(ctx, election_timeout) => {
                    warn!(member = %ctx.id, "lost contact with a quorum of voting followers");
                    self.phase = LeaderPhase::Isolated;
                }
                LeaderPhase::Isolated if !self.is_isolated(ctx, election_timeout) => {
                    info!(member = %ctx.id, "quorum contact restored");
                    self.phase = LeaderPhase::Normal;
                }
                _ => {}
            }
        }

        if now >= self.heartbeat_due {
            self.heartbeat_due = now + ctx.config.heartbeat_interval;
            self.send_append_entries(ctx, true).await?;
        }
        Ok(None)
    }
}
