//! The node actor: one task owning all consensus state, driven by an inbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::access::MemberName;
use crate::behavior::{Behavior, Follower, Leader, LeaderEvent};
use crate::config::RaftConfig;
use crate::context::RaftContext;
use crate::error::{Error, RaftError, Result};
use crate::log::Payload;
use crate::membership::{ChangeOp, PostCommit, ServerChangeCoordinator};
use crate::messages::admin::{
    AddServer, ChangeServersVotingStatus, RemoveServer, ServerChangeReply,
};
use crate::messages::client::{
    format_activity_age, FindLeaderReply, FollowerInfo, GetSnapshotReply, OnDemandRaftState,
    RequestLeadership,
};
use crate::metrics::{MetricsSnapshot, RaftMetrics};
use crate::network::{Envelope, Transport};
use crate::recovery::recover;
use crate::state_machine::StateMachine;
use crate::types::{LogIndex, PeerInfo, ProposalResult, Term};

/// Control messages accepted by the node task.
enum NodeMessage {
    Propose {
        data: Bytes,
        reply: oneshot::Sender<Result<ProposalResult>>,
    },
    AddServer {
        req: AddServer,
        reply: oneshot::Sender<ServerChangeReply>,
    },
    RemoveServer {
        req: RemoveServer,
        reply: oneshot::Sender<ServerChangeReply>,
    },
    ChangeVoting {
        req: ChangeServersVotingStatus,
        reply: oneshot::Sender<ServerChangeReply>,
    },
    RequestLeadership {
        target: MemberName,
        reply: oneshot::Sender<Result<()>>,
    },
    GetState {
        reply: oneshot::Sender<OnDemandRaftState>,
    },
    FindLeader {
        reply: oneshot::Sender<FindLeaderReply>,
    },
    GetSnapshot {
        reply: oneshot::Sender<Result<GetSnapshotReply>>,
    },
    Shutdown,
}

/// Handle to a running [`RaftNode`] task.
#[derive(Clone)]
pub struct NodeHandle {
    id: MemberName,
    tx: mpsc::UnboundedSender<NodeMessage>,
    metrics: Arc<RaftMetrics>,
}

impl NodeHandle {
    /// This node's member name.
    pub fn id(&self) -> &MemberName {
        &self.id
    }

    /// Propose a state-machine command. Resolves once the entry is committed and
    /// applied on this node.
    pub async fn propose(&self, data: impl Into<Bytes>) -> Result<ProposalResult> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMessage::Propose {
                data: data.into(),
                reply,
            })
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Add a server to the cluster.
    pub async fn add_server(&self, req: AddServer) -> Result<ServerChangeReply> {
        self.server_change(|reply| NodeMessage::AddServer { req, reply })
            .await
    }

    /// Remove a server from the cluster.
    pub async fn remove_server(&self, req: RemoveServer) -> Result<ServerChangeReply> {
        self.server_change(|reply| NodeMessage::RemoveServer { req, reply })
            .await
    }

    /// Change voting flags of one or more servers.
    pub async fn change_servers_voting_status(
        &self,
        req: ChangeServersVotingStatus,
    ) -> Result<ServerChangeReply> {
        self.server_change(|reply| NodeMessage::ChangeVoting { req, reply })
            .await
    }

    async fn server_change(
        &self,
        build: impl FnOnce(oneshot::Sender<ServerChangeReply>) -> NodeMessage,
    ) -> Result<ServerChangeReply> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Ask this leader to hand leadership to another member.
    pub async fn request_leadership(&self, req: RequestLeadership) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMessage::RequestLeadership {
                target: req.leader_to_be,
                reply,
            })
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Diagnostic view of the node's Raft state.
    pub async fn raft_state(&self) -> Result<OnDemandRaftState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMessage::GetState { reply })
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// The current leader, if known.
    pub async fn find_leader(&self) -> Result<FindLeaderReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMessage::FindLeader { reply })
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Capture a snapshot on demand without trimming the log.
    pub async fn get_snapshot(&self) -> Result<GetSnapshotReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeMessage::GetSnapshot { reply })
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Copy of the node's metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the node task.
    pub fn shutdown(&self) {
        let _ = self.tx.send(NodeMessage::Shutdown);
    }
}

/// Entry point: spawns the consensus task for one member.
pub struct RaftNode;

impl RaftNode {
    /// Recover state and spawn the node task.
    ///
    /// `initial_peers` seeds the peer table for a fresh cluster; a replicated
    /// configuration found during recovery takes precedence. `voting` is this member's
    /// own initial flag (non-voting members never start elections).
    pub async fn spawn(
        id: MemberName,
        config: RaftConfig,
        initial_peers: Vec<PeerInfo>,
        voting: bool,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<NodeHandle> {
        let recovered = recover(&config, &state_machine).await?;
        let metrics = Arc::new(RaftMetrics::new());

        let mut peers = HashMap::new();
        for peer in initial_peers {
            if let Some(address) = &peer.address {
                transport.set_peer_address(peer.name.clone(), address.clone());
            }
            peers.insert(peer.name.clone(), peer);
        }

        let mut ctx = RaftContext {
            id: id.clone(),
            config,
            term_info: recovered.term_info,
            log: recovered.log,
            peers,
            voting_member: voting,
            journal: recovered.journal,
            term_store: recovered.term_store,
            snapshots: recovered.snapshots,
            state_machine,
            transport,
            metrics: Arc::clone(&metrics),
            peer_versions: HashMap::new(),
        };
        if let Some(config) = &recovered.server_config {
            ctx.apply_server_config(config);
        }

        let behavior = Behavior::Follower(Follower::new(&ctx));
        let (tx, rx) = mpsc::unbounded_channel();
        let node = Node {
            ctx,
            behavior,
            coordinator: ServerChangeCoordinator::new(),
            pending: Vec::new(),
            transfer: None,
        };
        tokio::spawn(node.run(rx, inbound));

        Ok(NodeHandle { id, tx, metrics })
    }
}

struct PendingProposal {
    index: LogIndex,
    term: Term,
    reply: oneshot::Sender<Result<ProposalResult>>,
}

struct PendingTransfer {
    target: MemberName,
    deadline: Instant,
    reply: oneshot::Sender<Result<()>>,
}

struct Node {
    ctx: RaftContext,
    behavior: Behavior,
    coordinator: ServerChangeCoordinator,
    pending: Vec<PendingProposal>,
    transfer: Option<PendingTransfer>,
}

impl Node {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<NodeMessage>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) {
        let tick_interval = (self.ctx.config.heartbeat_interval / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(member = %self.ctx.id, "node started");
        loop {
            let result = tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.on_envelope(envelope).await,
                    None => break,
                },
                message = control.recv() => match message {
                    Some(NodeMessage::Shutdown) | None => break,
                    Some(message) => self.on_control(message).await,
                },
            };
            if let Err(e) = result {
                warn!(member = %self.ctx.id, error = %e, "error handling node event");
            }
        }
        info!(member = %self.ctx.id, "node stopped");
        self.fail_pending(|| Error::Cancelled);
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope {
            from,
            from_address,
            version,
            rpc,
        } = envelope;
        self.ctx.note_peer_version(&from, version);
        if let Some(address) = from_address {
            let unknown = self
                .ctx
                .peers
                .get(&from)
                .map(|p| p.address.as_deref() != Some(address.as_str()))
                .unwrap_or(true);
            if unknown {
                self.ctx.transport.set_peer_address(from.clone(), address.clone());
                if let Some(peer) = self.ctx.peers.get_mut(&from) {
                    peer.address = Some(address);
                }
            }
        }

        // Any message from a higher term reverts us to follower first, then the
        // follower handles the message itself.
        if let Some(next) = self.behavior.adopt_term_if_newer(&mut self.ctx, &rpc)? {
            self.install_behavior(next).await?;
        }

        if let Some(next) = self.behavior.handle_rpc(&mut self.ctx, &from, rpc).await? {
            self.install_behavior(next).await?;
        }
        self.post_process().await
    }

    async fn on_control(&mut self, message: NodeMessage) -> Result<()> {
        match message {
            NodeMessage::Propose { data, reply } => self.on_propose(data, reply).await?,
            NodeMessage::AddServer { req, reply } => {
                self.on_server_change(ChangeOp::Add(req), reply).await?
            }
            NodeMessage::RemoveServer { req, reply } => {
                self.on_server_change(ChangeOp::Remove(req), reply).await?
            }
            NodeMessage::ChangeVoting { req, reply } => {
                self.on_server_change(ChangeOp::ChangeVoting(req), reply)
                    .await?
            }
            NodeMessage::RequestLeadership { target, reply } => {
                self.on_request_leadership(target, reply)
            }
            NodeMessage::GetState { reply } => {
                let _ = reply.send(self.on_demand_state());
            }
            NodeMessage::FindLeader { reply } => {
                let leader = self.behavior.leader_id(&self.ctx);
                let leader_address = leader.as_ref().and_then(|l| {
                    if l == &self.ctx.id {
                        self.ctx.transport.local_address()
                    } else {
                        self.ctx.peers.get(l).and_then(|p| p.address.clone())
                    }
                });
                let _ = reply.send(FindLeaderReply {
                    leader,
                    leader_address,
                });
            }
            NodeMessage::GetSnapshot { reply } => {
                let result = self.capture_on_demand().await;
                let _ = reply.send(result);
            }
            NodeMessage::Shutdown => unreachable!("handled in run loop"),
        }
        self.post_process().await
    }

    async fn on_propose(
        &mut self,
        data: Bytes,
        reply: oneshot::Sender<Result<ProposalResult>>,
    ) -> Result<()> {
        let Behavior::Leader(_) = &self.behavior else {
            let leader = self.behavior.leader_id(&self.ctx);
            let _ = reply.send(Err(RaftError::NotLeader { leader }.into()));
            return Ok(());
        };

        let index = self.ctx.append_local(Payload::Data(data))?;
        self.pending.push(PendingProposal {
            index,
            term: self.ctx.current_term(),
            reply,
        });
        if let Behavior::Leader(leader) = &mut self.behavior {
            leader.replicate(&mut self.ctx).await?;
        }
        Ok(())
    }

    async fn on_server_change(
        &mut self,
        op: ChangeOp,
        reply: oneshot::Sender<ServerChangeReply>,
    ) -> Result<()> {
        let Behavior::Leader(leader) = &mut self.behavior else {
            let hint = self.behavior.leader_id(&self.ctx);
            let _ = reply.send(ServerChangeReply::no_leader(hint));
            return Ok(());
        };
        self.coordinator
            .submit(&mut self.ctx, leader, op, reply)
            .await
    }

    fn on_request_leadership(&mut self, target: MemberName, reply: oneshot::Sender<Result<()>>) {
        let Behavior::Leader(leader) = &mut self.behavior else {
            let leader_hint = self.behavior.leader_id(&self.ctx);
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: leader_hint,
            }
            .into()));
            return;
        };
        if target == self.ctx.id {
            let _ = reply.send(Ok(()));
            return;
        }
        match leader.request_transfer(&self.ctx, &target) {
            Ok(()) => {
                self.transfer = Some(PendingTransfer {
                    target,
                    deadline: Instant::now() + self.ctx.config.election_timeout() * 4,
                    reply,
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn capture_on_demand(&mut self) -> Result<GetSnapshotReply> {
        let state = self.ctx.state_machine.take_snapshot().await?;
        let snapshot = self.ctx.snapshots.build(
            &self.ctx.log,
            state,
            self.ctx.term_info.clone(),
            Some(self.ctx.server_config()),
        );
        Ok(GetSnapshotReply {
            member: self.ctx.id.clone(),
            snapshot,
        })
    }

    async fn on_tick(&mut self) -> Result<()> {
        if let Some(next) = self.behavior.tick(&mut self.ctx).await? {
            self.install_behavior(next).await?;
        }
        if let Behavior::Leader(leader) = &mut self.behavior {
            self.coordinator.on_tick(&mut self.ctx);
            leader.sync_followers(&self.ctx);
        }
        self.post_process().await
    }

    /// Swap in a new behavior, failing leader-only work when leadership is lost.
    async fn install_behavior(&mut self, next: Behavior) -> Result<()> {
        let was_leader = matches!(self.behavior, Behavior::Leader(_));
        let old_role = self.behavior.role();
        self.behavior = next;
        let new_role = self.behavior.role();
        if old_role != new_role {
            info!(member = %self.ctx.id, from = %old_role, to = %new_role, "role changed");
        }

        if was_leader && !matches!(self.behavior, Behavior::Leader(_)) {
            let hint = self.behavior.leader_id(&self.ctx);
            self.coordinator.on_leadership_lost(hint);
            self.fail_pending(|| RaftError::ProposalDropped.into());
        }
        if let Behavior::Leader(leader) = &mut self.behavior {
            leader.post_transition(&mut self.ctx).await?;
        }
        Ok(())
    }

    /// Work that follows every handled event: leader event drain, server-change
    /// progress, proposal completion, transfer resolution.
    async fn post_process(&mut self) -> Result<()> {
        if let Behavior::Leader(leader) = &mut self.behavior {
            for event in std::mem::take(&mut leader.events) {
                match event {
                    LeaderEvent::SnapshotInstalled(member) => {
                        self.coordinator
                            .on_snapshot_installed(&mut self.ctx, leader, &member)
                            .await?;
                    }
                    LeaderEvent::TimeoutNowSent(member) => {
                        debug!(member = %self.ctx.id, target = %member, "prompted transfer target");
                    }
                }
            }

            match self
                .coordinator
                .on_commit_advanced(&mut self.ctx, leader)
                .await?
            {
                PostCommit::None => {}
                PostCommit::SelfRemoved => {
                    info!(member = %self.ctx.id, "removed from cluster, stepping down");
                    if let Behavior::Leader(leader) = &self.behavior {
                        leader.prompt_successor(&self.ctx);
                    }
                    let follower = Behavior::Follower(Follower::new(&self.ctx));
                    self.install_behavior(follower).await?;
                }
                PostCommit::LeaderDemoted => {
                    if let Behavior::Leader(leader) = &mut self.behavior {
                        if let Some(target) = leader.best_transfer_target(&self.ctx) {
                            info!(member = %self.ctx.id, target = %target,
                                "demoted to non-voting, transferring leadership");
                            leader.request_transfer(&self.ctx, &target)?;
                        }
                    }
                }
            }
        }

        self.complete_proposals();
        self.resolve_transfer();
        Ok(())
    }

    fn complete_proposals(&mut self) {
        let last_applied = self.ctx.log.last_applied();
        let mut remaining = Vec::with_capacity(self.pending.len());
        for proposal in self.pending.drain(..) {
            if proposal.index > last_applied {
                remaining.push(proposal);
                continue;
            }
            // A different term at the index means the entry was overwritten by another
            // leader before committing.
            let outcome = match self.ctx.log.term_of(proposal.index) {
                Some(term) if term != proposal.term => Err(RaftError::ProposalDropped.into()),
                _ => Ok(ProposalResult {
                    index: proposal.index,
                    term: proposal.term,
                }),
            };
            let _ = proposal.reply.send(outcome);
        }
        self.pending = remaining;
    }

    fn resolve_transfer(&mut self) {
        let Some(transfer) = &self.transfer else {
            return;
        };

        let current_leader = self.behavior.leader_id(&self.ctx);
        if current_leader.as_ref() == Some(&transfer.target) {
            let transfer = self.transfer.take().expect("checked above");
            info!(member = %self.ctx.id, target = %transfer.target, "leadership transfer complete");
            let _ = transfer.reply.send(Ok(()));
            return;
        }
        if Instant::now() >= transfer.deadline {
            let transfer = self.transfer.take().expect("checked above");
            warn!(member = %self.ctx.id, target = %transfer.target, "leadership transfer timed out");
            let _ = transfer.reply.send(Err(RaftError::LeadershipTransferFailed(
                format!("{} did not take over in time", transfer.target),
            )
            .into()));
        }
    }

    fn fail_pending(&mut self, error: impl Fn() -> Error) {
        for proposal in self.pending.drain(..) {
            let _ = proposal.reply.send(Err(error()));
        }
    }

    fn on_demand_state(&self) -> OnDemandRaftState {
        let ctx = &self.ctx;
        let mut peer_addresses = HashMap::new();
        let mut peer_voting_states = HashMap::new();
        for peer in ctx.peers.values() {
            peer_addresses.insert(
                peer.name.to_string(),
                peer.address.clone().unwrap_or_default(),
            );
            peer_voting_states.insert(peer.name.to_string(), peer.is_voting());
        }

        let mut state = OnDemandRaftState {
            current_term: ctx.current_term(),
            commit_index: ctx.log.commit_index(),
            last_applied: ctx.log.last_applied(),
            last_log_index: ctx.log.last_index(),
            last_log_term: ctx.log.last_term(),
            snapshot_index: ctx.log.snapshot_index(),
            snapshot_term: ctx.log.snapshot_term(),
            replicated_to_all_index: 0,
            in_memory_journal_log_size: ctx.log.len(),
            in_memory_journal_data_size: ctx.log.data_size(),
            voted_for: ctx.term_info.voted_for.clone(),
            leader: self.behavior.leader_id(ctx),
            raft_state: Some(self.behavior.role()),
            is_voting: ctx.voting_member,
            is_snapshot_capture_initiated: ctx.snapshots.is_capturing(),
            peer_addresses,
            peer_voting_states,
            follower_info_list: Vec::new(),
        };

        if let Behavior::Leader(leader) = &self.behavior {
            state.replicated_to_all_index = leader.replicated_to_all(ctx);
            let election_timeout = ctx.config.election_timeout();
            state.follower_info_list = leader
                .followers()
                .map(|f| FollowerInfo {
                    id: f.name.clone(),
                    next_index: f.next_index,
                    match_index: f.match_index,
                    active: f.is_active(election_timeout),
                    time_since_last_activity: format_activity_age(f.activity_age()),
                    voting: ctx.peers.get(&f.name).map(|p| p.is_voting()).unwrap_or(false),
                })
                .collect();
        }
        state
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("id", &self.id).finish()
    }
}
