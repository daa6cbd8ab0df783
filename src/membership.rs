//! Dynamic cluster membership: AddServer, RemoveServer, ChangeServersVotingStatus.
//!
//! One change runs at a time; requests arriving while one is in flight queue behind it.
//! A voting joiner is first caught up with a snapshot while it carries the
//! `VotingNotInitialized` state, and only then is the new configuration replicated.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::access::MemberName;
use crate::behavior::Leader;
use crate::context::RaftContext;
use crate::error::Result;
use crate::log::Payload;
use crate::messages::admin::{
    AddServer, ChangeServersVotingStatus, RemoveServer, ServerChangeReply, ServerChangeStatus,
};
use crate::types::{LogIndex, PeerInfo, ServerConfig, ServerInfo, VotingState};

/// A membership change request.
#[derive(Debug)]
pub(crate) enum ChangeOp {
    Add(AddServer),
    Remove(RemoveServer),
    ChangeVoting(ChangeServersVotingStatus),
}

/// What the node must do after a change commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PostCommit {
    /// Nothing further.
    None,

    /// The local member was removed from the cluster.
    SelfRemoved,

    /// The local leader was voted out of the voting set; hand leadership off.
    LeaderDemoted,
}

#[derive(Debug)]
enum Stage {
    /// Waiting for the catch-up snapshot to finish installing on the joiner.
    InstallingSnapshot { server: MemberName },

    /// Waiting for the new configuration to commit.
    AwaitingCommit { index: LogIndex, post: PostCommit },
}

struct PendingChange {
    op_name: &'static str,
    stage: Stage,
    deadline: Instant,
    reply: oneshot::Sender<ServerChangeReply>,
}

/// Serializes server-change operations on the leader.
#[derive(Default)]
pub(crate) struct ServerChangeCoordinator {
    current: Option<PendingChange>,
    queue: VecDeque<(ChangeOp, oneshot::Sender<ServerChangeReply>)>,
}

impl ServerChangeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a change is currently in flight.
    pub fn busy(&self) -> bool {
        self.current.is_some()
    }

    /// Submit a change on the leader. Queues if one is already in flight.
    pub async fn submit(
        &mut self,
        ctx: &mut RaftContext,
        leader: &mut Leader,
        op: ChangeOp,
        reply: oneshot::Sender<ServerChangeReply>,
    ) -> Result<()> {
        if self.busy() {
            info!(member = %ctx.id, "server change already in flight, queueing request");
        }
        self.queue.push_back((op, reply));
        self.drive(ctx, leader).await
    }

    /// Start queued changes until one is left in flight or the queue drains.
    /// Validation failures reply immediately without occupying the slot.
    async fn drive(&mut self, ctx: &mut RaftContext, leader: &mut Leader) -> Result<()> {
        while !self.busy() {
            let Some((op, reply)) = self.queue.pop_front() else {
                break;
            };
            self.start(ctx, leader, op, reply).await?;
        }
        Ok(())
    }

    async fn start(
        &mut self,
        ctx: &mut RaftContext,
        leader: &mut Leader,
        op: ChangeOp,
        reply: oneshot::Sender<ServerChangeReply>,
    ) -> Result<()> {
        let deadline = Instant::now() + ctx.config.server_change_timeout;
        match op {
            ChangeOp::Add(req) => self.start_add(ctx, leader, req, reply, deadline).await,
            ChangeOp::Remove(req) => self.start_remove(ctx, leader, req, reply, deadline).await,
            ChangeOp::ChangeVoting(req) => {
                self.start_change_voting(ctx, leader, req, reply, deadline)
                    .await
            }
        }
    }

    async fn start_add(
        &mut self,
        ctx: &mut RaftContext,
        leader: &mut Leader,
        req: AddServer,
        reply: oneshot::Sender<ServerChangeReply>,
        deadline: Instant,
    ) -> Result<()> {
        if req.server == ctx.id || ctx.peers.contains_key(&req.server) {
            let _ = reply.send(ServerChangeReply::failed(ServerChangeStatus::AlreadyExists));
            return Ok(());
        }

        info!(member = %ctx.id, server = %req.server, voting = req.voting, "adding server");
        let voting_state = if req.voting {
            VotingState::VotingNotInitialized
        } else {
            VotingState::NonVoting
        };
        ctx.peers.insert(
            req.server.clone(),
            PeerInfo {
                name: req.server.clone(),
                address: Some(req.address.clone()),
                voting_state,
            },
        );
        ctx.set_peer_address(&req.server, req.address.clone());
        leader.sync_followers(ctx);

        if req.voting {
            // Catch the joiner up before it can influence elections.
            leader.initiate_capture_to_install(ctx, &req.server).await?;
            self.current = Some(PendingChange {
                op_name: "AddServer",
                stage: Stage::InstallingSnapshot {
                    server: req.server.clone(),
                },
                deadline,
                reply,
            });
        } else {
            let index = ctx.append_local(Payload::VotingConfig(ctx.server_config()))?;
            leader.replicate(ctx).await?;
            self.current = Some(PendingChange {
                op_name: "AddServer",
                stage: Stage::AwaitingCommit {
                    index,
                    post: PostCommit::None,
                },
                deadline,
                reply,
            });
        }
        Ok(())
    }

    async fn start_remove(
        &mut self,
        ctx: &mut RaftContext,
        leader: &mut Leader,
        req: RemoveServer,
        reply: oneshot::Sender<ServerChangeReply>,
        deadline: Instant,
    ) -> Result<()> {
        let removing_self = req.server == ctx.id;
        if !removing_self && !ctx.peers.contains_key(&req.server) {
            let _ = reply.send(ServerChangeReply::failed(ServerChangeStatus::DoesNotExist));
            return Ok(());
        }

        let config = ServerConfig::new(
            ctx.server_config()
                .servers
                .into_iter()
                .filter(|s| s.name != req.server)
                .collect(),
        );
        if config.voting_count() == 0 {
            let _ = reply.send(ServerChangeReply::failed(ServerChangeStatus::InvalidRequest));
            return Ok(());
        }

        info!(member = %ctx.id, server = %req.server, removing_self, "removing server");
        let index = ctx.append_local(Payload::VotingConfig(config))?;
        leader.sync_followers(ctx);
        leader.replicate(ctx).await?;
        self.current = Some(PendingChange {
            op_name: "RemoveServer",
            stage: Stage::AwaitingCommit {
                index,
                post: if removing_self {
                    PostCommit::SelfRemoved
                } else {
                    PostCommit::None
                },
            },
            deadline,
            reply,
        });
        Ok(())
    }

    async fn start_change_voting(
        &mut self,
        ctx: &mut RaftContext,
        leader: &mut Leader,
        req: ChangeServersVotingStatus,
        reply: oneshot::Sender<ServerChangeReply>,
        deadline: Instant,
    ) -> Result<()> {
        for name in req.changes.keys() {
            if name != &ctx.id && !ctx.peers.contains_key(name) {
                let _ = reply.send(ServerChangeReply::failed(ServerChangeStatus::DoesNotExist));
                return Ok(());
            }
        }

        let servers: Vec<ServerInfo> = ctx
            .server_config()
            .servers
            .into_iter()
            .map(|mut server| {
                if let Some(&voting) = req.changes.get(&server.name) {
                    server.voting = voting;
                }
                server
            })
            .collect();
        let config = ServerConfig::new(servers);
        if config.voting_count() == 0 {
            let _ = reply.send(ServerChangeReply::failed(ServerChangeStatus::InvalidRequest));
            return Ok(());
        }

        let demotes_leader = req.changes.get(&ctx.id) == Some(&false);
        info!(member = %ctx.id, changes = ?req.changes, "changing voting status");
        let index = ctx.append_local(Payload::VotingConfig(config))?;
        leader.replicate(ctx).await?;
        self.current = Some(PendingChange {
            op_name: "ChangeServersVotingStatus",
            stage: Stage::AwaitingCommit {
                index,
                post: if demotes_leader {
                    PostCommit::LeaderDemoted
                } else {
                    PostCommit::None
                },
            },
            deadline,
            reply,
        });
        Ok(())
    }

    /// The catch-up snapshot finished installing on `server`: promote it to a voter and
    /// replicate the new configuration.
    pub async fn on_snapshot_installed(
        &mut self,
        ctx: &mut RaftContext,
        leader: &mut Leader,
        server: &MemberName,
    ) -> Result<()> {
        let matches = matches!(
            self.current.as_ref().map(|c| &c.stage),
            Some(Stage::InstallingSnapshot { server: pending }) if pending == server
        );
        if !matches {
            return Ok(());
        }

        info!(member = %ctx.id, server = %server, "joiner caught up, replicating configuration");
        if let Some(peer) = ctx.peers.get_mut(server) {
            peer.voting_state = VotingState::Voting;
        }
        let index = ctx.append_local(Payload::VotingConfig(ctx.server_config()))?;
        leader.replicate(ctx).await?;
        if let Some(current) = &mut self.current {
            current.stage = Stage::AwaitingCommit {
                index,
                post: PostCommit::None,
            };
        }
        Ok(())
    }

    /// Check whether the in-flight change has committed; completes it if so.
    pub async fn on_commit_advanced(
        &mut self,
        ctx: &mut RaftContext,
        leader: &mut Leader,
    ) -> Result<PostCommit> {
        let committed = match self.current.as_ref().map(|c| &c.stage) {
            Some(Stage::AwaitingCommit { index, .. }) => ctx.log.commit_index() >= *index,
            _ => false,
        };
        if !committed {
            return Ok(PostCommit::None);
        }

        let current = self.current.take().expect("checked above");
        let Stage::AwaitingCommit { post, .. } = current.stage else {
            unreachable!("checked above")
        };
        info!(member = %ctx.id, op = current.op_name, "server change committed");
        let _ = current.reply.send(ServerChangeReply::ok());
        self.drive(ctx, leader).await?;
        Ok(post)
    }

    /// Fail the in-flight change if its deadline passed; queued changes fail with
    /// `PriorRequestConsensusTimeout`.
    pub fn on_tick(&mut self, ctx: &mut RaftContext) {
        let expired = self
            .current
            .as_ref()
            .map(|c| Instant::now() >= c.deadline)
            .unwrap_or(false);
        if !expired {
            return;
        }

        let current = self.current.take().expect("checked above");
        warn!(member = %ctx.id, op = current.op_name, "server change timed out");
        if let Stage::InstallingSnapshot { server } = &current.stage {
            // Roll back the provisional peer; it never made it into a configuration.
            ctx.peers.remove(server);
            ctx.transport.remove_peer(server);
            let _ = current
                .reply
                .send(ServerChangeReply::failed(ServerChangeStatus::SnapshotInstallFailed));
        } else {
            let _ = current
                .reply
                .send(ServerChangeReply::failed(ServerChangeStatus::Timeout));
        }
        for (_, reply) in self.queue.drain(..) {
            let _ = reply.send(ServerChangeReply::failed(
                ServerChangeStatus::PriorRequestConsensusTimeout,
            ));
        }
    }

    /// Fail everything when leadership is lost.
    pub fn on_leadership_lost(&mut self, leader_hint: Option<MemberName>) {
        if let Some(current) = self.current.take() {
            let _ = current
                .reply
                .send(ServerChangeReply::no_leader(leader_hint.clone()));
        }
        for (_, reply) in self.queue.drain(..) {
            let _ = reply.send(ServerChangeReply::no_leader(leader_hint.clone()));
        }
    }
}
