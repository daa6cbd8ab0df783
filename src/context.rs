//! Shared per-node state operated on by the behavior state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::access::{AbiVersion, MemberName};
use crate::config::RaftConfig;
use crate::error::Result;
use crate::journal::{EntryJournal, TermInfo, TermInfoStore};
use crate::log::{LogEntry, Payload, ReplicatedLog};
use crate::messages::RaftRpc;
use crate::metrics::RaftMetrics;
use crate::network::{Envelope, Transport};
use crate::snapshot::SnapshotManager;
use crate::state_machine::StateMachine;
use crate::types::{LogIndex, PeerInfo, ServerConfig, ServerInfo, Term, VotingState};

/// Everything a behavior needs to make protocol decisions on behalf of one member.
pub(crate) struct RaftContext {
    /// This member's name.
    pub id: MemberName,

    /// Protocol configuration.
    pub config: RaftConfig,

    /// Current term and vote, mirrored to stable storage.
    pub term_info: TermInfo,

    /// The replicated log.
    pub log: ReplicatedLog,

    /// Known peers, excluding this member.
    pub peers: HashMap<MemberName, PeerInfo>,

    /// Whether this member votes.
    pub voting_member: bool,

    /// Durable entry journal, absent in memory-only mode.
    pub journal: Option<EntryJournal>,

    /// Durable term-info store, absent in memory-only mode.
    pub term_store: Option<TermInfoStore>,

    /// Snapshot lifecycle.
    pub snapshots: SnapshotManager,

    /// The replicated state machine.
    pub state_machine: Arc<dyn StateMachine>,

    /// Outbound transport.
    pub transport: Arc<dyn Transport>,

    /// Metrics registry.
    pub metrics: Arc<RaftMetrics>,

    /// Last wire version advertised by each peer.
    pub peer_versions: HashMap<MemberName, AbiVersion>,
}

impl RaftContext {
    /// Current term.
    pub fn current_term(&self) -> Term {
        self.term_info.term
    }

    /// Send an RPC to a peer at the negotiated wire version.
    pub fn send(&self, to: &MemberName, rpc: RaftRpc) {
        let version = self
            .peer_versions
            .get(to)
            .copied()
            .unwrap_or(AbiVersion::CURRENT)
            .negotiate(AbiVersion::CURRENT);
        self.transport.send(
            to,
            Envelope {
                from: self.id.clone(),
                from_address: self.transport.local_address(),
                version,
                rpc,
            },
        );
    }

    /// Record the wire version a peer advertised.
    pub fn note_peer_version(&mut self, peer: &MemberName, version: AbiVersion) {
        self.peer_versions.insert(peer.clone(), version);
    }

    /// Durably adopt new term info. The write completes before the in-memory state
    /// changes, so a vote can never be forgotten by a crash.
    pub fn persist_term_info(&mut self, info: TermInfo) -> Result<()> {
        if let Some(store) = &self.term_store {
            store.store(&info)?;
        }
        self.term_info = info;
        Ok(())
    }

    /// Votes needed for a majority among voting members, including this one if voting.
    pub fn majority(&self) -> usize {
        let voters = self.voting_peer_count() + usize::from(self.voting_member);
        voters / 2 + 1
    }

    /// Number of voting peers.
    pub fn voting_peer_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_voting()).count()
    }

    /// Append a locally created entry, journaling it first.
    pub fn append_local(&mut self, payload: Payload) -> Result<LogIndex> {
        let index = self.log.last_index() + 1;
        let entry = LogEntry::new(index, self.current_term(), payload);
        if let Some(journal) = &mut self.journal {
            journal.append(&entry)?;
        }
        if let Payload::VotingConfig(config) = &entry.payload {
            let config = config.clone();
            self.log.append(entry)?;
            self.apply_server_config(&config);
        } else {
            self.log.append(entry)?;
        }
        self.metrics.add_entries_appended(1);
        Ok(index)
    }

    /// Store entries received from the leader: truncate the journal where the log was
    /// truncated, journal the additions, and apply any voting configuration.
    pub fn store_received(&mut self, prev_last_index: LogIndex, added: &[LogEntry]) -> Result<()> {
        let Some(first) = added.first() else {
            return Ok(());
        };
        if let Some(journal) = &mut self.journal {
            if first.index <= prev_last_index {
                journal.truncate_from(first.index)?;
            }
            for entry in added {
                journal.append(entry)?;
            }
        }
        self.metrics.add_entries_appended(added.len() as u64);
        for entry in added {
            if let Payload::VotingConfig(config) = &entry.payload {
                info!(index = entry.index, "applying replicated voting configuration");
                let config = config.clone();
                self.apply_server_config(&config);
            }
        }
        Ok(())
    }

    /// Apply committed entries to the state machine, up to the commit index.
    pub async fn apply_committed(&mut self) -> u64 {
        let mut applied = 0u64;
        while self.log.last_applied() < self.log.commit_index() {
            let next = self.log.last_applied() + 1;
            let Some(entry) = self.log.get(next) else {
                warn!(index = next, "committed entry missing from log");
                break;
            };
            let (term, data) = (entry.term, entry.payload.clone());
            if let Payload::Data(data) = data {
                self.state_machine.apply(next, term, &data).await;
            }
            self.log.set_last_applied(next);
            applied += 1;
        }
        if applied > 0 {
            self.metrics.add_entries_applied(applied);
            self.metrics.set_last_applied(self.log.last_applied());
        }
        self.metrics.set_commit_index(self.log.commit_index());
        applied
    }

    /// Replace the peer table with a replicated configuration.
    pub fn apply_server_config(&mut self, config: &ServerConfig) {
        if !config.servers.iter().any(|s| s.name == self.id) {
            // We were removed from the cluster; stop participating in elections.
            self.voting_member = false;
        }
        let mut seen = Vec::new();
        for server in &config.servers {
            if server.name == self.id {
                self.voting_member = server.voting;
                continue;
            }
            seen.push(server.name.clone());
            match self.peers.get_mut(&server.name) {
                Some(peer) => {
                    peer.voting_state = if server.voting {
                        VotingState::Voting
                    } else {
                        VotingState::NonVoting
                    };
                }
                None => {
                    self.peers.insert(
                        server.name.clone(),
                        PeerInfo {
                            name: server.name.clone(),
                            address: None,
                            voting_state: if server.voting {
                                VotingState::Voting
                            } else {
                                VotingState::NonVoting
                            },
                        },
                    );
                }
            }
        }
        let removed: Vec<MemberName> = self
            .peers
            .keys()
            .filter(|name| !seen.contains(name))
            .cloned()
            .collect();
        for name in removed {
            debug!(peer = %name, "removing peer absent from voting configuration");
            self.peers.remove(&name);
            self.transport.remove_peer(&name);
        }
    }

    /// The current configuration as it would be replicated.
    pub fn server_config(&self) -> ServerConfig {
        let mut servers = vec![ServerInfo::new(self.id.clone(), self.voting_member)];
        servers.extend(
            self.peers
                .values()
                .map(|p| ServerInfo::new(p.name.clone(), p.is_voting())),
        );
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        ServerConfig::new(servers)
    }

    /// Register a peer's address with the peer table and the transport.
    pub fn set_peer_address(&mut self, peer: &MemberName, address: String) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.address = Some(address.clone());
        }
        self.transport.set_peer_address(peer.clone(), address);
    }

    /// Whether a candidate's log is at least as up-to-date as ours (§5.4.1).
    pub fn candidate_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        last_log_term > self.log.last_term()
            || (last_log_term == self.log.last_term() && last_log_index >= self.log.last_index())
    }

    /// Election timeout with per-round random variance.
    pub fn randomized_election_timeout(&self) -> Duration {
        let base = self.config.election_timeout();
        let variance = rand::thread_rng().gen_range(Duration::ZERO..=base / 2);
        base + variance
    }

    /// Capture, persist and commit a snapshot if the log has grown past a trigger.
    pub async fn maybe_capture_snapshot(&mut self) -> Result<()> {
        if !self.snapshots.should_capture(&self.log) {
            return Ok(());
        }
        self.capture_snapshot().await.map(|_| ())
    }

    /// Capture, persist and commit a snapshot unconditionally.
    pub async fn capture_snapshot(&mut self) -> Result<crate::snapshot::Snapshot> {
        if !self.snapshots.begin_capture() {
            return Err(crate::error::RaftError::SnapshotFailed(
                "capture already in progress".into(),
            )
            .into());
        }
        let result = async {
            let state = self.state_machine.take_snapshot().await?;
            let snapshot = self.snapshots.build(
                &self.log,
                state,
                self.term_info.clone(),
                Some(self.server_config()),
            );
            self.snapshots
                .persist_and_commit(&snapshot, &mut self.log, self.journal.as_mut())?;
            self.metrics.incr_snapshots_captured();
            Ok(snapshot)
        }
        .await;
        self.snapshots.end_capture();
        result
    }
}
