//! Testing utilities: an in-process cluster harness and a small KV state machine.

mod raft_integration_tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::access::MemberName;
use crate::config::RaftConfig;
use crate::error::Result;
use crate::network::LocalNetwork;
use crate::node::{NodeHandle, RaftNode};
use crate::state_machine::StateMachine;
use crate::types::{LogIndex, PeerInfo, Term};

/// Commands understood by [`KvStateMachine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    /// Insert or update a key.
    Put { key: String, value: String },

    /// Remove a key.
    Delete { key: String },
}

impl KvCommand {
    /// Encode a put command.
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Bytes {
        let cmd = KvCommand::Put {
            key: key.into(),
            value: value.into(),
        };
        Bytes::from(bincode::serialize(&cmd).expect("serializable"))
    }

    /// Encode a delete command.
    pub fn delete(key: impl Into<String>) -> Bytes {
        let cmd = KvCommand::Delete { key: key.into() };
        Bytes::from(bincode::serialize(&cmd).expect("serializable"))
    }
}

/// A replicated string map used to observe applied state in tests.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    map: RwLock<BTreeMap<String, String>>,
}

impl KvStateMachine {
    /// Create an empty state machine.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Read a key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[async_trait]
impl StateMachine for KvStateMachine {
    async fn apply(&self, index: LogIndex, _term: Term, data: &Bytes) {
        match bincode::deserialize::<KvCommand>(data) {
            Ok(KvCommand::Put { key, value }) => {
                self.map.write().insert(key, value);
            }
            Ok(KvCommand::Delete { key }) => {
                self.map.write().remove(&key);
            }
            Err(e) => {
                // Commands are validated before proposing; this is a test-harness bug.
                error!(index, error = %e, "undecodable command");
            }
        }
    }

    async fn take_snapshot(&self) -> Result<Bytes> {
        let map = self.map.read().clone();
        Ok(Bytes::from(bincode::serialize(&map)?))
    }

    async fn install_snapshot(&self, state: Bytes) -> Result<()> {
        let map: BTreeMap<String, String> = bincode::deserialize(&state)?;
        *self.map.write() = map;
        Ok(())
    }
}

/// One member of a [`TestCluster`].
pub struct TestNode {
    /// Member name.
    pub name: MemberName,

    /// Node handle.
    pub handle: NodeHandle,

    /// The node's state machine, for observing applied commands.
    pub sm: Arc<KvStateMachine>,
}

/// An in-process cluster over a [`LocalNetwork`].
pub struct TestCluster {
    /// The shared network; sever links to simulate partitions.
    pub network: Arc<LocalNetwork>,

    /// Cluster members, in start order.
    pub nodes: Vec<TestNode>,

    config: RaftConfig,
}

/// A configuration with timings tightened for in-process tests.
pub fn fast_config() -> RaftConfig {
    RaftConfig::new()
        .with_heartbeat_interval(Duration::from_millis(25))
        .with_election_timeout_factor(8)
        .with_isolated_check_interval(Duration::from_millis(200))
        .with_server_change_timeout(Duration::from_secs(10))
}

impl TestCluster {
    /// Start `count` voting members.
    pub async fn start(count: usize) -> Result<Self> {
        let voting = vec![true; count];
        Self::start_with(fast_config(), &voting).await
    }

    /// Start one member per entry in `voting`, with the given voting flags.
    pub async fn start_with(config: RaftConfig, voting: &[bool]) -> Result<Self> {
        let network = LocalNetwork::new();
        let names: Vec<MemberName> = (1..=voting.len())
            .map(|i| MemberName::new(format!("n{i}")))
            .collect();

        let mut nodes = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let peers: Vec<PeerInfo> = names
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, peer)| {
                    if voting[j] {
                        PeerInfo::voting(peer.clone(), format!("local://{peer}"))
                    } else {
                        PeerInfo::non_voting(peer.clone(), format!("local://{peer}"))
                    }
                })
                .collect();

            let node = spawn_member(&network, name.clone(), config.clone(), peers, voting[i]).await?;
            nodes.push(node);
        }

        Ok(Self {
            network,
            nodes,
            config,
        })
    }

    /// Start an additional member with no peers, for AddServer scenarios.
    pub async fn start_joiner(&mut self, name: impl AsRef<str>, voting: bool) -> Result<&TestNode> {
        let name = MemberName::new(name.as_ref());
        let node = spawn_member(
            &self.network,
            name,
            self.config.clone(),
            Vec::new(),
            voting,
        )
        .await?;
        self.nodes.push(node);
        Ok(self.nodes.last().expect("just pushed"))
    }

    /// The node with the given name.
    pub fn node(&self, name: &str) -> &TestNode {
        let name = MemberName::new(name);
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .expect("unknown test node")
    }

    /// Wait until exactly one member reports itself as leader, and return it.
    pub async fn wait_for_leader(&self, timeout: Duration) -> &TestNode {
        let deadline = Instant::now() + timeout;
        loop {
            let mut leaders = Vec::new();
            for node in &self.nodes {
                if let Ok(state) = node.handle.raft_state().await {
                    if state.raft_state.map(|r| r.is_leader()).unwrap_or(false) {
                        leaders.push(node);
                    }
                }
            }
            if leaders.len() == 1 {
                return leaders[0];
            }
            if Instant::now() >= deadline {
                panic!("no unique leader within {timeout:?}: {} leaders", leaders.len());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until `check` passes or panic after `timeout`.
    pub async fn wait_until<F>(&self, timeout: Duration, message: &str, mut check: F)
    where
        F: FnMut() -> bool,
    {
        if !wait_for(timeout, &mut check).await {
            panic!("condition not reached within {timeout:?}: {message}");
        }
    }
}

async fn spawn_member(
    network: &Arc<LocalNetwork>,
    name: MemberName,
    config: RaftConfig,
    peers: Vec<PeerInfo>,
    voting: bool,
) -> Result<TestNode> {
    let (transport, inbound) = network.join(name.clone());
    let sm = KvStateMachine::new();
    let handle = RaftNode::spawn(
        name.clone(),
        config,
        peers,
        voting,
        sm.clone(),
        Arc::new(transport),
        inbound,
    )
    .await?;
    Ok(TestNode { name, handle, sm })
}

/// Poll `check` until it passes or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, check: &mut F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kv_state_machine_roundtrip() {
        let sm = KvStateMachine::new();
        sm.apply(1, 1, &KvCommand::put("a", "1")).await;
        sm.apply(2, 1, &KvCommand::put("b", "2")).await;
        sm.apply(3, 1, &KvCommand::delete("a")).await;

        assert_eq!(sm.get("a"), None);
        assert_eq!(sm.get("b"), Some("2".into()));

        let snapshot = sm.take_snapshot().await.unwrap();
        let restored = KvStateMachine::new();
        restored.install_snapshot(snapshot).await.unwrap();
        assert_eq!(restored.get("b"), Some("2".into()));
        assert_eq!(restored.len(), 1);
    }
}
