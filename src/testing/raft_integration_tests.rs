#![cfg(test)]

//! Cluster-level integration tests over the in-process transport.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, RaftError};
use crate::messages::admin::{
    AddServer, ChangeServersVotingStatus, RemoveServer, ServerChangeStatus,
};
use crate::messages::client::RequestLeadership;
use crate::testing::{fast_config, KvCommand, TestCluster};
use crate::types::RaftRole;

const LEADER_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn test_elects_single_leader() {
    let cluster = TestCluster::start(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;

    let state = leader.handle.raft_state().await.unwrap();
    assert!(state.raft_state.unwrap().is_leader());
    assert!(state.current_term >= 1);
    assert_eq!(state.peer_addresses.len(), 2);
}

#[tokio::test]
async fn test_replicates_to_all_members() {
    let cluster = TestCluster::start(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;

    let result = leader.handle.propose(KvCommand::put("city", "antwerp")).await.unwrap();
    assert!(result.index >= 1);

    cluster
        .wait_until(SETTLE_TIMEOUT, "value on all members", || {
            cluster
                .nodes
                .iter()
                .all(|n| n.sm.get("city") == Some("antwerp".into()))
        })
        .await;
}

#[tokio::test]
async fn test_follower_rejects_proposals_with_leader_hint() {
    let cluster = TestCluster::start(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;
    let leader_name = leader.name.clone();

    let follower = cluster
        .nodes
        .iter()
        .find(|n| n.name != leader_name)
        .unwrap();

    // The follower may take a heartbeat or two to learn the leader.
    let deadline = std::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        match follower.handle.propose(KvCommand::put("k", "v")).await {
            Err(Error::Raft(RaftError::NotLeader { leader: Some(hint) }))
                if hint == leader_name =>
            {
                break;
            }
            Err(Error::Raft(RaftError::NotLeader { .. })) => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "follower never learned the leader hint"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => panic!("expected NotLeader, got {:?}", other.map(|_| ())),
        }
    }
}

#[tokio::test]
async fn test_leader_failover() {
    let cluster = TestCluster::start(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;
    let old_leader = leader.name.clone();

    leader.handle.propose(KvCommand::put("k1", "v1")).await.unwrap();
    leader.handle.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A survivor takes over and keeps serving writes.
    let deadline = std::time::Instant::now() + SETTLE_TIMEOUT;
    let new_leader = loop {
        let mut found = None;
        for node in cluster.nodes.iter().filter(|n| n.name != old_leader) {
            if let Ok(state) = node.handle.raft_state().await {
                if state.raft_state == Some(RaftRole::Leader) {
                    found = Some(node);
                    break;
                }
            }
        }
        if let Some(node) = found {
            break node;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no new leader after failover"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_ne!(new_leader.name, old_leader);

    new_leader.handle.propose(KvCommand::put("k2", "v2")).await.unwrap();
    assert_eq!(new_leader.sm.get("k1"), Some("v1".into()));
    assert_eq!(new_leader.sm.get("k2"), Some("v2".into()));
}

#[tokio::test]
async fn test_snapshot_install_catches_up_lagging_follower() {
    let config = fast_config()
        .with_snapshot_batch_count(5)
        .with_maximum_message_slice_size(64);
    // n3 is non-voting so its isolation causes no term churn.
    let cluster = TestCluster::start_with(config, &[true, true, false]).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;

    cluster.network.isolate(&cluster.node("n3").name);

    for i in 0..20 {
        leader
            .handle
            .propose(KvCommand::put(format!("key{i}"), "x".repeat(100)))
            .await
            .unwrap();
    }

    // The leader trims its log past the isolated follower's position.
    let leader_handle = leader.handle.clone();
    cluster
        .wait_until(SETTLE_TIMEOUT, "leader snapshot taken", || {
            leader_handle.metrics().snapshots_captured >= 1
        })
        .await;

    cluster.network.heal();

    let n3 = cluster.node("n3");
    cluster
        .wait_until(SETTLE_TIMEOUT, "follower caught up via snapshot", || {
            n3.sm.len() >= 20 && n3.handle.metrics().snapshots_installed >= 1
        })
        .await;

    // The transfer was actually chunked.
    assert!(leader.handle.metrics().snapshot_chunks_sent > 1);
}

#[tokio::test]
async fn test_add_server() {
    let mut cluster = TestCluster::start(2).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;
    let leader_handle = leader.handle.clone();

    leader_handle.propose(KvCommand::put("seed", "1")).await.unwrap();

    // The joiner starts outside any configuration; AddServer brings it in.
    cluster.start_joiner("n3", false).await.unwrap();
    let reply = leader_handle
        .add_server(AddServer {
            server: "n3".into(),
            address: "local://n3".into(),
            voting: true,
        })
        .await
        .unwrap();
    assert_eq!(reply.status, ServerChangeStatus::Ok);

    let state = leader_handle.raft_state().await.unwrap();
    assert_eq!(state.peer_voting_states.get("n3"), Some(&true));

    leader_handle.propose(KvCommand::put("after", "2")).await.unwrap();
    let n3 = cluster.node("n3");
    cluster
        .wait_until(SETTLE_TIMEOUT, "joiner replicates", || {
            n3.sm.get("seed") == Some("1".into()) && n3.sm.get("after") == Some("2".into())
        })
        .await;

    // Adding it again is rejected.
    let reply = leader_handle
        .add_server(AddServer {
            server: "n3".into(),
            address: "local://n3".into(),
            voting: true,
        })
        .await
        .unwrap();
    assert_eq!(reply.status, ServerChangeStatus::AlreadyExists);
}

#[tokio::test]
async fn test_remove_server() {
    let cluster = TestCluster::start_with(fast_config(), &[true, true, false])
        .await
        .unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;

    let reply = leader
        .handle
        .remove_server(RemoveServer { server: "n3".into() })
        .await
        .unwrap();
    assert_eq!(reply.status, ServerChangeStatus::Ok);

    let state = leader.handle.raft_state().await.unwrap();
    assert!(!state.peer_addresses.contains_key("n3"));

    let reply = leader
        .handle
        .remove_server(RemoveServer { server: "n9".into() })
        .await
        .unwrap();
    assert_eq!(reply.status, ServerChangeStatus::DoesNotExist);
}

#[tokio::test]
async fn test_change_servers_voting_status() {
    let cluster = TestCluster::start(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;
    let leader_name = leader.name.clone();

    let demoted = cluster
        .nodes
        .iter()
        .find(|n| n.name != leader_name)
        .unwrap();

    let reply = leader
        .handle
        .change_servers_voting_status(ChangeServersVotingStatus {
            changes: BTreeMap::from([(demoted.name.clone(), false)]),
        })
        .await
        .unwrap();
    assert_eq!(reply.status, ServerChangeStatus::Ok);

    let state = leader.handle.raft_state().await.unwrap();
    assert_eq!(
        state.peer_voting_states.get(demoted.name.as_str()),
        Some(&false)
    );

    let demoted_handle = demoted.handle.clone();
    let deadline = std::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let state = demoted_handle.raft_state().await.unwrap();
        if !state.is_voting {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "voting flag never arrived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Demoting everyone is structurally invalid.
    let all_off: BTreeMap<_, _> = cluster
        .nodes
        .iter()
        .map(|n| (n.name.clone(), false))
        .collect();
    let reply = leader
        .handle
        .change_servers_voting_status(ChangeServersVotingStatus { changes: all_off })
        .await
        .unwrap();
    assert_eq!(reply.status, ServerChangeStatus::InvalidRequest);
}

#[tokio::test]
async fn test_leadership_transfer() {
    let cluster = TestCluster::start(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;
    let leader_name = leader.name.clone();

    let target = cluster
        .nodes
        .iter()
        .find(|n| n.name != leader_name)
        .unwrap();

    leader
        .handle
        .request_leadership(RequestLeadership {
            leader_to_be: target.name.clone(),
        })
        .await
        .unwrap();

    let target_handle = target.handle.clone();
    let deadline = std::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let state = target_handle.raft_state().await.unwrap();
        if state.raft_state.map(|r| r.is_leader()).unwrap_or(false) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "target never took over");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    target.handle.propose(KvCommand::put("post", "transfer")).await.unwrap();
}

#[tokio::test]
async fn test_find_leader_and_on_demand_state() {
    let cluster = TestCluster::start(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;
    let leader_name = leader.name.clone();

    leader.handle.propose(KvCommand::put("a", "b")).await.unwrap();

    let state = leader.handle.raft_state().await.unwrap();
    assert_eq!(state.leader, Some(leader_name.clone()));
    assert!(state.commit_index >= 1);
    assert_eq!(state.last_applied, state.commit_index);
    assert!(state.is_voting);
    assert_eq!(state.follower_info_list.len(), 2);
    for info in &state.follower_info_list {
        assert!(info.voting);
    }

    // Followers report the same leader.
    let deadline = std::time::Instant::now() + SETTLE_TIMEOUT;
    for node in cluster.nodes.iter().filter(|n| n.name != leader_name) {
        loop {
            let reply = node.handle.find_leader().await.unwrap();
            if reply.leader == Some(leader_name.clone()) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "follower never saw leader");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[tokio::test]
async fn test_get_snapshot_on_demand() {
    let cluster = TestCluster::start(1).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;

    for i in 0..3 {
        leader
            .handle
            .propose(KvCommand::put(format!("k{i}"), format!("v{i}")))
            .await
            .unwrap();
    }

    let reply = leader.handle.get_snapshot().await.unwrap();
    assert_eq!(reply.member, leader.name);
    assert!(reply.snapshot.last_applied_index >= 3);

    let map: BTreeMap<String, String> = bincode::deserialize(&reply.snapshot.state).unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map.get("k0"), Some(&"v0".to_string()));
    assert!(reply.snapshot.server_config.is_some());
}

#[tokio::test]
async fn test_restart_recovers_from_journal() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config().with_storage_dir(dir.path().join("n1"));
    let cluster = TestCluster::start_with(config.clone(), &[true]).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;

    for i in 0..5 {
        leader
            .handle
            .propose(KvCommand::put(format!("k{i}"), format!("v{i}")))
            .await
            .unwrap();
    }
    leader.handle.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Same storage directory, fresh process state.
    let restarted = TestCluster::start_with(config, &[true]).await.unwrap();
    let leader = restarted.wait_for_leader(LEADER_TIMEOUT).await;

    let sm = leader.sm.clone();
    restarted
        .wait_until(SETTLE_TIMEOUT, "journal replayed into state machine", || {
            sm.len() == 5 && sm.get("k4") == Some("v4".into())
        })
        .await;

    let state = leader.handle.raft_state().await.unwrap();
    assert!(state.current_term >= 2);
    assert!(state.last_log_index >= 5);
}
