//! Integration tests for failure detection and ring repair.
//!
//! A crashed member is simulated with [`Node::abort`], which drops every
//! connection without telling anyone. Detection is lazy: the ring is only
//! repaired once some exchange with the dead member fails.
//!
//! Verification command: `cargo test --test failure_repair`

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use ringchat::node::{Node, NodeConfig, NodeError, NodeEvent};
use ringchat_proto::identity::{NodeInfo, TopologyInfo};
use ringchat_proto::presence::ConnectionState;

// =============================================================================
// Helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> NodeConfig {
    NodeConfig {
        connect_timeout: Duration::from_secs(1),
        event_buffer: 1024,
        settle_delay: Duration::from_millis(200),
    }
}

fn local(name: &str) -> NodeInfo {
    NodeInfo::new("127.0.0.1", 0, name)
}

async fn ring(names: &[&str]) -> Vec<(Node, mpsc::Receiver<NodeEvent>)> {
    let king = Node::start_new_network(local("king"), test_config())
        .await
        .unwrap();
    let king_info = king.0.info().clone();
    let mut nodes = vec![king];
    for name in names {
        let node = Node::connect_to_remote_king(king_info.clone(), local(name), test_config())
            .await
            .unwrap();
        nodes.push(node);
    }
    nodes
}

fn snapshot(node: &str, left: &str, right: &str) -> TopologyInfo {
    TopologyInfo::new(node, left, right)
}

async fn wait_for_topology(node: &Node, expected: &[TopologyInfo]) -> Vec<TopologyInfo> {
    let deadline = Instant::now() + WAIT;
    loop {
        let topology = node.get_topology_info().await.unwrap_or_default();
        if topology == expected || Instant::now() > deadline {
            return topology;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn saw_offline(rx: &mut mpsc::Receiver<NodeEvent>, name: &str) -> bool {
    let deadline = Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(NodeEvent::StateChanged(change)))
                if change.user_name.as_deref() == Some(name)
                    && change.connection_state == Some(ConnectionState::Offline) =>
            {
                return true;
            }
            Ok(Some(_)) => {}
            _ => return false,
        }
    }
}

async fn shut_down(nodes: &[(Node, mpsc::Receiver<NodeEvent>)]) {
    for (node, _) in nodes.iter().rev() {
        node.abort().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn crashed_peasant_fails_the_query_then_is_repaired() {
    let nodes = ring(&["alice", "bob"]).await;
    let king = &nodes[0].0;
    let bob = &nodes[2].0;
    bob.abort().await;

    match king.get_topology_info().await {
        Err(NodeError::OperationFailed(reason)) => assert!(reason.contains("bob"), "{reason}"),
        other => panic!("expected the query to fail, got {other:?}"),
    }

    let expected = vec![
        snapshot("king", "alice", "alice"),
        snapshot("alice", "king", "king"),
    ];
    assert_eq!(wait_for_topology(king, &expected).await, expected);
    assert_eq!(king.get_online_users().await.unwrap(), "king, alice");

    shut_down(&nodes).await;
}

#[tokio::test]
async fn member_crashing_as_soon_as_it_joined_fails_the_next_query() {
    let nodes = ring(&["alice"]).await;
    nodes[1].0.abort().await;

    match nodes[0].0.get_topology_info().await {
        Err(NodeError::OperationFailed(reason)) => assert!(reason.contains("alice"), "{reason}"),
        other => panic!("expected the query to fail, got {other:?}"),
    }
    assert_eq!(
        nodes[0].0.get_topology_info().await.unwrap(),
        vec![snapshot("king", "king", "king")]
    );

    shut_down(&nodes).await;
}

#[tokio::test]
async fn crashed_member_is_dropped_during_chat_fan_out() {
    let mut nodes = ring(&["alice", "bob"]).await;
    nodes[2].0.abort().await;

    nodes[1].0.send_message("anyone there?").await.unwrap();

    let expected = vec![
        snapshot("king", "alice", "alice"),
        snapshot("alice", "king", "king"),
    ];
    assert_eq!(wait_for_topology(&nodes[0].0, &expected).await, expected);
    assert!(saw_offline(&mut nodes[1].1, "bob").await);

    shut_down(&nodes).await;
}

#[tokio::test]
async fn middle_member_crash_joins_its_neighbors() {
    let nodes = ring(&["alice", "bob", "carol"]).await;
    let king = &nodes[0].0;
    nodes[2].0.abort().await;

    assert!(king.get_topology_info().await.is_err());

    let expected = vec![
        snapshot("king", "alice", "carol"),
        snapshot("alice", "carol", "king"),
        snapshot("carol", "king", "alice"),
    ];
    assert_eq!(wait_for_topology(king, &expected).await, expected);

    shut_down(&nodes).await;
}

#[tokio::test]
async fn peasant_log_off_repairs_the_ring() {
    let mut nodes = ring(&["alice", "bob"]).await;
    nodes[1].0.log_off().await;
    assert!(!nodes[1].0.is_logged_in());

    let expected = vec![
        snapshot("king", "bob", "bob"),
        snapshot("bob", "king", "king"),
    ];
    assert_eq!(wait_for_topology(&nodes[0].0, &expected).await, expected);
    assert!(saw_offline(&mut nodes[0].1, "alice").await);
    assert!(saw_offline(&mut nodes[2].1, "alice").await);

    shut_down(&nodes).await;
}

#[tokio::test]
async fn ring_keeps_working_after_repair() {
    let mut nodes = ring(&["alice", "bob", "carol"]).await;
    nodes[1].0.abort().await;
    assert!(nodes[0].0.get_topology_info().await.is_err());

    let expected = vec![
        snapshot("king", "bob", "carol"),
        snapshot("bob", "carol", "king"),
        snapshot("carol", "king", "bob"),
    ];
    assert_eq!(wait_for_topology(&nodes[0].0, &expected).await, expected);

    nodes[3].0.send_message("still here").await.unwrap();
    let deadline = Instant::now() + WAIT;
    let mut delivered = false;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, nodes[2].1.recv()).await {
        if event == NodeEvent::ChatLine("carol: still here".into()) {
            delivered = true;
            break;
        }
    }
    assert!(delivered);

    shut_down(&nodes).await;
}
