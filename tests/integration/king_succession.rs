//! Integration tests for replacing the king.
//!
//! Covers a crashed king, detected by a peasant whose request goes
//! unanswered, and a king that logs off and hands the ring to its heir. In
//! both cases the member with the largest election id must end up king of
//! a single closed ring.
//!
//! Peasants are never asked for the topology while the ring has no king:
//! such a request would itself report the king dead. The tests watch
//! [`Node::is_king`] and [`Node::king_info`] instead, and query the winner.
//!
//! Verification command: `cargo test --test king_succession`

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use ringchat::node::{Node, NodeConfig, NodeEvent};
use ringchat_proto::identity::{NodeInfo, TopologyInfo};
use ringchat_proto::presence::ConnectionState;

// =============================================================================
// Helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(15);

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

type Member = (Node, mpsc::Receiver<NodeEvent>);

/// The king followed by one peasant per name, joined in order.
async fn ring(names: &[&str]) -> (Member, Vec<Member>) {
    let king = Node::start_new_network(local("king"), test_config())
        .await
        .unwrap();
    let mut peasants = Vec::new();
    for name in names {
        let member =
            Node::connect_to_remote_king(king.0.info().clone(), local(name), test_config())
                .await
                .unwrap();
        peasants.push(member);
    }
    (king, peasants)
}

/// Index of the peasant with the largest election id.
fn heir(peasants: &[Member]) -> usize {
    (0..peasants.len())
        .max_by_key(|&i| peasants[i].0.info().election_id())
        .unwrap()
}

async fn wait_until_king(node: &Node) -> bool {
    let deadline = Instant::now() + WAIT;
    while !node.is_king() {
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    true
}

async fn wait_for_king_name(node: &Node, king: &str) -> bool {
    let deadline = Instant::now() + WAIT;
    while node.king_info().await.name != king {
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    true
}

async fn wait_for_topology(node: &Node, done: impl Fn(&[TopologyInfo]) -> bool) -> Vec<TopologyInfo> {
    let deadline = Instant::now() + WAIT;
    loop {
        let topology = node.get_topology_info().await.unwrap_or_default();
        if done(&topology) || Instant::now() > deadline {
            return topology;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Whether the snapshots describe one ring covering exactly `size` members
/// whose left and right links agree.
fn is_single_cycle(topology: &[TopologyInfo], size: usize) -> bool {
    let by_name: HashMap<&str, &TopologyInfo> = topology
        .iter()
        .map(|s| (s.node_name.as_str(), s))
        .collect();
    if topology.len() != size || by_name.len() != size {
        return false;
    }
    let consistent = topology.iter().all(|s| {
        by_name
            .get(s.left_name.as_str())
            .is_some_and(|left| left.right_name == s.node_name)
    });
    if !consistent {
        return false;
    }
    let Some(start) = topology.first() else {
        return false;
    };
    let mut current = start;
    for _ in 1..size {
        match by_name.get(current.left_name.as_str()) {
            Some(next) if next.node_name != start.node_name => current = next,
            _ => return false,
        }
    }
    current.left_name == start.node_name
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

async fn shut_down(king: &Node, peasants: &[Member]) {
    for (node, _) in peasants.iter().rev() {
        node.abort().await;
    }
    king.abort().await;
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn crashed_king_is_replaced_by_the_largest_id() {
    let (king, mut peasants) = ring(&["alice", "bob"]).await;
    let winner = heir(&peasants);
    let other = 1 - winner;
    let winner_name = peasants[winner].0.info().name.clone();
    let other_name = peasants[other].0.info().name.clone();

    king.0.abort().await;
    // Alice sits next to the dead king, so her failed request starts the
    // election from the edge of the ring.
    assert!(peasants[0].0.send_message("is anyone in charge?").await.is_err());

    assert!(wait_until_king(&peasants[winner].0).await);
    assert!(!peasants[other].0.is_king());
    assert!(wait_for_king_name(&peasants[other].0, &winner_name).await);
    assert_eq!(
        peasants[other].0.king_address().await,
        peasants[winner].0.info().endpoint()
    );

    let expected = vec![
        TopologyInfo::new(winner_name.as_str(), other_name.as_str(), other_name.as_str()),
        TopologyInfo::new(other_name.as_str(), winner_name.as_str(), winner_name.as_str()),
    ];
    let topology = wait_for_topology(&peasants[winner].0, |t| t == expected).await;
    assert_eq!(topology, expected);

    assert!(saw_offline(&mut peasants[other].1, "king").await);

    shut_down(&king.0, &peasants).await;
}

#[tokio::test]
async fn king_log_off_hands_the_ring_to_the_heir() {
    let (king, mut peasants) = ring(&["alice", "bob"]).await;
    let winner = heir(&peasants);
    let other = 1 - winner;
    let winner_name = peasants[winner].0.info().name.clone();

    king.0.log_off().await;
    assert!(!king.0.is_logged_in());

    assert!(wait_until_king(&peasants[winner].0).await);
    assert!(wait_for_king_name(&peasants[other].0, &winner_name).await);

    let topology = wait_for_topology(&peasants[winner].0, |t| is_single_cycle(t, 2)).await;
    assert!(is_single_cycle(&topology, 2), "{topology:?}");
    assert_eq!(topology[0].node_name, winner_name);

    assert!(saw_offline(&mut peasants[winner].1, "king").await);
    assert!(saw_offline(&mut peasants[other].1, "king").await);

    shut_down(&king.0, &peasants).await;
}

#[tokio::test]
async fn larger_ring_closes_into_one_cycle_after_promotion() {
    let (king, mut peasants) = ring(&["alice", "bob", "carol"]).await;
    let winner = heir(&peasants);
    let winner_name = peasants[winner].0.info().name.clone();

    king.0.abort().await;
    assert!(peasants[0].0.send_message("hello?").await.is_err());

    assert!(wait_until_king(&peasants[winner].0).await);
    for (i, (node, _)) in peasants.iter().enumerate() {
        if i != winner {
            assert!(!node.is_king());
            assert!(wait_for_king_name(node, &winner_name).await);
        }
    }

    let topology = wait_for_topology(&peasants[winner].0, |t| is_single_cycle(t, 3)).await;
    assert!(is_single_cycle(&topology, 3), "{topology:?}");
    assert!(topology.iter().all(|s| s.node_name != "king"));

    // Chat flows through the new king.
    let speaker = (winner + 1) % peasants.len();
    let listener = (winner + 2) % peasants.len();
    let speaker_name = peasants[speaker].0.info().name.clone();
    peasants[speaker].0.send_message("new reign").await.unwrap();
    let expected = NodeEvent::ChatLine(format!("{speaker_name}: new reign"));
    let deadline = Instant::now() + WAIT;
    let mut delivered = false;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, peasants[listener].1.recv()).await {
        if event == expected {
            delivered = true;
            break;
        }
    }
    assert!(delivered);

    shut_down(&king.0, &peasants).await;
}

#[tokio::test]
async fn election_started_mid_ring_crowns_one_king() {
    let (king, peasants) = ring(&["alice", "bob", "carol"]).await;
    // Bob sits between Alice and Carol. His candidate travels toward
    // Alice first; if it comes back unbeaten he wins, otherwise the
    // largest id in the ring does.
    let ids: Vec<u64> = peasants.iter().map(|(n, _)| n.info().election_id()).collect();
    let winner = if ids[1] > ids[0] { 1 } else { heir(&peasants) };
    let winner_name = peasants[winner].0.info().name.clone();

    king.0.abort().await;
    assert!(peasants[1].0.send_message("who leads now?").await.is_err());

    assert!(wait_until_king(&peasants[winner].0).await);
    for (i, (node, _)) in peasants.iter().enumerate() {
        if i != winner {
            assert!(wait_for_king_name(node, &winner_name).await);
            assert!(!node.is_king());
        }
    }

    let topology = wait_for_topology(&peasants[winner].0, |t| is_single_cycle(t, 3)).await;
    assert!(is_single_cycle(&topology, 3), "{topology:?}");
    assert_eq!(topology[0].node_name, winner_name);
    assert_eq!(
        peasants.iter().filter(|(node, _)| node.is_king()).count(),
        1
    );

    shut_down(&king.0, &peasants).await;
}

#[tokio::test]
async fn lone_king_log_off_has_no_heir() {
    let (king, peasants) = ring(&[]).await;
    king.0.log_off().await;
    assert!(!king.0.is_logged_in());
    assert!(peasants.is_empty());
}
