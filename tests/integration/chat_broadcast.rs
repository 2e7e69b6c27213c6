//! Integration tests for chat fan-out through the king.
//!
//! Verification command: `cargo test --test chat_broadcast`

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use ringchat::node::{Node, NodeConfig, NodeEvent};
use ringchat_proto::identity::NodeInfo;

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

struct Ring {
    king: Node,
    king_events: mpsc::Receiver<NodeEvent>,
    alice: Node,
    alice_events: mpsc::Receiver<NodeEvent>,
    bob: Node,
    bob_events: mpsc::Receiver<NodeEvent>,
}

impl Ring {
    async fn start() -> Self {
        let (king, king_events) = Node::start_new_network(local("king"), test_config())
            .await
            .unwrap();
        let (alice, alice_events) =
            Node::connect_to_remote_king(king.info().clone(), local("alice"), test_config())
                .await
                .unwrap();
        let (bob, bob_events) =
            Node::connect_to_remote_king(king.info().clone(), local("bob"), test_config())
                .await
                .unwrap();
        Self {
            king,
            king_events,
            alice,
            alice_events,
            bob,
            bob_events,
        }
    }

    async fn shut_down(self) {
        self.bob.abort().await;
        self.alice.abort().await;
        self.king.abort().await;
    }
}

/// Collects chat lines until `count` have arrived or the wait runs out.
async fn chat_lines(rx: &mut mpsc::Receiver<NodeEvent>, count: usize) -> Vec<String> {
    let deadline = Instant::now() + WAIT;
    let mut lines = Vec::new();
    while lines.len() < count {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(NodeEvent::ChatLine(line))) => lines.push(line),
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    lines
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn peasant_message_reaches_everyone() {
    let mut ring = Ring::start().await;

    ring.alice.send_message("hello ring").await.unwrap();

    assert_eq!(chat_lines(&mut ring.alice_events, 1).await, ["alice: hello ring"]);
    assert_eq!(chat_lines(&mut ring.king_events, 1).await, ["alice: hello ring"]);
    assert_eq!(chat_lines(&mut ring.bob_events, 1).await, ["alice: hello ring"]);

    ring.shut_down().await;
}

#[tokio::test]
async fn king_message_reaches_everyone() {
    let mut ring = Ring::start().await;

    ring.king.send_message("from the top").await.unwrap();

    assert_eq!(chat_lines(&mut ring.king_events, 1).await, ["king: from the top"]);
    assert_eq!(chat_lines(&mut ring.alice_events, 1).await, ["king: from the top"]);
    assert_eq!(chat_lines(&mut ring.bob_events, 1).await, ["king: from the top"]);

    ring.shut_down().await;
}

#[tokio::test]
async fn sender_is_not_sent_its_own_message_back() {
    let mut ring = Ring::start().await;

    ring.bob.send_message("once").await.unwrap();
    ring.alice.send_message("marker").await.unwrap();

    // Bob shows his own line locally, then only Alice's.
    assert_eq!(
        chat_lines(&mut ring.bob_events, 2).await,
        ["bob: once", "alice: marker"]
    );

    ring.shut_down().await;
}

#[tokio::test]
async fn consecutive_messages_keep_their_order() {
    let mut ring = Ring::start().await;

    for text in ["one", "two", "three"] {
        ring.alice.send_message(text).await.unwrap();
    }

    assert_eq!(
        chat_lines(&mut ring.bob_events, 3).await,
        ["alice: one", "alice: two", "alice: three"]
    );

    ring.shut_down().await;
}
