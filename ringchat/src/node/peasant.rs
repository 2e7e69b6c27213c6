//! Ring state of a non-coordinator member and the peasant-side flows that
//! use it: reporting deaths, re-pointing links, and running the election.
//!
//! A peasant holds exactly three outgoing links: to the king and to its
//! left and right neighbors. The role lock is only held to read or swap
//! those links, never across a network exchange.

use std::sync::Arc;

use ringchat_proto::identity::{NodeInfo, TopologyInfo};
use ringchat_proto::message::{Message, MessageType};

use crate::link::Peer;

use super::election::{self, Decision, RingView, Side};
use super::{NodeCore, NodeError, Role};

/// Which of a peasant's links to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The link to the king.
    King,
    /// The link to the left neighbor.
    Left,
    /// The link to the right neighbor.
    Right,
}

impl From<Side> for Slot {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => Self::Left,
            Side::Right => Self::Right,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::King => write!(f, "king"),
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

/// A peasant's view of the ring.
#[derive(Debug)]
pub struct PeasantLogic {
    me: NodeInfo,
    king: Peer,
    left: Peer,
    right: Peer,
    participant: bool,
}

impl PeasantLogic {
    /// Creates the state right after a successful join.
    #[must_use]
    pub const fn new(me: NodeInfo, king: Peer, left: Peer, right: Peer) -> Self {
        Self {
            me,
            king,
            left,
            right,
            participant: false,
        }
    }

    /// The link to the king.
    #[must_use]
    pub const fn king(&self) -> &Peer {
        &self.king
    }

    /// The link to the left neighbor.
    #[must_use]
    pub const fn left(&self) -> &Peer {
        &self.left
    }

    /// The link to the right neighbor.
    #[must_use]
    pub const fn right(&self) -> &Peer {
        &self.right
    }

    /// The neighbor on `side`.
    #[must_use]
    pub const fn neighbor(&self, side: Side) -> &Peer {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    /// Neighbor and king names, as the election rules need them.
    #[must_use]
    pub fn view(&self) -> RingView<'_> {
        RingView {
            left: self.left.name(),
            right: self.right.name(),
            king: self.king.name(),
        }
    }

    /// This node's topology snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TopologyInfo {
        TopologyInfo::new(
            self.me.name.clone(),
            self.left.info.name.clone(),
            self.right.info.name.clone(),
        )
    }

    /// Which neighbor link leads to `name`, left checked first.
    #[must_use]
    pub fn side_of(&self, name: &str) -> Option<Side> {
        if self.left.name() == name {
            Some(Side::Left)
        } else if self.right.name() == name {
            Some(Side::Right)
        } else {
            None
        }
    }

    /// Whether this node has forwarded an election message in the
    /// current round.
    #[must_use]
    pub const fn is_participant(&self) -> bool {
        self.participant
    }

    /// Marks the end of an election round.
    pub const fn election_is_over(&mut self) {
        self.participant = false;
    }

    /// Swaps in a new link and hands back the superseded one for closing.
    pub fn replace(&mut self, slot: Slot, peer: Peer) -> Peer {
        let target = match slot {
            Slot::King => &mut self.king,
            Slot::Left => &mut self.left,
            Slot::Right => &mut self.right,
        };
        std::mem::replace(target, peer)
    }

    /// Closes all three links.
    pub async fn close_all(&self) {
        tracing::info!(node = %self.me.name, "closing links to the ring");
        self.king.link.close().await;
        self.left.link.close().await;
        self.right.link.close().await;
    }
}

impl NodeCore {
    /// Runs `f` against the peasant state, if this node is a peasant.
    pub(crate) async fn with_peasant<R>(&self, f: impl FnOnce(&mut PeasantLogic) -> R) -> Option<R> {
        let mut role = self.role.lock().await;
        match &mut *role {
            Role::Peasant(peasant) => Some(f(peasant)),
            Role::King(_) => None,
        }
    }

    /// Reacts to a peer that stopped answering. A dead neighbor is
    /// reported to the king; a dead king starts an election.
    pub(crate) async fn peasant_node_death(self: &Arc<Self>, dead: &NodeInfo) {
        let Some(king) = self.with_peasant(|p| p.king().clone()).await else {
            return;
        };
        if dead.name == king.info.name {
            tracing::warn!(node = %self.info.name, king = %dead.name, "king disconnected unexpectedly");
            self.start_election().await;
        } else {
            tracing::warn!(node = %self.info.name, peer = %dead.name, "reporting dead peer to the king");
            let report = Message::new(
                MessageType::TopologyChanged,
                dead.name.clone(),
                &self.info,
                Some(&king.info),
            );
            if let Err(e) = king.link.send(report).await {
                tracing::warn!(node = %self.info.name, err = %e, "king unreachable while reporting");
                self.start_election().await;
            }
        }
        self.listeners.end_by_name(&dead.name);
    }

    /// Starts an election round from this node.
    pub(crate) async fn start_election(self: &Arc<Self>) {
        let previous = self
            .with_peasant(|p| {
                let view = p.view();
                view.name(view.next_side(view.king)).to_string()
            })
            .await;
        if let Some(previous) = previous {
            self.handle_election(self.info.election_id(), &previous, true)
                .await;
        }
    }

    /// Applies one election step for a message carrying `candidate` that
    /// arrived from `previous`.
    pub(crate) async fn handle_election(
        self: &Arc<Self>,
        candidate: u64,
        previous: &str,
        started_locally: bool,
    ) {
        let own = self.info.election_id();
        let step = self
            .with_peasant(|p| {
                let view = p.view();
                let next = p.neighbor(view.election_side(previous)).clone();
                let king = p.king().info.name.clone();
                let decision = election::decide(
                    candidate,
                    own,
                    started_locally,
                    next.info.name == king,
                    p.is_participant(),
                );
                if matches!(decision, Decision::Forward(_)) {
                    p.participant = true;
                }
                (decision, next, king)
            })
            .await;
        let Some((decision, next, king)) = step else {
            return;
        };
        self.listeners.end_by_name(&king);

        match decision {
            Decision::Forward(candidate) => {
                tracing::info!(node = %self.info.name, to = %next.name(), candidate, "forwarding election");
                let message = Message::election(candidate, &self.info, &next.info);
                if let Err(e) = next.link.send(message).await {
                    tracing::warn!(node = %self.info.name, peer = %next.name(), err = %e, "could not forward election");
                }
            }
            Decision::Promote => {
                tracing::info!(node = %self.info.name, "won the election");
                self.promote().await;
            }
            Decision::Drop => {
                tracing::debug!(node = %self.info.name, candidate, "dropping smaller candidate");
            }
        }
    }

    /// Replaces the neighbor link that leads to `dead` with a link to
    /// `replacement`.
    pub(crate) async fn correct_topology(self: &Arc<Self>, dead: &NodeInfo, replacement: NodeInfo) {
        let side = self.with_peasant(|p| p.side_of(&dead.name)).await.flatten();
        let Some(side) = side else {
            tracing::debug!(node = %self.info.name, peer = %dead.name, "dead node is not a neighbor");
            return;
        };
        tracing::info!(node = %self.info.name, peer = %dead.name, "correcting neighbors after a death");
        self.listeners.end_by_name(&dead.name);
        self.repoint(side.into(), replacement).await;
    }

    /// Opens a link to `target` and installs it in `slot`. A target that
    /// cannot be reached is treated as dead.
    pub(crate) async fn repoint(self: &Arc<Self>, slot: Slot, target: NodeInfo) -> bool {
        match Peer::connect(target.clone(), self.config.connect_timeout).await {
            Ok(peer) => {
                let old = self.with_peasant(|p| p.replace(slot, peer)).await;
                if let Some(old) = old {
                    old.link.close().await;
                }
                tracing::info!(node = %self.info.name, slot = %slot, peer = %target.name, "new neighbor");
                true
            }
            Err(e) => {
                tracing::warn!(node = %self.info.name, slot = %slot, peer = %target.name, err = %e, "could not link to new neighbor");
                self.peasant_node_death(&target).await;
                false
            }
        }
    }

    /// Sends a request to the king. A king that does not answer is
    /// declared dead and the operation fails.
    pub(crate) async fn ask_king(self: &Arc<Self>, kind: MessageType, content: &str) -> Result<Message, NodeError> {
        let king = self
            .with_peasant(|p| p.king().clone())
            .await
            .ok_or(NodeError::NotLoggedIn)?;
        let request = Message::new(kind, content, &self.info, Some(&king.info));
        match king.link.request(request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                tracing::warn!(node = %self.info.name, king = %king.name(), err = %e, "king did not answer");
                self.peasant_node_death(&king.info).await;
                Err(NodeError::OperationFailed(format!(
                    "the king {} disconnected unexpectedly, try again after the ring is repaired",
                    king.name()
                )))
            }
        }
    }
}
