//! Membership bookkeeping and fan-out performed by the king.
//!
//! The king keeps every other member in one ordered sequence. The first
//! element is the king's left neighbor and the last its right neighbor;
//! walking left from the king visits the sequence front to back.

use std::collections::VecDeque;

use ringchat_proto::identity::{NodeInfo, TopologyInfo};
use ringchat_proto::message::{Message, MessageType};
use ringchat_proto::presence::UserStateChange;

use crate::link::Peer;

use super::{NodeCore, NodeError, NodeEvent};

/// The king's view of the ring.
#[derive(Debug)]
pub struct KingLogic {
    me: NodeInfo,
    members: Vec<Peer>,
}

impl KingLogic {
    /// A king with no members yet.
    #[must_use]
    pub const fn new(me: NodeInfo) -> Self {
        Self {
            me,
            members: Vec::new(),
        }
    }

    /// Member names in ring order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.members.iter().map(|p| p.info.name.clone()).collect()
    }

    /// Whether `name` belongs to a member.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|p| p.name() == name)
    }

    /// The king's left neighbor, if the ring has any members.
    #[must_use]
    pub fn left_neighbor(&self) -> Option<&Peer> {
        self.members.first()
    }

    /// The king's right neighbor, if the ring has any members.
    #[must_use]
    pub fn right_neighbor(&self) -> Option<&Peer> {
        self.members.last()
    }

    /// Appends a member as the king's new right neighbor.
    pub fn add(&mut self, peer: Peer) {
        debug_assert!(!self.contains(peer.name()));
        tracing::debug!(node = %self.me.name, peer = %peer.name(), "adding member");
        self.members.push(peer);
    }

    /// The king's own snapshot. An empty ring points both ways at itself.
    #[must_use]
    pub fn own_snapshot(&self) -> TopologyInfo {
        let left = self.left_neighbor().map_or(&self.me.name, |p| &p.info.name);
        let right = self.right_neighbor().map_or(&self.me.name, |p| &p.info.name);
        TopologyInfo::new(self.me.name.clone(), left.clone(), right.clone())
    }

    /// The member with the largest election id.
    #[must_use]
    pub fn next_king(&self) -> Option<&Peer> {
        self.members.iter().max_by_key(|p| p.info.election_id())
    }

    /// Asks every member for its snapshot, king first. Returns the name of
    /// the first member that failed to answer.
    pub async fn query_topology(&self) -> Result<Vec<TopologyInfo>, String> {
        let mut snapshots = Vec::with_capacity(self.members.len() + 1);
        snapshots.push(self.own_snapshot());
        for member in &self.members {
            let exchange = member.link.exchange().await;
            let answer = async {
                exchange
                    .send(Message::new(
                        MessageType::MapTopology,
                        "",
                        &self.me,
                        Some(&member.info),
                    ))
                    .await?;
                exchange.read_topology().await
            };
            match answer.await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!(node = %self.me.name, peer = %member.name(), err = %e, "topology query failed");
                    return Err(member.info.name.clone());
                }
            }
        }
        Ok(snapshots)
    }

    /// Topology of the whole ring. A member that fails to answer is
    /// declared dead and the query fails.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::OperationFailed`] naming the unresponsive member.
    pub async fn topology(&mut self, core: &NodeCore) -> Result<Vec<TopologyInfo>, NodeError> {
        match self.query_topology().await {
            Ok(snapshots) => Ok(snapshots),
            Err(dead) => {
                self.handle_node_death(core, &dead).await;
                Err(NodeError::OperationFailed(format!(
                    "failed to get the topology, {dead} disconnected unexpectedly"
                )))
            }
        }
    }

    /// Probes every member except `requester` with `NAME` and lists the
    /// answers as `"king, a, b"`. Members that fail the probe are left out
    /// and returned separately.
    pub async fn probe_online(&self, requester: &str) -> (String, Vec<String>) {
        let mut users = vec![self.me.name.clone()];
        let mut dead = Vec::new();
        for member in &self.members {
            if member.name() == requester {
                users.push(requester.to_string());
                continue;
            }
            let probe = Message::new(MessageType::Name, "", &self.me, Some(&member.info));
            match member.link.request(probe).await {
                Ok(reply) => users.push(reply.content),
                Err(e) => {
                    tracing::warn!(node = %self.me.name, peer = %member.name(), err = %e, "member failed the name probe");
                    dead.push(member.info.name.clone());
                }
            }
        }
        (users.join(", "), dead)
    }

    /// Online-user listing with death handling for failed probes.
    pub async fn online_users(&mut self, core: &NodeCore, requester: &str) -> String {
        let (users, dead) = self.probe_online(requester).await;
        for name in dead {
            self.handle_node_death(core, &name).await;
        }
        users
    }

    /// Forwards a chat message to every member except its original sender,
    /// waiting for each acknowledgement. Returns members that did not answer.
    pub async fn forward_to_all(&self, message: &Message) -> Vec<String> {
        let mut dead = Vec::new();
        for member in &self.members {
            if member.info == message.sender {
                continue;
            }
            let forwarded = Message {
                recipient: Some(member.info.clone()),
                ..message.clone()
            };
            if let Err(e) = member.link.request(forwarded).await {
                tracing::warn!(node = %self.me.name, peer = %member.name(), err = %e, "failed to forward chat");
                dead.push(member.info.name.clone());
            }
        }
        dead
    }

    /// Fans a chat message out and repairs around members that failed.
    pub async fn broadcast(&mut self, core: &NodeCore, message: &Message) {
        for name in self.forward_to_all(message).await {
            self.handle_node_death(core, &name).await;
        }
    }

    /// Finishes a join: the previous right neighbor learns its new left
    /// neighbor, observers see the joiner come online, and every member
    /// receives the presence update after confirming a probe.
    pub async fn welcome(&mut self, core: &NodeCore, joiner: &NodeInfo, old_right: Option<Peer>) {
        let mut pending = VecDeque::new();

        if let Some(old_right) = old_right.filter(|p| p.info != *joiner) {
            let notice = Message::with_identities(
                MessageType::TopologyChanged,
                std::slice::from_ref(joiner),
                &self.me,
                Some(&old_right.info),
            );
            let sent = match notice {
                Ok(notice) => old_right.link.send(notice).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                tracing::warn!(node = %self.me.name, peer = %old_right.name(), err = %e, "could not re-point old right neighbor");
                queue_dead(&mut pending, old_right.name());
            }
        }

        let mut change = UserStateChange::online(joiner.name.clone());
        match self.query_topology().await {
            Ok(topology) => change = change.with_topology(topology),
            Err(failed) => queue_dead(&mut pending, &failed),
        }
        core.emit(NodeEvent::StateChanged(change.clone()));

        for member in &self.members {
            let exchange = member.link.exchange().await;
            let probe = async {
                let answer = exchange
                    .request(Message::new(
                        MessageType::Greetings,
                        joiner.name.clone(),
                        &self.me,
                        Some(&member.info),
                    ))
                    .await?;
                if answer.kind == MessageType::Confirm {
                    exchange.send(change.clone()).await?;
                }
                Ok::<(), crate::link::LinkError>(())
            };
            if let Err(e) = probe.await {
                tracing::warn!(node = %self.me.name, peer = %member.name(), err = %e, "member failed the presence probe");
                queue_dead(&mut pending, member.name());
            }
        }

        if !pending.is_empty() {
            core.emit(NodeEvent::Error(
                "some members did not answer while the ring was updated, refresh it later".into(),
            ));
        }
        while let Some(name) = pending.pop_front() {
            self.handle_node_death(core, &name).await;
        }
    }

    /// Repairs the ring around a dead member: both surviving neighbors are
    /// re-pointed at each other (or at the king), the member is removed and
    /// its departure announced. Members found dead while doing so are
    /// handled the same way.
    pub async fn handle_node_death(&mut self, core: &NodeCore, dead: &str) {
        let mut pending = VecDeque::from([dead.to_string()]);
        while let Some(name) = pending.pop_front() {
            let Some(index) = self.position(&name) else {
                tracing::debug!(node = %self.me.name, peer = %name, "dead node is not a member");
                continue;
            };
            tracing::warn!(node = %self.me.name, peer = %name, "repairing ring around dead member");
            let removed = self.members.remove(index);
            let before = index
                .checked_sub(1)
                .and_then(|i| self.members.get(i))
                .cloned();
            let after = self.members.get(index).cloned();

            self.notify_neighbor(before.as_ref(), after.as_ref(), &removed.info, &mut pending)
                .await;
            self.notify_neighbor(after.as_ref(), before.as_ref(), &removed.info, &mut pending)
                .await;

            removed.link.close().await;
            core.listeners.end_by_name(&name);
            self.announce_departure(core, &name, &mut pending).await;
        }
    }

    async fn notify_neighbor(
        &self,
        neighbor: Option<&Peer>,
        replacement: Option<&Peer>,
        dead: &NodeInfo,
        pending: &mut VecDeque<String>,
    ) {
        let Some(neighbor) = neighbor else {
            return;
        };
        let replacement = replacement.map_or(&self.me, |p| &p.info);
        let notice = match Message::with_identities(
            MessageType::TopologyChanged,
            &[dead.clone(), replacement.clone()],
            &self.me,
            Some(&neighbor.info),
        ) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::error!(node = %self.me.name, err = %e, "could not encode repair notice");
                return;
            }
        };
        if let Err(e) = neighbor.link.send(notice).await {
            tracing::warn!(node = %self.me.name, peer = %neighbor.name(), err = %e, "neighbor unreachable during repair");
            queue_dead(pending, neighbor.name());
        }
    }

    /// Tells observers and every member that `departed` left. The notice
    /// is an `"off <name>"` listing followed by the presence update.
    async fn announce_departure(
        &self,
        core: &NodeCore,
        departed: &str,
        pending: &mut VecDeque<String>,
    ) {
        tracing::info!(node = %self.me.name, peer = %departed, "member left the ring");
        let mut change = UserStateChange::offline(departed);
        match self.query_topology().await {
            Ok(topology) => change = change.with_topology(topology),
            Err(failed) => {
                core.emit(NodeEvent::Error(format!(
                    "failed to refresh the topology, {failed} disconnected unexpectedly"
                )));
                queue_dead(pending, &failed);
            }
        }
        core.emit(NodeEvent::StateChanged(change.clone()));

        for member in &self.members {
            let exchange = member.link.exchange().await;
            let sent = async {
                exchange
                    .send(Message::departure(departed, &self.me, &member.info))
                    .await?;
                exchange.send(change.clone()).await
            };
            if let Err(e) = sent.await {
                tracing::warn!(node = %self.me.name, peer = %member.name(), err = %e, "could not announce departure");
                queue_dead(pending, member.name());
            }
        }
    }

    /// Announces an already-removed member's departure, e.g. the old king
    /// after a promotion.
    pub async fn announce_gone(&mut self, core: &NodeCore, departed: &str) {
        let mut pending = VecDeque::new();
        self.announce_departure(core, departed, &mut pending).await;
        while let Some(name) = pending.pop_front() {
            self.handle_node_death(core, &name).await;
        }
    }

    /// Hands the crown to the member with the largest election id by
    /// sending it an election message carrying its own id.
    pub async fn hand_over(&self) {
        let Some(heir) = self.next_king() else {
            return;
        };
        tracing::info!(node = %self.me.name, heir = %heir.name(), "handing over the ring");
        let message = Message::election(heir.info.election_id(), &self.me, &heir.info);
        if let Err(e) = heir.link.send(message).await {
            tracing::warn!(node = %self.me.name, heir = %heir.name(), err = %e, "could not reach the heir");
        }
    }

    /// Closes every member link and forgets the membership.
    pub async fn close_all(&mut self) {
        tracing::info!(node = %self.me.name, "closing links to all members");
        for member in self.members.drain(..) {
            member.link.close().await;
        }
    }
}

fn queue_dead(pending: &mut VecDeque<String>, name: &str) {
    if !pending.iter().any(|n| n == name) {
        pending.push_back(name.to_string());
    }
}
