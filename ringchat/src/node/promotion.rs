//! Turning an election winner into the king.
//!
//! The winner walks the ring in both directions with `LONG_LIVE_THE_KING`
//! requests. Each relaying peasant re-points its king link at the winner
//! and reports itself, so the winner learns the membership in ring order.
//! The two outermost members, which still point at the dead king, are then
//! told about each other to close the ring.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use ringchat_proto::identity::NodeInfo;
use ringchat_proto::message::{Message, MessageType};

use crate::link::Peer;

use super::election::Side;
use super::king::KingLogic;
use super::{NodeCore, Role};

impl NodeCore {
    /// Promotes this peasant to king. Runs at most once per node.
    pub(crate) async fn promote(self: &Arc<Self>) {
        if self.promoting.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node = %self.info.name, "promoting to king");

        let mut role = self.role.lock().await;
        let Role::Peasant(peasant) = &*role else {
            return;
        };
        let old_king = peasant.king().info.clone();
        let left = peasant.left().clone();
        let right = peasant.right().clone();

        let mut king = KingLogic::new(self.info.clone());
        let left_most = self.gather(&left, &old_king, Side::Left, &mut king).await;
        let right_most = self.gather(&right, &old_king, Side::Right, &mut king).await;

        let mut unreachable = Vec::new();
        if let Some(outer) = &left_most {
            let other = right_most.as_ref().map_or(&self.info, |p| &p.info);
            if !self.close_ring(outer, &old_king, other).await {
                unreachable.push(outer.info.name.clone());
            }
        }
        if let Some(outer) = &right_most {
            let other = left_most.as_ref().map_or(&self.info, |p| &p.info);
            if !self.close_ring(outer, &old_king, other).await {
                unreachable.push(outer.info.name.clone());
            }
        }

        tracing::info!(node = %self.info.name, members = ?king.names(), "gathered all peasants");
        let previous = std::mem::replace(&mut *role, Role::King(king));
        self.is_king.store(true, Ordering::SeqCst);
        drop(role);

        if let Role::Peasant(peasant) = previous {
            peasant.close_all().await;
        }
        self.listeners.end_by_name(&old_king.name);

        tokio::time::sleep(self.config.settle_delay).await;

        let mut role = self.role.lock().await;
        if let Role::King(king) = &mut *role {
            for name in unreachable {
                king.handle_node_death(self, &name).await;
            }
            king.announce_gone(self, &old_king.name).await;
        }
    }

    /// Walks one direction starting at `start`, adds every reachable member
    /// found to `king`, and returns the outermost one.
    async fn gather(
        &self,
        start: &Peer,
        old_king: &NodeInfo,
        side: Side,
        king: &mut KingLogic,
    ) -> Option<Peer> {
        if start.info.name == old_king.name {
            tracing::info!(node = %self.info.name, ?side, "no members on this side");
            return None;
        }

        let request = match Message::with_identities(
            MessageType::LongLiveTheKing,
            std::slice::from_ref(&self.info),
            &self.info,
            Some(&start.info),
        ) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(node = %self.info.name, err = %e, "could not encode announcement");
                return None;
            }
        };
        let reply = match start.link.request(request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(node = %self.info.name, ?side, peer = %start.name(), err = %e, "announcement walk failed");
                return None;
            }
        };
        let discovered = match reply.identities() {
            Ok(discovered) => discovered,
            Err(e) => {
                tracing::warn!(node = %self.info.name, ?side, err = %e, "malformed announcement reply");
                return None;
            }
        };

        let mut peers = Vec::new();
        for info in discovered.into_iter().filter(|i| *i != self.info) {
            if king.contains(&info.name) || peers.iter().any(|p: &Peer| p.info == info) {
                continue;
            }
            match Peer::connect(info.clone(), self.config.connect_timeout).await {
                Ok(peer) => peers.push(peer),
                Err(e) => {
                    tracing::info!(node = %self.info.name, peer = %info.name, err = %e, "skipping unreachable member");
                }
            }
        }

        let outermost = peers.last().cloned();
        if side == Side::Right {
            peers.reverse();
        }
        for peer in peers {
            king.add(peer);
        }
        tracing::info!(node = %self.info.name, ?side, outermost = ?outermost.as_ref().map(Peer::name), "side gathered");
        outermost
    }

    /// Tells an outermost member to replace its link to the old king with
    /// one to `other`.
    async fn close_ring(&self, outer: &Peer, old_king: &NodeInfo, other: &NodeInfo) -> bool {
        let notice = match Message::with_identities(
            MessageType::TopologyChanged,
            &[old_king.clone(), other.clone()],
            &self.info,
            Some(&outer.info),
        ) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::error!(node = %self.info.name, err = %e, "could not encode ring closure");
                return false;
            }
        };
        match outer.link.send(notice).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(node = %self.info.name, peer = %outer.name(), err = %e, "could not close the ring");
                false
            }
        }
    }
}
