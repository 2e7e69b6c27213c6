//! How the king reacts to each message type.

use std::sync::Arc;

use ringchat_proto::message::{Message, MessageType, REJECT_NAME_TAKEN};

use crate::link::{Link, LinkError, Peer};

use super::{NodeCore, Role};

/// Dispatches one message received by the king.
pub(crate) async fn handle(core: &Arc<NodeCore>, link: &Link, message: Message) {
    match message.kind {
        MessageType::Greetings => admit(core, link, message).await,
        MessageType::Chat => chat(core, link, message).await,
        MessageType::MapTopology => map_topology(core, link, &message).await,
        MessageType::TopologyChanged => topology_changed(core, &message).await,
        MessageType::OnlineUsers => online_users(core, link, &message).await,
        MessageType::Name => reply(core, link, &message, MessageType::Name, &core.info.name).await,
        MessageType::KingIsDead | MessageType::LongLiveTheKing => {
            tracing::debug!(node = %core.info.name, kind = %message.kind, from = %message.sender_name(), "ignored by the king");
        }
        MessageType::Confirm | MessageType::Reject => {
            tracing::debug!(node = %core.info.name, kind = %message.kind, from = %message.sender_name(), "unsolicited reply");
        }
    }
}

async fn reply(core: &NodeCore, link: &Link, request: &Message, kind: MessageType, content: &str) {
    let answer = Message::new(kind, content, &core.info, Some(&request.sender));
    if let Err(e) = link.send(answer).await {
        tracing::warn!(node = %core.info.name, peer = %request.sender_name(), err = %e, "could not reply");
    }
}

/// Join handshake. The joiner is told who its right neighbor will be, and
/// once it confirms it becomes the king's new right neighbor.
async fn admit(core: &Arc<NodeCore>, link: &Link, message: Message) {
    let joiner = message.sender;
    let mut role = core.role.lock().await;
    let Role::King(king) = &mut *role else {
        return;
    };

    if joiner.name == core.info.name || king.contains(&joiner.name) {
        tracing::info!(node = %core.info.name, peer = %joiner.name, "rejecting join, name already used");
        let reject = Message::new(MessageType::Reject, REJECT_NAME_TAKEN, &core.info, None);
        if let Err(e) = link.send(reject).await {
            tracing::debug!(node = %core.info.name, err = %e, "could not send rejection");
        }
        return;
    }

    let old_right = king.right_neighbor().cloned();
    let right = old_right
        .as_ref()
        .map_or_else(|| core.info.clone(), |p| p.info.clone());

    let handshake = async {
        link.send(Message::new(
            MessageType::Greetings,
            "",
            &core.info,
            Some(&joiner),
        ))
        .await?;
        link.send(right).await?;
        link.read_message().await
    };
    match handshake.await {
        Ok(answer) if answer.kind == MessageType::Confirm => {}
        Ok(answer) => {
            tracing::info!(node = %core.info.name, peer = %joiner.name, kind = %answer.kind, "join abandoned by the joiner");
            return;
        }
        Err(e) => {
            tracing::warn!(node = %core.info.name, peer = %joiner.name, err = %e, "join handshake failed");
            return;
        }
    }

    let peer = match Peer::connect(joiner.clone(), core.config.connect_timeout).await {
        Ok(peer) => peer,
        Err(e) => {
            tracing::warn!(node = %core.info.name, peer = %joiner.name, err = %e, "could not link back to the joiner");
            return;
        }
    };
    king.add(peer);

    let users = king.online_users(core, &joiner.name).await;
    let listing = Message::new(MessageType::OnlineUsers, users, &core.info, Some(&joiner));
    if let Err(e) = link.send(listing).await {
        tracing::warn!(node = %core.info.name, peer = %joiner.name, err = %e, "could not send online users");
    }
    tracing::info!(node = %core.info.name, peer = %joiner.name, "member is online");

    king.welcome(core, &joiner, old_right).await;
}

async fn chat(core: &Arc<NodeCore>, link: &Link, message: Message) {
    let mut role = core.role.lock().await;
    let Role::King(king) = &mut *role else {
        return;
    };
    core.queue.push(&message);
    reply(core, link, &message, MessageType::Confirm, "").await;
    king.broadcast(core, &message).await;
}

async fn map_topology(core: &Arc<NodeCore>, link: &Link, message: &Message) {
    let mut role = core.role.lock().await;
    let Role::King(king) = &mut *role else {
        return;
    };
    let answer = match king.topology(core).await {
        Ok(snapshots) => Message::with_topology(
            MessageType::Confirm,
            &snapshots,
            &core.info,
            Some(&message.sender),
        )
        .map_err(LinkError::from),
        Err(e) => {
            tracing::warn!(node = %core.info.name, err = %e, "topology request failed");
            Ok(Message::new(
                MessageType::Reject,
                e.to_string(),
                &core.info,
                Some(&message.sender),
            ))
        }
    };
    let sent = match answer {
        Ok(answer) => link.send(answer).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        tracing::warn!(node = %core.info.name, peer = %message.sender_name(), err = %e, "could not answer topology request");
    }
}

/// A member reports a dead peer, or its own departure.
async fn topology_changed(core: &Arc<NodeCore>, message: &Message) {
    let dead = message.content.trim();
    let mut role = core.role.lock().await;
    let Role::King(king) = &mut *role else {
        return;
    };
    if !king.contains(dead) {
        tracing::debug!(node = %core.info.name, peer = %dead, "report about unknown member");
        return;
    }
    tracing::info!(node = %core.info.name, peer = %dead, reporter = %message.sender_name(), "member reported gone");
    king.handle_node_death(core, dead).await;
}

async fn online_users(core: &Arc<NodeCore>, link: &Link, message: &Message) {
    let mut role = core.role.lock().await;
    let Role::King(king) = &mut *role else {
        return;
    };
    let users = king.online_users(core, message.sender_name()).await;
    reply(core, link, message, MessageType::OnlineUsers, &users).await;
}
