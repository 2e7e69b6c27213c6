//! How a peasant reacts to each message type.

use std::sync::Arc;

use ringchat_proto::message::{Message, MessageType};
use ringchat_proto::presence::UserStateChange;

use crate::link::Link;

use super::peasant::{PeasantLogic, Slot};
use super::{NodeCore, NodeEvent};

/// Dispatches one message received by a peasant.
pub(crate) async fn handle(core: &Arc<NodeCore>, link: &Link, message: Message) {
    match message.kind {
        MessageType::Greetings => presence_probe(core, link, &message).await,
        MessageType::Chat => {
            core.queue.push(&message);
            reply(core, link, &message, MessageType::Confirm, "").await;
        }
        MessageType::MapTopology => map_topology(core, link, &message).await,
        MessageType::TopologyChanged => topology_changed(core, &message).await,
        MessageType::OnlineUsers => online_users(core, link, &message).await,
        MessageType::KingIsDead => king_is_dead(core, &message).await,
        MessageType::LongLiveTheKing => long_live_the_king(core, link, &message).await,
        MessageType::Name => reply(core, link, &message, MessageType::Name, &core.info.name).await,
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

/// The king announces a new member; the presence update follows our
/// confirmation.
async fn presence_probe(core: &Arc<NodeCore>, link: &Link, message: &Message) {
    reply(core, link, message, MessageType::Confirm, "").await;
    match link.read_user_change().await {
        Ok(change) => {
            let about_me = change.user_name.as_deref() == Some(core.info.name.as_str());
            let change = if about_me {
                UserStateChange {
                    user_name: None,
                    connection_state: None,
                    topology: change.topology,
                }
            } else {
                change
            };
            tracing::info!(node = %core.info.name, %change, "presence update");
            core.emit(NodeEvent::StateChanged(change));
            if about_me {
                core.welcomed.send_replace(true);
            }
        }
        Err(e) => {
            tracing::warn!(node = %core.info.name, err = %e, "presence update never arrived");
            core.peasant_node_death(&message.sender).await;
        }
    }
}

async fn map_topology(core: &Arc<NodeCore>, link: &Link, message: &Message) {
    let Some(snapshot) = core.with_peasant(|p| p.snapshot()).await else {
        return;
    };
    if let Err(e) = link.send(snapshot).await {
        tracing::warn!(node = %core.info.name, peer = %message.sender_name(), err = %e, "could not send snapshot");
    }
}

/// Two identities re-point the link to a dead neighbor; a single identity
/// is a new left neighbor.
async fn topology_changed(core: &Arc<NodeCore>, message: &Message) {
    let ids = match message.identities() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(node = %core.info.name, err = %e, "malformed topology change");
            return;
        }
    };
    match ids.as_slice() {
        [dead, replacement] => core.correct_topology(dead, replacement.clone()).await,
        [left] => {
            core.repoint(Slot::Left, left.clone()).await;
        }
        _ => {
            tracing::warn!(node = %core.info.name, count = ids.len(), "topology change with unexpected identity count");
        }
    }
}

/// Either a listing for the log, or a departure notice followed by the
/// presence update.
async fn online_users(core: &Arc<NodeCore>, link: &Link, message: &Message) {
    if message.departed_name().is_none() {
        tracing::info!(node = %core.info.name, users = %message.content, "online users");
        return;
    }
    match link.read_user_change().await {
        Ok(change) => {
            tracing::info!(node = %core.info.name, %change, "member logged off");
            core.emit(NodeEvent::StateChanged(change));
        }
        Err(e) => {
            tracing::warn!(node = %core.info.name, err = %e, "king disconnected during a refresh");
            core.emit(NodeEvent::Error(format!(
                "leader {} disconnected unexpectedly while refreshing the topology",
                message.sender_name()
            )));
            core.peasant_node_death(&message.sender).await;
        }
    }
}

async fn king_is_dead(core: &Arc<NodeCore>, message: &Message) {
    let candidate = match message.candidate() {
        Ok(candidate) => candidate,
        Err(e) => {
            tracing::warn!(node = %core.info.name, err = %e, "malformed election message");
            return;
        }
    };
    let state = core
        .with_peasant(|p| (p.king().info.name.clone(), p.is_participant()))
        .await;
    let Some((king, participant)) = state else {
        return;
    };
    if !participant {
        tracing::info!(node = %core.info.name, %king, "king is gone, election started");
    }
    let from_king = message.sender.name == king;
    core.handle_election(candidate, message.sender_name(), from_king)
        .await;
}

/// Relays the new king's announcement one hop further and reports every
/// member collected on the way back to the sender.
async fn long_live_the_king(core: &Arc<NodeCore>, link: &Link, message: &Message) {
    let mut collected = match message.identities() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(node = %core.info.name, err = %e, "malformed announcement");
            return;
        }
    };
    let Some(new_king) = collected.first().cloned() else {
        tracing::warn!(node = %core.info.name, "announcement without a king");
        return;
    };
    let previous = message.sender_name();
    let route = core
        .with_peasant(|p| {
            let next = p.neighbor(p.view().next_side(previous)).clone();
            (next, p.king().info.name.clone())
        })
        .await;
    let Some((next, dead_king)) = route else {
        return;
    };

    tracing::info!(node = %core.info.name, king = %new_king.name, "long live the king");
    core.repoint(Slot::King, new_king.clone()).await;
    core.with_peasant(PeasantLogic::election_is_over).await;
    collected.push(core.info.clone());

    if next.info.name != dead_king && next.info.name != previous {
        let relay = Message::with_identities(
            MessageType::LongLiveTheKing,
            &collected,
            &core.info,
            Some(&next.info),
        );
        let answer = match relay {
            Ok(relay) => next.link.request(relay).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match answer.and_then(|a| a.identities().map_err(|e| e.to_string())) {
            Ok(list) => collected = list,
            Err(e) => {
                tracing::warn!(node = %core.info.name, peer = %next.name(), err = %e, "announcement stopped early");
            }
        }
    }

    let confirm = Message::with_identities(
        MessageType::Confirm,
        &collected,
        &core.info,
        Some(&message.sender),
    );
    let sent = match confirm {
        Ok(confirm) => link.send(confirm).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = sent {
        tracing::warn!(node = %core.info.name, err = %e, "could not confirm the announcement");
    }
}
