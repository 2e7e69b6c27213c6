//! A ring member: role state machine, accept loop and public operations.
//!
//! A [`Node`] is either the king, which coordinates membership and chat
//! fan-out, or a peasant holding links to the king and to its two ring
//! neighbors. The role can change at runtime when a peasant wins an
//! election. Front-ends drive the node through the methods on [`Node`] and
//! observe it through the [`NodeEvent`] channel returned at login.

pub mod election;
mod king;
mod king_handler;
mod listener;
mod peasant;
mod peasant_handler;
mod promotion;
mod queue;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, MutexGuard, mpsc, watch};

use ringchat_proto::identity::{NodeInfo, TopologyInfo};
use ringchat_proto::message::{Message, MessageType, REJECT_NAME_TAKEN};
use ringchat_proto::presence::UserStateChange;

use crate::link::{DEFAULT_CONNECT_TIMEOUT, LinkError, Peer};

use king::KingLogic;
use listener::ListenerRegistry;
use peasant::PeasantLogic;
use queue::{ChatQueue, format_line};

/// Default capacity of the event channel handed to front-ends.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Default pause between rebuilding the ring after a promotion and
/// announcing the old king's departure.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on how long a joiner waits for the king to announce it to
/// the ring before [`Node::connect_to_remote_king`] returns anyway.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// Something a front-end should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Someone came online or went offline, or the topology was refreshed.
    StateChanged(UserStateChange),
    /// A chat line ready for display, formatted as `"sender: text"`.
    ChatLine(String),
    /// A failure the user should know about.
    Error(String),
}

/// Errors returned by [`Node`] operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Logging in failed: the king was unreachable, rejected the name, or
    /// the join handshake broke off.
    #[error("could not connect: {0}")]
    ConnectFailed(String),

    /// The operation could not complete, usually because a member died
    /// while it ran.
    #[error("{0}")]
    OperationFailed(String),

    /// The node has logged off or aborted.
    #[error("the node is not logged in")]
    NotLoggedIn,
}

/// Tunables for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Upper bound on establishing a link.
    pub connect_timeout: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
    /// Pause after a promotion before the old king's departure is announced.
    pub settle_delay: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// The node's current role.
#[derive(Debug)]
pub(crate) enum Role {
    King(KingLogic),
    Peasant(PeasantLogic),
}

/// State shared by the accept loop, every listener and the [`Node`] handle.
#[derive(Debug)]
pub(crate) struct NodeCore {
    pub(crate) info: NodeInfo,
    pub(crate) config: NodeConfig,
    pub(crate) role: Mutex<Role>,
    pub(crate) is_king: AtomicBool,
    pub(crate) logged_in: AtomicBool,
    pub(crate) promoting: AtomicBool,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) queue: ChatQueue,
    pub(crate) accept_shutdown: watch::Sender<bool>,
    /// Raised once the king's presence update naming this node arrives.
    pub(crate) welcomed: watch::Sender<bool>,
    events: mpsc::Sender<NodeEvent>,
}

impl NodeCore {
    fn new(info: NodeInfo, config: NodeConfig, role: Role) -> (Arc<Self>, mpsc::Receiver<NodeEvent>) {
        let (events, rx) = mpsc::channel(config.event_buffer.max(1));
        let (accept_shutdown, _) = watch::channel(false);
        let (welcomed, _) = watch::channel(false);
        let is_king = matches!(role, Role::King(_));
        let core = Arc::new(Self {
            info,
            config,
            role: Mutex::new(role),
            is_king: AtomicBool::new(is_king),
            logged_in: AtomicBool::new(true),
            promoting: AtomicBool::new(false),
            listeners: ListenerRegistry::default(),
            queue: ChatQueue::new(),
            accept_shutdown,
            welcomed,
            events,
        });
        (core, rx)
    }

    /// Hands an event to the front-end without waiting. Events are dropped
    /// when nobody keeps up with the channel.
    pub(crate) fn emit(&self, event: NodeEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(node = %self.info.name, ?event, "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(node = %self.info.name, "event receiver gone");
            }
        }
    }

    /// Shows every queued chat line.
    pub(crate) fn drain_chat_queue(&self) {
        if self.queue.is_empty() {
            return;
        }
        for line in self.queue.drain() {
            tracing::info!(node = %self.info.name, %line, "chat");
            self.emit(NodeEvent::ChatLine(line));
        }
    }

    pub(crate) fn is_king(&self) -> bool {
        self.is_king.load(Ordering::SeqCst)
    }

    pub(crate) fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// Locks the role, keeping the guard only if this node is the king.
    async fn lock_if_king(&self) -> Option<MutexGuard<'_, Role>> {
        let role = self.role.lock().await;
        matches!(*role, Role::King(_)).then_some(role)
    }

    /// Stops accepting connections and ends every listener.
    async fn stop_listening(&self) {
        self.accept_shutdown.send_replace(true);
        for link in self.listeners.end_all() {
            link.close().await;
        }
    }
}

/// Handle to a running ring member. Cloning shares the same node.
#[derive(Debug, Clone)]
pub struct Node {
    core: Arc<NodeCore>,
}

impl Node {
    /// Starts a new ring with this node as its king.
    ///
    /// Port 0 in `identity` binds an OS-assigned port, which
    /// [`info`](Self::info) then reports.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConnectFailed`] if the listening socket cannot
    /// be bound.
    pub async fn start_new_network(
        identity: NodeInfo,
        config: NodeConfig,
    ) -> Result<(Self, mpsc::Receiver<NodeEvent>), NodeError> {
        let (socket, info) = bind(&identity).await?;
        let (core, events) = NodeCore::new(
            info.clone(),
            config,
            Role::King(KingLogic::new(info.clone())),
        );
        tracing::info!(node = %info, "started a new ring");
        let snapshot = TopologyInfo::new(info.name.clone(), info.name.clone(), info.name.clone());
        core.emit(NodeEvent::StateChanged(UserStateChange::refresh(vec![
            snapshot,
        ])));
        listener::spawn_accept_loop(Arc::clone(&core), socket);
        Ok((Self { core }, events))
    }

    /// Joins the ring coordinated by the king reachable at `king`. Only the
    /// address and port of `king` are used; its name is learned from the
    /// handshake.
    ///
    /// Returns once the king has announced the new member to the ring, so
    /// every member knows about it when this call completes.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::ConnectFailed`] when the king is unreachable,
    /// the name is already taken, or the handshake fails.
    pub async fn connect_to_remote_king(
        king: NodeInfo,
        identity: NodeInfo,
        config: NodeConfig,
    ) -> Result<(Self, mpsc::Receiver<NodeEvent>), NodeError> {
        let (socket, info) = bind(&identity).await?;
        let timeout = config.connect_timeout;
        let failed = |e: LinkError| NodeError::ConnectFailed(e.to_string());

        let contact = Peer::connect(king, timeout).await.map_err(failed)?;
        let exchange = contact.link.exchange().await;
        let reply = exchange
            .request(Message::new(
                MessageType::Greetings,
                "",
                &info,
                Some(&contact.info),
            ))
            .await
            .map_err(failed)?;
        match reply.kind {
            MessageType::Greetings => {}
            MessageType::Reject if reply.content == REJECT_NAME_TAKEN => {
                drop(exchange);
                contact.link.close().await;
                return Err(NodeError::ConnectFailed(format!(
                    "the name {} is already taken",
                    info.name
                )));
            }
            other => {
                drop(exchange);
                contact.link.close().await;
                return Err(NodeError::ConnectFailed(format!(
                    "unexpected {other} reply to the greeting"
                )));
            }
        }
        let right_info = exchange.read_identity().await.map_err(failed)?;
        let king_info = reply.sender;

        let joined = async {
            let left = Peer::connect(king_info.clone(), timeout).await?;
            let right = Peer::connect(right_info.clone(), timeout).await?;
            let probe = Message::new(MessageType::Name, "", &info, Some(&right_info));
            let answer = right.link.request(probe).await?;
            tracing::debug!(node = %info.name, right = %answer.content, "right neighbor answered");
            Ok::<_, LinkError>((left, right))
        };
        let (left, right) = match joined.await {
            Ok(links) => links,
            Err(e) => {
                tracing::warn!(node = %info.name, peer = %right_info.name, err = %e, "could not reach the right neighbor");
                let abandon = Message::new(MessageType::Reject, "", &info, Some(&king_info));
                if let Err(e) = exchange.send(abandon).await {
                    tracing::debug!(node = %info.name, err = %e, "could not abandon the join");
                }
                drop(exchange);
                contact.link.close().await;
                return Err(NodeError::ConnectFailed(format!(
                    "right neighbor {} is unreachable: {e}",
                    right_info.name
                )));
            }
        };

        exchange
            .send(Message::new(
                MessageType::Confirm,
                "",
                &info,
                Some(&king_info),
            ))
            .await
            .map_err(failed)?;
        let users = exchange.read_message().await.map_err(failed)?;
        drop(exchange);
        tracing::info!(node = %info, king = %king_info.name, users = %users.content, "joined the ring");

        let king = Peer {
            info: king_info,
            link: contact.link,
        };
        let peasant = PeasantLogic::new(info.clone(), king, left, right);
        let (core, events) = NodeCore::new(info, config, Role::Peasant(peasant));
        listener::spawn_accept_loop(Arc::clone(&core), socket);

        let mut welcomed = core.welcomed.subscribe();
        let announced = tokio::time::timeout(WELCOME_TIMEOUT, welcomed.wait_for(|done| *done))
            .await
            .is_ok_and(|seen| seen.is_ok());
        if !announced {
            tracing::warn!(node = %core.info.name, "the king did not finish announcing the join");
        }
        Ok((Self { core }, events))
    }

    /// Sends a chat line to everyone in the ring and shows it locally.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::OperationFailed`] if the king does not confirm
    /// the message, and [`NodeError::NotLoggedIn`] after log-off.
    pub async fn send_message(&self, text: &str) -> Result<(), NodeError> {
        self.ensure_logged_in()?;
        let core = &self.core;
        if let Some(mut role) = core.lock_if_king().await {
            if let Role::King(king) = &mut *role {
                let message = Message::new(MessageType::Chat, text, &core.info, None);
                king.broadcast(core, &message).await;
            }
        } else {
            let reply = core.ask_king(MessageType::Chat, text).await?;
            if reply.kind != MessageType::Confirm {
                return Err(NodeError::OperationFailed(format!(
                    "the king answered {} instead of confirming the message",
                    reply.kind
                )));
            }
        }
        core.emit(NodeEvent::ChatLine(format_line(&core.info.name, text)));
        Ok(())
    }

    /// Lists the names of every member that answers, king first.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::OperationFailed`] if the king is gone.
    pub async fn get_online_users(&self) -> Result<String, NodeError> {
        self.ensure_logged_in()?;
        let core = &self.core;
        if let Some(mut role) = core.lock_if_king().await {
            if let Role::King(king) = &mut *role {
                return Ok(king.online_users(core, &core.info.name).await);
            }
        }
        let reply = core.ask_king(MessageType::OnlineUsers, "").await?;
        if reply.kind == MessageType::OnlineUsers {
            Ok(reply.content)
        } else {
            tracing::warn!(node = %core.info.name, kind = %reply.kind, "unexpected reply to online users");
            Ok("online users are not available right now".to_string())
        }
    }

    /// Every member's neighbors, the king's snapshot first.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::OperationFailed`] naming the member that died
    /// while the topology was collected.
    pub async fn get_topology_info(&self) -> Result<Vec<TopologyInfo>, NodeError> {
        self.ensure_logged_in()?;
        let core = &self.core;
        if let Some(mut role) = core.lock_if_king().await {
            if let Role::King(king) = &mut *role {
                return king.topology(core).await;
            }
        }
        let reply = core.ask_king(MessageType::MapTopology, "").await?;
        match reply.kind {
            MessageType::Confirm => reply
                .topology()
                .map_err(|e| NodeError::OperationFailed(format!("malformed topology reply: {e}"))),
            MessageType::Reject => Err(NodeError::OperationFailed(reply.content)),
            other => Err(NodeError::OperationFailed(format!(
                "unexpected {other} reply to the topology request"
            ))),
        }
    }

    /// Leaves the ring gracefully. A king hands the ring to its heir; a
    /// peasant asks the king to repair around it.
    pub async fn log_off(&self) {
        let core = &self.core;
        if !core.logged_in.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node = %core.info.name, "logging off");
        core.stop_listening().await;

        let mut role = core.role.lock().await;
        match &mut *role {
            Role::King(king) => {
                king.hand_over().await;
                king.close_all().await;
            }
            Role::Peasant(peasant) => {
                let king = peasant.king();
                let notice = Message::new(
                    MessageType::TopologyChanged,
                    core.info.name.clone(),
                    &core.info,
                    Some(&king.info),
                );
                if let Err(e) = king.link.send(notice).await {
                    tracing::warn!(node = %core.info.name, err = %e, "could not tell the king about leaving");
                }
                peasant.close_all().await;
            }
        }
    }

    /// Drops every connection without telling anyone, as if the process
    /// had crashed.
    pub async fn abort(&self) {
        let core = &self.core;
        if !core.logged_in.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(node = %core.info.name, "aborting");
        core.stop_listening().await;

        let mut role = core.role.lock().await;
        match &mut *role {
            Role::King(king) => king.close_all().await,
            Role::Peasant(peasant) => peasant.close_all().await,
        }
    }

    /// Whether this node currently coordinates the ring.
    #[must_use]
    pub fn is_king(&self) -> bool {
        self.core.is_king()
    }

    /// Whether the node is still part of a ring.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.core.is_logged_in()
    }

    /// This node's identity, with the port actually bound.
    #[must_use]
    pub fn info(&self) -> &NodeInfo {
        &self.core.info
    }

    /// Identity of the king this node follows, itself when it is the king.
    pub async fn king_info(&self) -> NodeInfo {
        self.core
            .with_peasant(|p| p.king().info.clone())
            .await
            .unwrap_or_else(|| self.core.info.clone())
    }

    /// `address:port` of the current king.
    pub async fn king_address(&self) -> String {
        self.king_info().await.endpoint()
    }

    fn ensure_logged_in(&self) -> Result<(), NodeError> {
        if self.is_logged_in() {
            Ok(())
        } else {
            Err(NodeError::NotLoggedIn)
        }
    }
}

/// Binds the node's listening socket and fills in the real port.
async fn bind(identity: &NodeInfo) -> Result<(TcpListener, NodeInfo), NodeError> {
    let listener = TcpListener::bind(identity.endpoint()).await.map_err(|e| {
        NodeError::ConnectFailed(format!("could not listen on {}: {e}", identity.endpoint()))
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| NodeError::ConnectFailed(e.to_string()))?
        .port();
    Ok((listener, identity.with_port(port)))
}
