//! Accept loop and per-connection listener tasks.
//!
//! Every accepted connection gets one listener task that owns the
//! connection's [`Link`], reads requests from it and dispatches them to the
//! handler of the node's current role. Listeners are tracked in a
//! [`ListenerRegistry`] so the node can end the ones serving a peer that
//! died or stop all of them at log-off.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use ringchat_proto::message::{Message, MessageType};

use crate::link::{Link, LinkError};

use super::{NodeCore, king_handler, peasant_handler};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct Entry {
    id: u64,
    name: Option<String>,
    link: Arc<Link>,
    shutdown: watch::Sender<bool>,
}

/// The set of running listener tasks.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    /// Tracks a new listener. The receiver flips to `true` when the
    /// listener should stop.
    pub fn register(&self, link: Arc<Link>) -> (u64, watch::Receiver<bool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown, stop) = watch::channel(false);
        self.entries.lock().push(Entry {
            id,
            name: None,
            link,
            shutdown,
        });
        (id, stop)
    }

    /// Records which peer a listener serves, once its first message names it.
    pub fn learn_name(&self, id: u64, name: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            if entry.name.as_deref() != Some(name) {
                entry.name = Some(name.to_string());
            }
        }
    }

    /// Forgets a listener that has exited.
    pub fn remove(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    /// Signals every listener serving `name` to stop. Returns how many
    /// were signalled.
    pub fn end_by_name(&self, name: &str) -> usize {
        let entries = self.entries.lock();
        let mut ended = 0;
        for entry in entries.iter().filter(|e| e.name.as_deref() == Some(name)) {
            entry.shutdown.send_replace(true);
            ended += 1;
        }
        if ended > 0 {
            tracing::debug!(peer = %name, ended, "ending listeners");
        }
        ended
    }

    /// Signals every listener to stop and hands back their links so the
    /// caller can close them.
    pub fn end_all(&self) -> Vec<Arc<Link>> {
        let entries = self.entries.lock();
        entries
            .iter()
            .map(|entry| {
                entry.shutdown.send_replace(true);
                Arc::clone(&entry.link)
            })
            .collect()
    }

    /// Number of running listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Accepts connections until the node's accept shutdown flag is raised.
pub(crate) fn spawn_accept_loop(core: Arc<NodeCore>, listener: TcpListener) {
    let mut stop = core.accept_shutdown.subscribe();
    tokio::spawn(async move {
        tracing::debug!(node = %core.info.name, "accept loop started");
        loop {
            if *stop.borrow() || !core.is_logged_in() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(node = %core.info.name, %addr, "accepted connection");
                        spawn(Arc::clone(&core), stream);
                    }
                    Err(e) => {
                        tracing::warn!(node = %core.info.name, err = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        tracing::debug!(node = %core.info.name, "accept loop stopped");
    });
}

/// Starts a listener task for one accepted connection.
fn spawn(core: Arc<NodeCore>, stream: TcpStream) {
    let link = Arc::new(Link::accepted(stream));
    let (id, mut stop) = core.listeners.register(Arc::clone(&link));
    tokio::spawn(async move {
        run(&core, &link, id, &mut stop).await;
        core.listeners.remove(id);
        link.close().await;
        core.drain_chat_queue();
    });
}

async fn run(core: &Arc<NodeCore>, link: &Link, id: u64, stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() || !core.is_logged_in() {
            break;
        }
        if !link.ready_to_read().await {
            core.drain_chat_queue();
        }

        let read = tokio::select! {
            _ = stop.changed() => break,
            read = link.read_message() => read,
        };
        let message = match read {
            Ok(message) => message,
            Err(LinkError::UnexpectedFrame { expected, found }) => {
                tracing::warn!(node = %core.info.name, peer = %link.label(), expected, found, "skipping unexpected record");
                continue;
            }
            Err(e) => {
                tracing::debug!(node = %core.info.name, peer = %link.label(), err = %e, "listener stopping");
                break;
            }
        };

        if let Some(name) = peer_name(&message) {
            core.listeners.learn_name(id, name);
        }
        tracing::trace!(node = %core.info.name, kind = %message.kind, from = %message.sender_name(), "dispatching");
        if core.is_king() {
            king_handler::handle(core, link, message).await;
        } else {
            peasant_handler::handle(core, link, message).await;
        }
    }
}

/// Name of the member at the other end of the link, as far as `message`
/// tells. The king relays chat with the author as sender.
fn peer_name(message: &Message) -> Option<&str> {
    (message.kind != MessageType::Chat).then_some(message.sender.name.as_str())
}
