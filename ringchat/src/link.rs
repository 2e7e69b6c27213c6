//! Point-to-point connection to one ring member.
//!
//! A [`Link`] wraps one TCP stream carrying newline-delimited
//! [`Frame`]s. Fire-and-forget sends only take the writer lock, while
//! request/response exchanges hold the link's exchange lock so at most one
//! exchange is in flight per link. Closing a link is idempotent and wakes
//! any task blocked reading from it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, MutexGuard, watch};

use ringchat_proto::codec::{self, CodecError, Frame};
use ringchat_proto::identity::{NodeInfo, TopologyInfo};
use ringchat_proto::message::Message;
use ringchat_proto::presence::UserStateChange;

/// Default upper bound on establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors that can occur on a [`Link`].
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The peer could not be reached within the connect timeout.
    #[error("could not connect to {peer}: {reason}")]
    ConnectFailed {
        /// Endpoint that was dialed.
        peer: String,
        /// Why the attempt failed.
        reason: String,
    },

    /// The stream ended, errored, or the link was closed locally.
    #[error("peer {0} is unreachable")]
    PeerUnreachable(String),

    /// A record arrived with a different shape than the protocol step expects.
    #[error("expected a {expected} record, got {found}")]
    UnexpectedFrame {
        /// Shape the caller asked for.
        expected: &'static str,
        /// Shape that actually arrived.
        found: &'static str,
    },

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Socket setup failed.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bidirectional, ordered channel to exactly one peer.
pub struct Link {
    label: String,
    reader: Mutex<Option<BufReader<OwnedReadHalf>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    exchange: Mutex<()>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Opens an outgoing link to `peer`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ConnectFailed`] if the connection is refused or
    /// does not complete in time.
    pub async fn connect(peer: &NodeInfo, timeout: Duration) -> Result<Self, LinkError> {
        let endpoint = peer.endpoint();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| {
                tracing::debug!(peer = %peer.name, endpoint = %endpoint, "connect timed out");
                LinkError::ConnectFailed {
                    peer: endpoint.clone(),
                    reason: format!("timed out after {}ms", timeout.as_millis()),
                }
            })?
            .map_err(|e| {
                tracing::debug!(peer = %peer.name, endpoint = %endpoint, err = %e, "connect failed");
                LinkError::ConnectFailed {
                    peer: endpoint.clone(),
                    reason: e.to_string(),
                }
            })?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, peer.name.clone()))
    }

    /// Wraps a stream produced by the accept loop. The peer's name is not
    /// known until it sends its first message.
    #[must_use]
    pub fn accepted(stream: TcpStream) -> Self {
        let label = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %label, err = %e, "could not disable Nagle");
        }
        Self::from_stream(stream, label)
    }

    fn from_stream(stream: TcpStream, label: String) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Self {
            label,
            reader: Mutex::new(Some(BufReader::new(read_half))),
            writer: Mutex::new(Some(write_half)),
            exchange: Mutex::new(()),
            closed,
        }
    }

    /// Peer name for outgoing links, remote socket address for accepted ones.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Writes one record without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::PeerUnreachable`] if the link is closed or the
    /// write fails.
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<(), LinkError> {
        let line = codec::encode_line(&frame.into())?;
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(self.unreachable());
        };
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            tracing::debug!(peer = %self.label, err = %e, "write failed");
            return Err(self.unreachable());
        }
        Ok(())
    }

    /// Sends `message` and waits for one message in reply.
    ///
    /// # Errors
    ///
    /// Fails if either the send or the read fails.
    pub async fn request(&self, message: Message) -> Result<Message, LinkError> {
        self.exchange().await.request(message).await
    }

    /// Takes the exchange lock for a multi-record conversation.
    pub async fn exchange(&self) -> Exchange<'_> {
        Exchange {
            link: self,
            _guard: self.exchange.lock().await,
        }
    }

    /// Non-blocking poll: true when a record is buffered or the stream is
    /// immediately readable (end of stream counts as readable).
    pub async fn ready_to_read(&self) -> bool {
        let Ok(mut reader) = self.reader.try_lock() else {
            return false;
        };
        let Some(stream) = reader.as_mut() else {
            return true;
        };
        if !stream.buffer().is_empty() {
            return true;
        }
        matches!(
            tokio::time::timeout(Duration::ZERO, stream.fill_buf()).await,
            Ok(_)
        )
    }

    /// Blocks until one record arrives.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::PeerUnreachable`] when the stream ends, errors,
    /// or the link is closed while waiting, and [`LinkError::Codec`] for a
    /// record longer than [`codec::MAX_LINE_BYTES`]. A link that sent an
    /// over-long record is not read again.
    pub async fn read_frame(&self) -> Result<Frame, LinkError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(self.unreachable());
        }
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Err(self.unreachable());
        };

        let mut line = String::new();
        let limit = codec::MAX_LINE_BYTES as u64 + 1;
        let mut limited = (&mut *stream).take(limit);
        let outcome = tokio::select! {
            read = limited.read_line(&mut line) => Some(read),
            _ = closed.changed() => None,
        };
        let Some(read) = outcome else {
            reader.take();
            return Err(self.unreachable());
        };
        match read {
            Ok(0) => Err(self.unreachable()),
            Ok(_) if line.len() > codec::MAX_LINE_BYTES && !line.ends_with('\n') => {
                tracing::warn!(peer = %self.label, "record too long, dropping the stream");
                reader.take();
                Err(CodecError::LineTooLong {
                    limit: codec::MAX_LINE_BYTES,
                }
                .into())
            }
            Ok(_) => Ok(codec::decode_line(&line)?),
            Err(e) => {
                tracing::debug!(peer = %self.label, err = %e, "read failed");
                Err(self.unreachable())
            }
        }
    }

    /// Reads one record that must be a [`Message`].
    ///
    /// # Errors
    ///
    /// See [`read_frame`](Self::read_frame); also fails with
    /// [`LinkError::UnexpectedFrame`] for any other record shape.
    pub async fn read_message(&self) -> Result<Message, LinkError> {
        match self.read_frame().await? {
            Frame::Message(message) => Ok(message),
            other => Err(unexpected("message", &other)),
        }
    }

    /// Reads one record that must be a bare identity.
    ///
    /// # Errors
    ///
    /// See [`read_message`](Self::read_message).
    pub async fn read_identity(&self) -> Result<NodeInfo, LinkError> {
        match self.read_frame().await? {
            Frame::Identity(info) => Ok(info),
            other => Err(unexpected("identity", &other)),
        }
    }

    /// Reads one record that must be a bare topology snapshot.
    ///
    /// # Errors
    ///
    /// See [`read_message`](Self::read_message).
    pub async fn read_topology(&self) -> Result<TopologyInfo, LinkError> {
        match self.read_frame().await? {
            Frame::Topology(info) => Ok(info),
            other => Err(unexpected("topology", &other)),
        }
    }

    /// Reads one record that must be a presence update.
    ///
    /// # Errors
    ///
    /// See [`read_message`](Self::read_message).
    pub async fn read_user_change(&self) -> Result<UserStateChange, LinkError> {
        match self.read_frame().await? {
            Frame::UserChange(change) => Ok(change),
            other => Err(unexpected("user_change", &other)),
        }
    }

    /// Closes the link. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        tracing::trace!(peer = %self.label, "closing link");
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Some(mut stream) = self.writer.lock().await.take()
            && let Err(e) = stream.shutdown().await
        {
            tracing::trace!(peer = %self.label, err = %e, "shutdown after close failed");
        }
    }

    fn unreachable(&self) -> LinkError {
        LinkError::PeerUnreachable(self.label.clone())
    }
}

fn unexpected(expected: &'static str, found: &Frame) -> LinkError {
    LinkError::UnexpectedFrame {
        expected,
        found: found.kind(),
    }
}

/// A multi-record conversation on one link, holding its exchange lock.
pub struct Exchange<'a> {
    link: &'a Link,
    _guard: MutexGuard<'a, ()>,
}

impl Exchange<'_> {
    /// Writes one record.
    ///
    /// # Errors
    ///
    /// See [`Link::send`].
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<(), LinkError> {
        self.link.send(frame).await
    }

    /// Sends `message` and reads the reply message.
    ///
    /// # Errors
    ///
    /// See [`Link::send`] and [`Link::read_message`].
    pub async fn request(&self, message: Message) -> Result<Message, LinkError> {
        self.link.send(message).await?;
        self.link.read_message().await
    }

    /// Reads one message.
    ///
    /// # Errors
    ///
    /// See [`Link::read_message`].
    pub async fn read_message(&self) -> Result<Message, LinkError> {
        self.link.read_message().await
    }

    /// Reads one bare identity.
    ///
    /// # Errors
    ///
    /// See [`Link::read_identity`].
    pub async fn read_identity(&self) -> Result<NodeInfo, LinkError> {
        self.link.read_identity().await
    }

    /// Reads one bare topology snapshot.
    ///
    /// # Errors
    ///
    /// See [`Link::read_topology`].
    pub async fn read_topology(&self) -> Result<TopologyInfo, LinkError> {
        self.link.read_topology().await
    }
}

/// A ring member as seen from a node holding an outgoing link to it.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Who the link leads to.
    pub info: NodeInfo,
    /// Outgoing link used for requests to that member.
    pub link: Arc<Link>,
}

impl Peer {
    /// Connects to `info` and wraps the resulting link.
    ///
    /// # Errors
    ///
    /// See [`Link::connect`].
    pub async fn connect(info: NodeInfo, timeout: Duration) -> Result<Self, LinkError> {
        let link = Link::connect(&info, timeout).await?;
        Ok(Self {
            info,
            link: Arc::new(link),
        })
    }

    /// The member's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }
}
