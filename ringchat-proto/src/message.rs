//! The message envelope exchanged between ring members.
//!
//! Every request and reply is a [`Message`]. Its `content` is free-form
//! text whose meaning depends on the [`MessageType`]; the helpers on
//! `Message` build and parse the structured payloads the protocol uses
//! (identity lists, topology lists, election candidates, departure
//! notices).

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::identity::{NodeInfo, TopologyInfo};

/// Content of a `REJECT` sent when a joiner's name is already taken.
pub const REJECT_NAME_TAKEN: &str = "name";

/// Prefix of an `ONLINE_USERS` content announcing that a member left.
pub const DEPARTURE_PREFIX: &str = "off ";

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// What a message means. The receiving role decides how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Election message carrying a candidate id.
    KingIsDead,
    /// Announcement of a newly elected king, collecting members on its way.
    LongLiveTheKing,
    /// Join request, join reply, or new-member probe.
    Greetings,
    /// Neighbor re-pointing instruction, or a death report to the king.
    TopologyChanged,
    /// Positive reply.
    Confirm,
    /// Negative reply.
    Reject,
    /// Chat line.
    Chat,
    /// Request for topology snapshots.
    MapTopology,
    /// Request for, or list of, online users; also departure notices.
    OnlineUsers,
    /// Liveness probe answered with the node's name.
    Name,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::KingIsDead => "KING_IS_DEAD",
            Self::LongLiveTheKing => "LONG_LIVE_THE_KING",
            Self::Greetings => "GREETINGS",
            Self::TopologyChanged => "TOPOLOGY_CHANGED",
            Self::Confirm => "CONFIRM",
            Self::Reject => "REJECT",
            Self::Chat => "CHAT",
            Self::MapTopology => "MAP_TOPOLOGY",
            Self::OnlineUsers => "ONLINE_USERS",
            Self::Name => "NAME",
        };
        f.write_str(s)
    }
}

/// An immutable protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// When the message was created on the sender.
    pub timestamp: Timestamp,
    /// Type-dependent payload.
    pub content: String,
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Who sent the message.
    pub sender: NodeInfo,
    /// Who the message is for, when known.
    pub recipient: Option<NodeInfo>,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(
        kind: MessageType,
        content: impl Into<String>,
        sender: &NodeInfo,
        recipient: Option<&NodeInfo>,
    ) -> Self {
        Self {
            timestamp: Timestamp::now(),
            content: content.into(),
            kind,
            sender: sender.clone(),
            recipient: recipient.cloned(),
        }
    }

    /// Creates a message whose content is a list of identities.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the list cannot be encoded.
    pub fn with_identities(
        kind: MessageType,
        identities: &[NodeInfo],
        sender: &NodeInfo,
        recipient: Option<&NodeInfo>,
    ) -> Result<Self, CodecError> {
        let content = serde_json::to_string(identities)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        Ok(Self::new(kind, content, sender, recipient))
    }

    /// Creates a message whose content is a list of topology snapshots.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the list cannot be encoded.
    pub fn with_topology(
        kind: MessageType,
        snapshots: &[TopologyInfo],
        sender: &NodeInfo,
        recipient: Option<&NodeInfo>,
    ) -> Result<Self, CodecError> {
        let content = serde_json::to_string(snapshots)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        Ok(Self::new(kind, content, sender, recipient))
    }

    /// Creates a `KING_IS_DEAD` election message carrying `candidate`.
    pub fn election(candidate: u64, sender: &NodeInfo, recipient: &NodeInfo) -> Self {
        Self::new(
            MessageType::KingIsDead,
            candidate.to_string(),
            sender,
            Some(recipient),
        )
    }

    /// Creates an `ONLINE_USERS` notice that `departed` left the ring.
    pub fn departure(departed: &str, sender: &NodeInfo, recipient: &NodeInfo) -> Self {
        Self::new(
            MessageType::OnlineUsers,
            format!("{DEPARTURE_PREFIX}{departed}"),
            sender,
            Some(recipient),
        )
    }

    /// Parses the content as a list of identities. Empty content is an
    /// empty list.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the content is not an
    /// identity list.
    pub fn identities(&self) -> Result<Vec<NodeInfo>, CodecError> {
        if self.content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.content).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Parses the content as a list of topology snapshots.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the content is not a
    /// topology list.
    pub fn topology(&self) -> Result<Vec<TopologyInfo>, CodecError> {
        serde_json::from_str(&self.content).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Parses the content as an election candidate id.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidFrame` if the content is not a number.
    pub fn candidate(&self) -> Result<u64, CodecError> {
        self.content.trim().parse().map_err(|_| {
            CodecError::InvalidFrame(format!("not an election candidate: {:?}", self.content))
        })
    }

    /// The name carried by a departure notice, if this is one.
    #[must_use]
    pub fn departed_name(&self) -> Option<&str> {
        if self.kind != MessageType::OnlineUsers {
            return None;
        }
        self.content.strip_prefix(DEPARTURE_PREFIX)
    }

    /// Name of the sender.
    #[must_use]
    pub fn sender_name(&self) -> &str {
        &self.sender.name
    }
}
