//! Line-delimited JSON framing for the ring protocol.
//!
//! Each record is one JSON object terminated by `\n`. The outer `kind` tag
//! names which of the four record shapes follows, so a reader can reject a
//! record that does not fit the current protocol step instead of
//! misinterpreting it.

use serde::{Deserialize, Serialize};

use crate::identity::{NodeInfo, TopologyInfo};
use crate::message::Message;
use crate::presence::UserStateChange;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Record is empty or its payload is not what it claims to be.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// Record does not fit in one line of at most `limit` bytes.
    #[error("record exceeds {limit} bytes")]
    LineTooLong {
        /// Largest accepted record, terminator excluded.
        limit: usize,
    },
}

/// Largest record accepted on the wire, not counting the trailing newline.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// One record on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Frame {
    /// A protocol envelope.
    Message(Message),
    /// A bare identity, e.g. the right neighbor announced to a joiner.
    Identity(NodeInfo),
    /// A bare topology snapshot, a peasant's answer to `MAP_TOPOLOGY`.
    Topology(TopologyInfo),
    /// A presence update following a probe or departure notice.
    UserChange(UserStateChange),
}

impl Frame {
    /// Short name of the record shape, used in error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Identity(_) => "identity",
            Self::Topology(_) => "topology",
            Self::UserChange(_) => "user_change",
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<NodeInfo> for Frame {
    fn from(info: NodeInfo) -> Self {
        Self::Identity(info)
    }
}

impl From<TopologyInfo> for Frame {
    fn from(info: TopologyInfo) -> Self {
        Self::Topology(info)
    }
}

impl From<UserStateChange> for Frame {
    fn from(change: UserStateChange) -> Self {
        Self::UserChange(change)
    }
}

/// Encodes a [`Frame`] as one JSON line, trailing newline included.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized,
/// or `CodecError::LineTooLong` if it exceeds [`MAX_LINE_BYTES`].
pub fn encode_line(frame: &Frame) -> Result<String, CodecError> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))?;
    if line.len() > MAX_LINE_BYTES {
        return Err(CodecError::LineTooLong {
            limit: MAX_LINE_BYTES,
        });
    }
    line.push('\n');
    Ok(line)
}

/// Decodes one line into a [`Frame`]. Surrounding whitespace, including
/// the line terminator, is ignored.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` for a blank line, or
/// `CodecError::Serialization` if the text is not a valid record.
pub fn decode_line(line: &str) -> Result<Frame, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CodecError::InvalidFrame("empty line".into()));
    }
    serde_json::from_str(trimmed).map_err(|e| CodecError::Serialization(e.to_string()))
}
