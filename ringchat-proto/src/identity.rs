//! Node identities and topology snapshots, the nouns of the ring protocol.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Connection parameters and display name of a ring member.
///
/// The name is the identity key. Two `NodeInfo` values with the same name
/// compare equal and hash identically even if their address or port
/// differ; address and port are only used to open connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// IP address or host name the node listens on.
    pub address: String,
    /// TCP port the node listens on.
    pub port: u16,
    /// Unique member name.
    pub name: String,
}

impl NodeInfo {
    /// Creates a new identity.
    pub fn new(address: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            name: name.into(),
        }
    }

    /// Returns a copy of this identity listening on a different port.
    ///
    /// Used after binding to port 0, once the OS-assigned port is known.
    #[must_use]
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            address: self.address.clone(),
            port,
            name: self.name.clone(),
        }
    }

    /// The `address:port` pair suitable for `TcpStream::connect`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Numeric candidate id used by the leader election.
    ///
    /// Derived from the name only, with a hash that is stable across
    /// processes and platforms, so every member computes the same id for
    /// the same peer.
    #[must_use]
    pub fn election_id(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.name.as_bytes())
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for NodeInfo {}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.address, self.port)
    }
}

/// A node's view of its place in the ring: its own name and the names of
/// its two neighbors. Produced on demand and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyInfo {
    /// Name of the node this snapshot describes.
    pub node_name: String,
    /// Name of its left neighbor.
    pub left_name: String,
    /// Name of its right neighbor.
    pub right_name: String,
}

impl TopologyInfo {
    /// Creates a snapshot.
    pub fn new(
        node_name: impl Into<String>,
        left_name: impl Into<String>,
        right_name: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            left_name: left_name.into(),
            right_name: right_name.into(),
        }
    }
}

impl std::fmt::Display for TopologyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (left: {}, right: {})",
            self.node_name, self.left_name, self.right_name
        )
    }
}
