//! Online/offline state changes pushed from the king to members and
//! surfaced to front-ends.

use serde::{Deserialize, Serialize};

use crate::identity::TopologyInfo;

/// Whether a member is reachable in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Member joined and is reachable.
    Online,
    /// Member left or was declared dead.
    Offline,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A presence update. Every field is optional: a pure refresh carries only
/// a topology, a join or leave carries the user and the new state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStateChange {
    /// Member whose state changed.
    pub user_name: Option<String>,
    /// The member's new state.
    pub connection_state: Option<ConnectionState>,
    /// Ring snapshot taken when the change was observed.
    pub topology: Option<Vec<TopologyInfo>>,
}

impl UserStateChange {
    /// `user` came online.
    pub fn online(user: impl Into<String>) -> Self {
        Self {
            user_name: Some(user.into()),
            connection_state: Some(ConnectionState::Online),
            topology: None,
        }
    }

    /// `user` went offline.
    pub fn offline(user: impl Into<String>) -> Self {
        Self {
            user_name: Some(user.into()),
            connection_state: Some(ConnectionState::Offline),
            topology: None,
        }
    }

    /// A topology refresh without a specific user.
    #[must_use]
    pub fn refresh(topology: Vec<TopologyInfo>) -> Self {
        Self {
            user_name: None,
            connection_state: None,
            topology: Some(topology),
        }
    }

    /// Attaches a topology snapshot.
    #[must_use]
    pub fn with_topology(mut self, topology: Vec<TopologyInfo>) -> Self {
        self.topology = Some(topology);
        self
    }
}

impl std::fmt::Display for UserStateChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.user_name, self.connection_state) {
            (Some(user), Some(state)) => write!(f, "{user} is {state}"),
            (Some(user), None) => write!(f, "{user} changed"),
            _ => write!(f, "topology refreshed"),
        }
    }
}
