use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a node: its uuid plus a display name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub uuid: Uuid,
    pub name: String,
}

impl NodeIdentity {
    #[must_use]
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
        }
    }

    /// Identity announced through a certificate whose common name is the
    /// node uuid.
    ///
    /// # Errors
    ///
    /// Fails if the common name is not a uuid.
    pub fn from_common_name(common_name: &str) -> crate::Result<Self> {
        let uuid = Uuid::parse_str(common_name.trim())?;
        Ok(Self::new(uuid, common_name.trim()))
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name == self.uuid.to_string() {
            write!(f, "{}", self.uuid)
        } else {
            write!(f, "{} ({})", self.name, self.uuid)
        }
    }
}

/// Trust level assigned to the remote end of a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    /// Certificate validated against the local trust store.
    Peer,
    /// Administrative access.
    Control,
    Anonymous,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

impl PeerType {
    /// Incoming connections are administrative regardless of certificate
    /// validity. Outgoing ones are peers only if the trust store vouches
    /// for them.
    #[must_use]
    pub fn classify(direction: ConnectionDirection, trusted: bool) -> Self {
        match (direction, trusted) {
            (ConnectionDirection::Incoming, _) => PeerType::Control,
            (ConnectionDirection::Outgoing, true) => PeerType::Peer,
            (ConnectionDirection::Outgoing, false) => PeerType::Anonymous,
        }
    }
}

/// What a session knows about its remote end.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub address: String,
    pub identity: Option<NodeIdentity>,
    pub peer_type: PeerType,
    pub direction: ConnectionDirection,
}

impl PeerInfo {
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        peer_type: PeerType,
        direction: ConnectionDirection,
    ) -> Self {
        Self {
            address: address.into(),
            identity: None,
            peer_type,
            direction,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
}
