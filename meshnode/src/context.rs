use std::sync::{Arc, Weak};

use crate::{
    envelope::RequestId,
    identity::{ConnectionDirection, NodeIdentity, PeerInfo, PeerType},
    session::Session,
};

/// Per-call information handed to every method handler.
#[derive(Clone, Debug)]
pub struct Context {
    pub peer: PeerInfo,
    pub request_id: Option<RequestId>,
    session: Weak<Session>,
}

impl Context {
    #[must_use]
    pub(crate) fn for_session(session: &Arc<Session>, request_id: Option<RequestId>) -> Self {
        Self {
            peer: session.peer().clone(),
            request_id,
            session: Arc::downgrade(session),
        }
    }

    /// A context for calls that did not arrive over a session.
    #[must_use]
    pub fn local() -> Self {
        Self {
            peer: PeerInfo::new("local", PeerType::Control, ConnectionDirection::Incoming),
            request_id: None,
            session: Weak::new(),
        }
    }

    /// The session the call arrived on, if it is still open.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade().filter(|session| !session.is_closed())
    }

    #[must_use]
    pub fn caller(&self) -> Option<NodeIdentity> {
        self.session
            .upgrade()
            .and_then(|session| session.identity().cloned())
            .or_else(|| self.peer.identity.clone())
    }

    #[must_use]
    pub fn peer_type(&self) -> PeerType {
        self.peer.peer_type
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::local()
    }
}
