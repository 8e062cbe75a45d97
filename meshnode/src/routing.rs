//! Directly connected peers and distance-vector routes learned from them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};

use foldhash::fast::RandomState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    Session,
    error::{Error, ErrorKind, Result},
    identity::NodeIdentity,
};

pub const MAX_HOPS: u32 = 30;

/// `target` is reachable through the directly connected peer `via`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub target: Uuid,
    pub via: Uuid,
    pub hops: u32,
}

impl Route {
    #[must_use]
    pub fn new(target: Uuid, via: Uuid, hops: u32) -> Self {
        Self { target, via, hops }
    }
}

/// A set of routes with at most one entry per `(target, via)`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct RouteList {
    routes: Vec<Route>,
}

impl RouteList {
    /// Adds `route`, replacing an existing one with the same target and via.
    pub fn add(&mut self, route: Route) {
        match self
            .routes
            .iter_mut()
            .find(|r| r.target == route.target && r.via == route.via)
        {
            Some(existing) => *existing = route,
            None => self.routes.push(route),
        }
    }

    #[must_use]
    pub fn contains(&self, route: &Route) -> bool {
        self.routes.contains(route)
    }

    #[must_use]
    pub fn route_to(&self, target: &Uuid) -> Option<&Route> {
        self.routes.iter().find(|r| &r.target == target)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromIterator<Route> for RouteList {
    fn from_iter<T: IntoIterator<Item = Route>>(iter: T) -> Self {
        let mut list = RouteList::default();
        for route in iter {
            list.add(route);
        }
        list
    }
}

/// Wire shape of one entry of `node.getDirectlyConnectedNodes`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedNode {
    pub state: String,
    pub peer_address: String,
    pub peer_identifier: String,
}

struct DirectPeer {
    identity: NodeIdentity,
    address: String,
    session: Weak<Session>,
}

#[derive(Default)]
struct RoutingState {
    peers: HashMap<Uuid, DirectPeer, RandomState>,
    /// target → via → hops
    candidates: HashMap<Uuid, BTreeMap<Uuid, u32>, RandomState>,
    active: BTreeMap<Uuid, Route>,
    /// Last route list advertised by each peer.
    peer_routes: HashMap<Uuid, RouteList, RandomState>,
}

impl RoutingState {
    fn add_candidate(&mut self, own: &Uuid, route: Route) -> bool {
        if route.target == *own || route.hops == 0 || route.hops > MAX_HOPS {
            return false;
        }
        if !self.peers.contains_key(&route.via) {
            return false;
        }
        self.candidates
            .entry(route.target)
            .or_default()
            .insert(route.via, route.hops);

        match self.active.get(&route.target) {
            Some(active) if active.via == route.via => {
                self.recompute(route.target);
                true
            }
            Some(active) if route.hops >= active.hops => false,
            _ => {
                self.active.insert(route.target, route);
                true
            }
        }
    }

    fn remove_candidate(&mut self, route: &Route) {
        let Some(vias) = self.candidates.get_mut(&route.target) else {
            return;
        };
        if vias.remove(&route.via).is_none() {
            return;
        }
        if vias.is_empty() {
            self.candidates.remove(&route.target);
        }
        if self
            .active
            .get(&route.target)
            .is_some_and(|active| active.via == route.via)
        {
            self.recompute(route.target);
        }
    }

    /// Picks the shortest remaining candidate, lowest via uuid on ties.
    fn recompute(&mut self, target: Uuid) {
        let best = self.candidates.get(&target).and_then(|vias| {
            vias.iter()
                .min_by_key(|(via, hops)| (**hops, **via))
                .map(|(via, hops)| Route::new(target, *via, *hops))
        });
        match best {
            Some(route) => self.active.insert(target, route),
            None => self.active.remove(&target),
        };
    }

    fn purge_via(&mut self, via: &Uuid) {
        let stale: Vec<Route> = self
            .candidates
            .iter()
            .filter_map(|(target, vias)| {
                vias.get(via).map(|hops| Route::new(*target, *via, *hops))
            })
            .collect();
        for route in &stale {
            self.remove_candidate(route);
        }
    }

    fn remove_peer(&mut self, uuid: &Uuid) {
        if let Some(advertised) = self.peer_routes.remove(uuid) {
            for route in advertised.iter() {
                self.remove_candidate(route);
            }
        }
        self.purge_via(uuid);
        if let Some(peer) = self.peers.remove(uuid) {
            tracing::info!("directly connected peer is gone: {}", peer.identity);
        }
    }
}

/// Next-hop resolution for targeted requests.
///
/// Holds only weak references to sessions; the connection registry owns
/// them. Every candidate's `via` is a directly connected peer.
pub struct RoutingTable {
    own: NodeIdentity,
    state: Mutex<RoutingState>,
}

impl RoutingTable {
    #[must_use]
    pub fn new(own: NodeIdentity) -> Self {
        Self {
            own,
            state: Mutex::default(),
        }
    }

    #[must_use]
    pub fn own_identity(&self) -> &NodeIdentity {
        &self.own
    }

    #[must_use]
    pub fn has_peer(&self, uuid: &Uuid) -> bool {
        self.state.lock().peers.contains_key(uuid)
    }

    /// Registers a directly connected peer.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyExists` if the peer is already registered.
    pub fn add_peer(&self, identity: NodeIdentity, session: &Arc<Session>) -> Result<()> {
        let mut state = self.state.lock();
        if state.peers.contains_key(&identity.uuid) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("cannot add peer twice: {identity}"),
            ));
        }
        tracing::info!("new directly connected peer: {identity}");
        state.peers.insert(
            identity.uuid,
            DirectPeer {
                identity,
                address: session.peer().address.clone(),
                session: Arc::downgrade(session),
            },
        );
        Ok(())
    }

    /// Forgets `uuid` together with every route via it and every route it
    /// advertised.
    pub fn remove_peer(&self, uuid: &Uuid) {
        self.state.lock().remove_peer(uuid);
    }

    /// Removes the peer only if it is registered with `session`.
    ///
    /// Returns whether the peer was removed.
    pub fn remove_session(&self, uuid: &Uuid, session: &Session) -> bool {
        let mut state = self.state.lock();
        let registered = state
            .peers
            .get(uuid)
            .is_some_and(|peer| std::ptr::eq(peer.session.as_ptr(), session));
        if registered {
            state.remove_peer(uuid);
        }
        registered
    }

    /// Installs the route list advertised by `peer`.
    ///
    /// The list is diffed against the previous advertisement of the same
    /// peer, so repeating an advertisement changes nothing.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` for a peer that is not directly connected.
    pub fn set_peer_routes(&self, peer: &Uuid, routes: RouteList) -> Result<()> {
        let mut state = self.state.lock();
        if !state.peers.contains_key(peer) {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("rejecting routing table for unknown peer {peer}"),
            ));
        }

        let previous = state.peer_routes.remove(peer).unwrap_or_default();
        for route in previous.iter().filter(|r| !routes.contains(r)) {
            state.remove_candidate(route);
        }
        let mut accepted = RouteList::default();
        for route in routes.iter() {
            if route.via != *peer {
                tracing::warn!(
                    "ignoring route to {} via {} advertised by {peer}",
                    route.target,
                    route.via
                );
                continue;
            }
            if previous.contains(route) || state.add_candidate(&self.own.uuid, *route) {
                accepted.add(*route);
            } else if state
                .candidates
                .get(&route.target)
                .is_some_and(|vias| vias.contains_key(&route.via))
            {
                // kept as a candidate, just not the active route.
                accepted.add(*route);
            }
        }
        state.peer_routes.insert(*peer, accepted);
        Ok(())
    }

    /// The session requests for `target` have to be written to.
    #[must_use]
    pub fn connection_for(&self, target: &Uuid) -> Option<Arc<Session>> {
        let state = self.state.lock();
        if let Some(peer) = state.peers.get(target) {
            return peer.session.upgrade();
        }
        let route = state.active.get(target)?;
        state.peers.get(&route.via)?.session.upgrade()
    }

    #[must_use]
    pub fn active_routes(&self) -> RouteList {
        self.state.lock().active.values().copied().collect()
    }

    #[must_use]
    pub fn directly_connected(&self) -> Vec<NodeIdentity> {
        let state = self.state.lock();
        let mut peers: Vec<_> = state.peers.values().map(|p| p.identity.clone()).collect();
        peers.sort_by_key(|identity| identity.uuid);
        peers
    }

    /// Directly connected nodes keyed by uuid, as served to other nodes.
    #[must_use]
    pub fn connected_nodes(&self) -> BTreeMap<String, ConnectedNode> {
        self.state
            .lock()
            .peers
            .values()
            .map(|peer| {
                (
                    peer.identity.uuid.to_string(),
                    ConnectedNode {
                        state: "connected".to_string(),
                        peer_address: peer.address.clone(),
                        peer_identifier: peer.identity.uuid.to_string(),
                    },
                )
            })
            .collect()
    }

    /// Every identity a targeted request could currently reach.
    #[must_use]
    pub fn reachable(&self) -> Vec<Uuid> {
        let state = self.state.lock();
        let mut reachable: Vec<Uuid> = state
            .peers
            .keys()
            .chain(state.active.keys())
            .copied()
            .collect();
        reachable.sort();
        reachable.dedup();
        reachable
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RoutingTable")
            .field("own", &self.own)
            .field("peers", &state.peers.len())
            .field("active", &state.active.len())
            .finish()
    }
}
