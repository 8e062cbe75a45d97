//! Composition root: identity, TLS, registry, routing, listeners and the
//! control channel of one node.

use std::{
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};

use futures_util::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::{
    ApiRegistry, Context, Dispatcher, Remote, RoutingTable, Session, TaskSupervisor,
    certs::{CertificateStore, TrustStore},
    config::NodeConfig,
    error::{Error, ErrorKind, Result},
    identity::{ConnectionDirection, NodeIdentity, PeerType},
    listener::{Incoming, Listeners},
    node_api::{NodeApi, NodeService},
    registry::{ConnectionRegistry, Connector, PeerConfig, SessionHook},
    routing::{Route, RouteList},
    session::SessionOptions,
    tls::TlsContext,
};

#[cfg(unix)]
use crate::control::ControlChannel;

/// Told about every peer session that completed the route exchange, and
/// about its end.
pub trait ConnectionSubscriber: Send + Sync + 'static {
    /// # Errors
    ///
    /// A failure is logged; other subscribers are still activated.
    fn activate(
        &self,
        peer: &NodeIdentity,
        session: &Arc<Session>,
        peer_type: PeerType,
    ) -> Result<()>;

    fn deactivate(&self, peer: &NodeIdentity);
}

type Subscribers = Arc<[Arc<dyn ConnectionSubscriber>]>;

type ApiExport = Box<dyn FnOnce(&mut ApiRegistry) + Send>;

/// Registers a certificate-authenticated session, inbound or outbound, with
/// the routing table, learns the peer's direct neighbours and tells the
/// subscribers.
///
/// When two nodes dial each other, the session registered first keeps
/// carrying the routes; the other one stays open.
#[derive(Clone)]
struct PeerLink {
    own: Uuid,
    routing: Arc<RoutingTable>,
    subscribers: Subscribers,
}

impl PeerLink {
    async fn establish(self, session: Arc<Session>) -> Result<()> {
        let peer_type = session.peer().peer_type;
        if peer_type == PeerType::Anonymous {
            return Ok(());
        }

        let ctx = Context::local();
        let remote = Remote::new(session.clone());
        let reported = match remote.get_identifier(&ctx).await {
            Ok(reported) => reported,
            // a client that serves no node API stays an administrative session.
            Err(e)
                if e.kind == ErrorKind::MethodNotFound
                    && session.peer().direction == ConnectionDirection::Incoming =>
            {
                tracing::debug!("{} does not identify itself", session.peer().address);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let name = reported.name.clone();
        let identity = NodeIdentity::new(session.confirm_identity(reported)?.uuid, name);
        if identity.uuid == self.own {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("{} is this node itself", session.peer().address),
            ));
        }

        if let Err(e) = self.routing.add_peer(identity.clone(), &session) {
            if e.kind != ErrorKind::AlreadyExists {
                return Err(e);
            }
            tracing::debug!(
                "{identity} is already connected, keeping {} as a spare session",
                session.peer().address
            );
            return Ok(());
        }
        {
            let link = self.clone();
            let identity = identity.clone();
            session.on_close(move |closed| {
                if link.routing.remove_session(&identity.uuid, closed) {
                    link.deactivate(&identity);
                }
            });
        }

        let nodes = remote.get_directly_connected_nodes(&ctx).await?;
        let routes: RouteList = nodes
            .keys()
            .filter_map(|uuid| Uuid::parse_str(uuid).ok())
            .filter(|target| *target != self.own && *target != identity.uuid)
            .map(|target| Route::new(target, identity.uuid, 1))
            .collect();
        tracing::debug!("{identity} advertises {} routes", routes.len());
        self.routing.set_peer_routes(&identity.uuid, routes)?;

        self.activate(&identity, &session, peer_type);
        Ok(())
    }

    fn activate(&self, identity: &NodeIdentity, session: &Arc<Session>, peer_type: PeerType) {
        for subscriber in self.subscribers.iter() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| {
                subscriber.activate(identity, session, peer_type)
            })) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("activating a subscriber for {identity} failed: {e}"),
                Err(_) => tracing::error!("a subscriber panicked while activating {identity}"),
            }
        }
    }

    fn deactivate(&self, identity: &NodeIdentity) {
        for subscriber in self.subscribers.iter() {
            let deactivated =
                std::panic::catch_unwind(AssertUnwindSafe(|| subscriber.deactivate(identity)));
            if deactivated.is_err() {
                tracing::error!("a subscriber panicked while deactivating {identity}");
            }
        }
    }
}

impl SessionHook for PeerLink {
    fn on_established(&self, session: Arc<Session>) -> BoxFuture<'static, Result<()>> {
        self.clone().establish(session).boxed()
    }
}

/// Opens outbound sessions: TCP connect, TLS handshake, session start.
struct PeerConnector {
    node: Weak<Node>,
}

impl Connector for PeerConnector {
    fn connect(
        &self,
        address: &str,
        peer: &PeerConfig,
    ) -> BoxFuture<'static, Result<Arc<Session>>> {
        let node = self.node.clone();
        let address = address.to_string();
        let fingerprint = peer.fingerprint.clone();
        async move {
            let node = node.upgrade().ok_or_else(Error::connection_closed)?;
            node.open_session(&address, fingerprint.as_deref()).await
        }
        .boxed()
    }
}

pub struct NodeBuilder {
    config: NodeConfig,
    exports: Vec<ApiExport>,
    subscribers: Vec<Arc<dyn ConnectionSubscriber>>,
}

impl NodeBuilder {
    /// Adds APIs next to the built-in `node` namespace, e.g.
    /// `.api(|registry| Arc::new(MyService).export(registry))`.
    #[must_use]
    pub fn api(mut self, export: impl FnOnce(&mut ApiRegistry) + Send + 'static) -> Self {
        self.exports.push(Box::new(export));
        self
    }

    #[must_use]
    pub fn subscriber(mut self, subscriber: Arc<dyn ConnectionSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// # Errors
    ///
    /// Fails if the identity or certificate cannot be set up, or the control
    /// channel cannot be bound. Listeners and peers that fail are logged
    /// and retried instead.
    pub async fn start(self) -> Result<Arc<Node>> {
        let NodeBuilder {
            config,
            exports,
            subscribers,
        } = self;
        let identity = config.identity()?;
        let certs = CertificateStore::new(config.ssl_dir(), identity.uuid.to_string());
        certs.ensure_certificate()?;
        let tls = TlsContext::new(certs, TrustStore::new(config.trust_dir()))
            .with_timeouts(config.handshake_timeout, config.certificate_grace);

        let supervisor = TaskSupervisor::create();
        let routing = Arc::new(RoutingTable::new(identity.clone()));
        let link = Arc::new(PeerLink {
            own: identity.uuid,
            routing: routing.clone(),
            subscribers: subscribers.into(),
        });

        let node = Arc::new_cyclic(|this: &Weak<Node>| {
            let registry = ConnectionRegistry::new(
                Arc::new(PeerConnector { node: this.clone() }),
                config.retry,
                &supervisor,
            );
            registry.set_hook(link.clone());

            let mut apis = ApiRegistry::default();
            Arc::new(NodeApi::new(this.clone())).export(&mut apis);
            for export in exports {
                export(&mut apis);
            }
            let dispatcher =
                Arc::new(Dispatcher::new(identity.clone(), apis).with_routing(routing.clone()));

            let incoming = Arc::new(Incoming {
                tls: tls.clone(),
                dispatcher: dispatcher.clone(),
                registry: registry.clone(),
                hook: Some(link.clone()),
                options: config.session.clone(),
                sessions: supervisor.child(),
            });
            let listeners = Listeners::new(incoming, &supervisor);
            let sessions = supervisor.child();

            Node {
                identity,
                tls,
                routing,
                registry,
                dispatcher,
                listeners,
                #[cfg(unix)]
                control: Mutex::new(None),
                configured_listeners: config.listeners.clone(),
                options: config.session.clone(),
                handshake_timeout: config.handshake_timeout,
                sessions,
                supervisor,
            }
        });
        tracing::info!("starting node {}", node.identity);

        #[cfg(unix)]
        if let Some(path) = &config.control_socket {
            let control = ControlChannel::bind(
                path.clone(),
                node.dispatcher.clone(),
                config.session.clone(),
                &node.supervisor,
            )
            .await?;
            *node.control.lock() = Some(control);
        }
        node.start_configured_listeners().await;
        node.registry.set_configured(config.connections);
        Ok(node)
    }
}

/// One running node.
pub struct Node {
    identity: NodeIdentity,
    tls: TlsContext,
    routing: Arc<RoutingTable>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    listeners: Listeners,
    #[cfg(unix)]
    control: Mutex<Option<ControlChannel>>,
    configured_listeners: Vec<String>,
    options: SessionOptions,
    handshake_timeout: Duration,
    sessions: TaskSupervisor,
    supervisor: TaskSupervisor,
}

impl Node {
    #[must_use]
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            exports: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Starts a node serving only the `node` namespace.
    ///
    /// # Errors
    ///
    /// See [`NodeBuilder::start`].
    pub async fn start(config: NodeConfig) -> Result<Arc<Node>> {
        Self::builder(config).start().await
    }

    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    #[must_use]
    pub fn tls(&self) -> &TlsContext {
        &self.tls
    }

    #[must_use]
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    #[cfg(unix)]
    #[must_use]
    pub fn control_socket(&self) -> Option<PathBuf> {
        self.control
            .lock()
            .as_ref()
            .map(|control| control.path().to_path_buf())
    }

    /// Starts every configured listener that is not running yet.
    pub async fn start_configured_listeners(&self) {
        let running = self.listeners.list();
        for address in &self.configured_listeners {
            if running.contains(address) {
                continue;
            }
            if let Err(e) = self.listeners.listen(address).await {
                tracing::error!("cannot listen on {address}: {e}");
            }
        }
    }

    async fn open_session(&self, address: &str, fingerprint: Option<&str>) -> Result<Arc<Session>> {
        let config = self.tls.client_config(fingerprint)?;
        let host_port = address.strip_prefix("tcp://").unwrap_or(address);
        let stream = tokio::time::timeout(self.handshake_timeout, TcpStream::connect(host_port))
            .await
            .map_err(|_| {
                Error::new(
                    ErrorKind::TcpConnectFailed,
                    format!("connecting to {address} timed out"),
                )
            })?
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, format!("{address}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (stream, peer) = self.tls.connect(config, stream, address).await?;
        tracing::debug!("handshake with {address} done, peer type {:?}", peer.peer_type);
        Ok(Session::start(
            stream,
            peer,
            Some(self.dispatcher.clone()),
            &self.options,
            &self.sessions,
        ))
    }

    /// Closes listeners, the control channel and every session.
    pub fn stop(&self) {
        tracing::info!("stopping node {}", self.identity);
        self.listeners.stop_all();
        #[cfg(unix)]
        if let Some(control) = self.control.lock().take() {
            control.stop();
        }
        self.registry.close();
        self.supervisor.stop();
    }

    pub async fn join(&self) {
        self.supervisor.all_stopped().await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.identity)
            .field("listeners", &self.listeners)
            .finish()
    }
}
