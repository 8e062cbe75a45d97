//! Connection state per peer address.
//!
//! ```text
//! Pending ──connect──▶ Connecting ──ok──▶ Connected
//!                          │                  │ closed
//!                          ▼ err              ▼
//!                       Failing ◀─────────────┘
//!                          │ retry timer (configured peers only)
//!                          └──────────▶ Connecting
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use foldhash::fast::RandomState;
use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    Session, TaskSupervisor,
    error::{Error, Result},
    retry::{RetryPolicy, RetryScheduler},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Failing,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInformation {
    pub peer_address: String,
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ConnectionInformation {
    #[must_use]
    pub fn new(peer_address: impl Into<String>) -> Self {
        Self {
            peer_address: peer_address.into(),
            state: ConnectionState::Pending,
            peer_identifier: None,
            error_message: None,
        }
    }
}

/// Settings of one configured outbound peer.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    /// SHA-256 fingerprint pinning the peer certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Opens an authenticated session to a peer address.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, address: &str, peer: &PeerConfig) -> BoxFuture<'static, Result<Arc<Session>>>;
}

/// Runs once for every freshly established session before it is reported
/// as connected. An error closes the session.
pub trait SessionHook: Send + Sync + 'static {
    fn on_established(&self, session: Arc<Session>) -> BoxFuture<'static, Result<()>>;
}

pub type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<Session>>>>;

struct PendingAttempt {
    id: u64,
    future: ConnectFuture,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    closed: bool,
    connections: BTreeMap<String, ConnectionInformation>,
    configured: BTreeMap<String, PeerConfig>,
    pending: HashMap<String, PendingAttempt, RandomState>,
    sessions: HashMap<String, Arc<Session>, RandomState>,
}

/// Owns every session of the node, keyed by peer address.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    hook: OnceLock<Arc<dyn SessionHook>>,
    policy: RetryPolicy,
    retry: RetryScheduler,
    supervisor: TaskSupervisor,
    next_attempt: AtomicU64,
    state: Mutex<RegistryState>,
    this: Weak<Self>,
}

fn ready(result: Result<Arc<Session>>) -> ConnectFuture {
    futures_util::future::ready(result).boxed().shared()
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        parent: &TaskSupervisor,
    ) -> Arc<Self> {
        let supervisor = parent.child();
        Arc::new_cyclic(|this| Self {
            connector,
            hook: OnceLock::new(),
            policy,
            retry: RetryScheduler::new(&supervisor),
            supervisor,
            next_attempt: AtomicU64::new(1),
            state: Mutex::default(),
            this: this.clone(),
        })
    }

    /// Installs the hook for established sessions. Only the first call
    /// has an effect.
    pub fn set_hook(&self, hook: Arc<dyn SessionHook>) {
        if self.hook.set(hook).is_err() {
            tracing::warn!("connection registry hook is already set");
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Connects to `address`, or joins the attempt already in flight.
    ///
    /// Every caller of a concurrent attempt observes the same result.
    pub fn connect(&self, address: &str) -> ConnectFuture {
        let mut state = self.state.lock();
        if state.closed {
            return ready(Err(Error::connection_closed()));
        }
        if let Some(session) = state.sessions.get(address)
            && !session.is_closed()
        {
            return ready(Ok(session.clone()));
        }
        if let Some(pending) = state.pending.get(address) {
            return pending.future.clone();
        }

        if self.retry.cancel(address) {
            tracing::debug!("connecting to {address} ahead of the scheduled retry");
        }
        let peer = state.configured.get(address).cloned().unwrap_or_default();
        let info = state
            .connections
            .entry(address.to_string())
            .or_insert_with(|| ConnectionInformation::new(address));
        info.state = ConnectionState::Connecting;

        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let future = {
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    () = cancel.cancelled() => Err(Error::connection_closed()),
                    result = rx => result.unwrap_or_else(|_| Err(Error::connection_closed())),
                }
            }
            .boxed()
            .shared()
        };
        state.pending.insert(
            address.to_string(),
            PendingAttempt {
                id,
                future: future.clone(),
                cancel,
            },
        );
        drop(state);

        tracing::debug!("connecting to {address}");
        let connect = self.connector.connect(address, &peer);
        let hook = self.hook.get().cloned();
        let this = self.this.clone();
        let address = address.to_string();
        self.supervisor.spawn(async move {
            let result = Self::establish(connect, hook).await;
            let result = match this.upgrade() {
                Some(this) => this.finish_attempt(&address, id, result),
                None => {
                    if let Ok(session) = &result {
                        session.close();
                    }
                    Err(Error::connection_closed())
                }
            };
            let _ = tx.send(result);
        });
        future
    }

    async fn establish(
        connect: BoxFuture<'static, Result<Arc<Session>>>,
        hook: Option<Arc<dyn SessionHook>>,
    ) -> Result<Arc<Session>> {
        let session = connect.await?;
        if let Some(hook) = hook
            && let Err(e) = hook.on_established(session.clone()).await
        {
            session.close();
            return Err(e);
        }
        Ok(session)
    }

    fn finish_attempt(
        &self,
        address: &str,
        id: u64,
        result: Result<Arc<Session>>,
    ) -> Result<Arc<Session>> {
        let mut state = self.state.lock();
        if !state.pending.get(address).is_some_and(|pending| pending.id == id) {
            // disconnected while the attempt was running.
            drop(state);
            if let Ok(session) = &result {
                session.close();
            }
            return Err(Error::connection_closed());
        }
        state.pending.remove(address);
        let configured = state.configured.contains_key(address);
        let info = state
            .connections
            .entry(address.to_string())
            .or_insert_with(|| ConnectionInformation::new(address));

        match result {
            Ok(session) => {
                info.state = ConnectionState::Connected;
                info.error_message = None;
                info.peer_identifier = session.identity().map(|identity| identity.uuid.to_string());
                let previous = state.sessions.insert(address.to_string(), session.clone());
                drop(state);
                if let Some(previous) = previous {
                    previous.close();
                }
                tracing::info!("connected to {address}");
                self.watch(address, &session);
                Ok(session)
            }
            Err(e) => {
                info.state = ConnectionState::Failing;
                let message = e.to_string();
                if info.error_message.as_deref() != Some(message.as_str()) {
                    if configured {
                        tracing::error!(
                            "Connection attempt to {address} failed, will retry every {}s: {message}",
                            self.policy.delay(1).as_secs()
                        );
                    } else {
                        tracing::error!("Connection attempt to {address} failed: {message}");
                    }
                    info.error_message = Some(message);
                }
                drop(state);
                if configured {
                    self.schedule_retry(address, self.policy.delay(1));
                }
                Err(e)
            }
        }
    }

    fn watch(&self, address: &str, session: &Arc<Session>) {
        let this = self.this.clone();
        let address = address.to_string();
        session.on_close(move |closed| {
            if let Some(this) = this.upgrade() {
                this.session_closed(&address, closed);
            }
        });
    }

    fn session_closed(&self, address: &str, session: &Session) {
        let mut state = self.state.lock();
        let current = state
            .sessions
            .get(address)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
        if !current {
            return;
        }
        state.sessions.remove(address);
        if state.closed {
            return;
        }

        if state.configured.contains_key(address) {
            if let Some(info) = state.connections.get_mut(address) {
                info.state = ConnectionState::Failing;
                info.error_message = Some("connection closed".to_string());
            }
            drop(state);
            let delay = self.policy.reconnect_delay();
            tracing::warn!("connection to {address} has been closed, reconnecting in {delay:?}");
            self.schedule_retry(address, delay);
        } else {
            state.connections.remove(address);
            drop(state);
            tracing::info!("connection to {address} has been closed");
        }
    }

    fn schedule_retry(&self, address: &str, delay: Duration) {
        let this = self.this.clone();
        let key = address.to_string();
        self.retry.schedule(address, delay, async move {
            let Some(this) = this.upgrade() else {
                return;
            };
            if this.is_configured(&key) {
                let _ = this.connect(&key).await;
            }
        });
    }

    /// Tears down everything known about `address`. Waiters of an attempt
    /// in flight fail with `ConnectionClosed`.
    ///
    /// Returns whether the address was known.
    pub fn disconnect(&self, address: &str) -> bool {
        let retry_cancelled = self.retry.cancel(address);
        let (known, session, pending) = {
            let mut state = self.state.lock();
            (
                state.connections.remove(address).is_some(),
                state.sessions.remove(address),
                state.pending.remove(address),
            )
        };
        if let Some(pending) = &pending {
            pending.cancel.cancel();
        }
        if let Some(session) = &session {
            session.close();
        }
        if known {
            tracing::info!("disconnected from {address}");
        }
        known || retry_cancelled || session.is_some() || pending.is_some()
    }

    /// Replaces the set of persistent peers: dropped addresses are
    /// disconnected, all configured ones are connected.
    pub fn set_configured(&self, configured: BTreeMap<String, PeerConfig>) {
        let removed: Vec<String> = {
            let mut state = self.state.lock();
            let removed = state
                .configured
                .keys()
                .filter(|address| !configured.contains_key(*address))
                .cloned()
                .collect();
            state.configured = configured.clone();
            removed
        };
        for address in removed {
            self.disconnect(&address);
        }
        for address in configured.keys() {
            drop(self.connect(address));
        }
    }

    #[must_use]
    pub fn is_configured(&self, address: &str) -> bool {
        self.state.lock().configured.contains_key(address)
    }

    #[must_use]
    pub fn configured(&self) -> BTreeMap<String, PeerConfig> {
        self.state.lock().configured.clone()
    }

    /// Tracks an inbound session. It is forgotten once it closes.
    pub fn register_incoming(&self, address: &str, session: &Arc<Session>) {
        let previous = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                session.close();
                return;
            }
            let info = state
                .connections
                .entry(address.to_string())
                .or_insert_with(|| ConnectionInformation::new(address));
            info.state = ConnectionState::Connected;
            info.error_message = None;
            info.peer_identifier = session.identity().map(|identity| identity.uuid.to_string());
            state.sessions.insert(address.to_string(), session.clone())
        };
        if let Some(previous) = previous {
            previous.close();
        }
        self.watch(address, session);
    }

    pub fn remove_incoming(&self, address: &str) -> bool {
        self.disconnect(address)
    }

    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInformation> {
        self.state.lock().connections.values().cloned().collect()
    }

    #[must_use]
    pub fn connection(&self, address: &str) -> Option<ConnectionInformation> {
        self.state.lock().connections.get(address).cloned()
    }

    #[must_use]
    pub fn session(&self, address: &str) -> Option<Arc<Session>> {
        self.state.lock().sessions.get(address).cloned()
    }

    #[must_use]
    pub fn is_retry_scheduled(&self, address: &str) -> bool {
        self.retry.is_scheduled(address)
    }

    /// Cancels every retry and attempt and closes every session.
    pub fn close(&self) {
        let (sessions, pending) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.connections.clear();
            (
                state.sessions.drain().map(|(_, s)| s).collect::<Vec<_>>(),
                state.pending.drain().map(|(_, p)| p).collect::<Vec<_>>(),
            )
        };
        self.retry.stop();
        for pending in pending {
            pending.cancel.cancel();
        }
        for session in sessions {
            session.close();
        }
        self.supervisor.stop();
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.retry.stop();
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.state.lock().connections)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        identity::{ConnectionDirection, PeerInfo, PeerType},
        session::SessionOptions,
    };
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` attempts, then opens in-memory sessions.
    struct MockConnector {
        attempts: AtomicUsize,
        failures: usize,
        delay: Duration,
        supervisor: TaskSupervisor,
        remotes: Mutex<Vec<Arc<Session>>>,
    }

    impl MockConnector {
        fn new(failures: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                failures,
                delay,
                supervisor: TaskSupervisor::create(),
                remotes: Mutex::default(),
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn close_remotes(&self) {
            for remote in self.remotes.lock().drain(..) {
                remote.close();
            }
        }
    }

    impl Connector for MockConnector {
        fn connect(
            &self,
            address: &str,
            _: &PeerConfig,
        ) -> BoxFuture<'static, Result<Arc<Session>>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            if attempt < self.failures {
                let address = address.to_string();
                return async move {
                    tokio::time::sleep(delay).await;
                    Err(Error::new(
                        ErrorKind::TcpConnectFailed,
                        format!("{address}: connection refused"),
                    ))
                }
                .boxed();
            }

            let (a, b) = tokio::io::duplex(1024);
            let options = SessionOptions::default();
            let local = Session::start(
                a,
                PeerInfo::new(address, PeerType::Peer, ConnectionDirection::Outgoing),
                None,
                &options,
                &self.supervisor,
            );
            let remote = Session::start(
                b,
                PeerInfo::new("local", PeerType::Control, ConnectionDirection::Incoming),
                None,
                &options,
                &self.supervisor,
            );
            self.remotes.lock().push(remote);
            async move {
                tokio::time::sleep(delay).await;
                Ok(local)
            }
            .boxed()
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(100),
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(50),
        }
    }

    async fn wait_for(registry: &ConnectionRegistry, address: &str, state: ConnectionState) {
        for _ in 0..200 {
            if registry.connection(address).is_some_and(|info| info.state == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{address} never reached {state:?}: {:?}", registry.connection(address));
    }

    #[tokio::test]
    async fn test_concurrent_connect_shares_attempt() {
        let supervisor = TaskSupervisor::create();
        let connector = MockConnector::new(0, Duration::from_millis(50));
        let registry = ConnectionRegistry::new(connector.clone(), fast_policy(), &supervisor);

        let first = registry.connect("b:5661");
        let second = registry.connect("b:5661");
        assert_eq!(
            registry.connection("b:5661").unwrap().state,
            ConnectionState::Connecting
        );
        let (first, second) = tokio::join!(first, second);
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(connector.attempts(), 1);

        // connected: the same session again, no new attempt.
        let third = registry.connect("b:5661").await.unwrap();
        assert!(Arc::ptr_eq(&third, &registry.session("b:5661").unwrap()));
        assert_eq!(connector.attempts(), 1);
        assert_eq!(
            registry.connection("b:5661").unwrap().state,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_configured_peer_retries_until_connected() {
        let supervisor = TaskSupervisor::create();
        let connector = MockConnector::new(2, Duration::ZERO);
        let registry = ConnectionRegistry::new(connector.clone(), fast_policy(), &supervisor);

        registry.set_configured(BTreeMap::from([("b:5661".to_string(), PeerConfig::default())]));
        wait_for(&registry, "b:5661", ConnectionState::Failing).await;
        let info = registry.connection("b:5661").unwrap();
        assert!(info.error_message.unwrap().contains("connection refused"));
        assert!(registry.is_retry_scheduled("b:5661"));

        wait_for(&registry, "b:5661", ConnectionState::Connected).await;
        assert_eq!(connector.attempts(), 3);
        assert!(registry.connection("b:5661").unwrap().error_message.is_none());

        // losing the session reconnects.
        connector.close_remotes();
        wait_for(&registry, "b:5661", ConnectionState::Failing).await;
        wait_for(&registry, "b:5661", ConnectionState::Connected).await;
        assert_eq!(connector.attempts(), 4);

        // de-configuration disconnects for good.
        registry.set_configured(BTreeMap::new());
        assert!(registry.connection("b:5661").is_none());
        assert!(registry.session("b:5661").is_none());
    }

    #[tokio::test]
    async fn test_manual_connection_is_not_retried() {
        let supervisor = TaskSupervisor::create();
        let connector = MockConnector::new(1, Duration::ZERO);
        let registry = ConnectionRegistry::new(connector.clone(), fast_policy(), &supervisor);

        let err = registry.connect("c:5661").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TcpConnectFailed);
        assert_eq!(
            registry.connection("c:5661").unwrap().state,
            ConnectionState::Failing
        );
        assert!(!registry.is_retry_scheduled("c:5661"));

        registry.connect("c:5661").await.unwrap();
        connector.close_remotes();
        for _ in 0..200 {
            if registry.connection("c:5661").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.connection("c:5661").is_none());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_waiters() {
        let supervisor = TaskSupervisor::create();
        let connector = MockConnector::new(0, Duration::from_millis(200));
        let registry = ConnectionRegistry::new(connector.clone(), fast_policy(), &supervisor);

        let pending = registry.connect("d:5661");
        assert!(registry.disconnect("d:5661"));
        assert_eq!(pending.await.unwrap_err().kind, ErrorKind::ConnectionClosed);
        assert!(registry.connection("d:5661").is_none());

        // the late session of the cancelled attempt is closed, not adopted.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(registry.session("d:5661").is_none());
        assert!(!registry.disconnect("d:5661"));
    }

    #[tokio::test]
    async fn test_incoming_and_close() {
        let supervisor = TaskSupervisor::create();
        let connector = MockConnector::new(0, Duration::ZERO);
        let registry = ConnectionRegistry::new(connector.clone(), fast_policy(), &supervisor);

        let (a, _b) = tokio::io::duplex(1024);
        let incoming = Session::start(
            a,
            PeerInfo::new("198.51.100.7:40000", PeerType::Control, ConnectionDirection::Incoming),
            None,
            &SessionOptions::default(),
            &supervisor,
        );
        registry.register_incoming("198.51.100.7:40000", &incoming);
        let outgoing = registry.connect("e:5661").await.unwrap();
        assert_eq!(registry.connections().len(), 2);
        let json = serde_json::to_value(registry.connection("e:5661").unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"peerAddress": "e:5661", "state": "connected"}));

        registry.close();
        assert!(registry.connections().is_empty());
        assert!(outgoing.is_closed());
        assert!(incoming.is_closed());
        assert_eq!(
            registry.connect("e:5661").await.unwrap_err().kind,
            ErrorKind::ConnectionClosed
        );
    }
}
