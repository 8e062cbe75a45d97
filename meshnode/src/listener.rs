use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::{
    ConnectionRegistry, Dispatcher, Session, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    registry::SessionHook,
    session::SessionOptions,
    tls::TlsContext,
};

/// Pause after a failed `accept` before trying again.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything needed to turn an accepted socket into a session.
pub(crate) struct Incoming {
    pub(crate) tls: TlsContext,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) hook: Option<Arc<dyn SessionHook>>,
    pub(crate) options: SessionOptions,
    pub(crate) sessions: TaskSupervisor,
}

impl Incoming {
    async fn handle(
        self: Arc<Self>,
        acceptor: TlsAcceptor,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        let address = addr.to_string();
        let _ = stream.set_nodelay(true);
        let (stream, peer) = self.tls.accept(&acceptor, stream, &address).await?;
        let peer_type = peer.peer_type;
        let session = Session::start(
            stream,
            peer,
            Some(self.dispatcher.clone()),
            &self.options,
            &self.sessions,
        );
        if let Some(hook) = &self.hook
            && let Err(e) = hook.on_established(session.clone()).await
        {
            session.close();
            return Err(e);
        }
        self.registry.register_incoming(&address, &session);
        match session.identity() {
            Some(identity) => {
                tracing::info!("accepted {identity} from {address} as {peer_type:?}");
            }
            None => tracing::info!("accepted {address} as {peer_type:?}"),
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    incoming: Arc<Incoming>,
    local_addr: SocketAddr,
) {
    tracing::info!("start listening: {local_addr}");
    loop {
        let (stream, addr) = next_connection(|| listener.accept(), &local_addr).await;
        let handle = incoming.clone().handle(acceptor.clone(), stream, addr);
        incoming.sessions.spawn(async move {
            if let Err(e) = handle.await {
                tracing::warn!("incoming connection from {addr} failed: {e}");
            }
        });
    }
}

/// Retries `accept` until it yields a connection, pausing after each
/// failure.
pub(crate) async fn next_connection<T, F, Fut>(
    mut accept: F,
    local: &(dyn std::fmt::Display + Sync),
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(connection) => return connection,
            Err(e) => {
                tracing::warn!("accept on {local} failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

struct RunningListener {
    local_addr: SocketAddr,
    supervisor: TaskSupervisor,
}

/// TLS listeners keyed by the address they were requested with.
pub struct Listeners {
    incoming: Arc<Incoming>,
    running: Mutex<BTreeMap<String, RunningListener>>,
    supervisor: TaskSupervisor,
}

impl Listeners {
    pub(crate) fn new(incoming: Arc<Incoming>, parent: &TaskSupervisor) -> Self {
        Self {
            incoming,
            running: Mutex::default(),
            supervisor: parent.child(),
        }
    }

    /// Binds `address` (`host:port`, optionally prefixed by `tcp://`) and
    /// accepts TLS connections on it.
    ///
    /// # Errors
    ///
    /// `Configuration` if no usable certificate is available, `AlreadyExists`
    /// if the address is already served and `TcpBindFailed` if binding fails.
    pub async fn listen(&self, address: &str) -> Result<SocketAddr> {
        if self.running.lock().contains_key(address) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("node is already listening on {address}"),
            ));
        }
        let acceptor = TlsAcceptor::from(self.incoming.tls.server_config()?);

        let bind_addr = address.strip_prefix("tcp://").unwrap_or(address);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, format!("{address}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;

        let supervisor = self.supervisor.child();
        let task_supervisor = supervisor.start_async_task();
        let incoming = self.incoming.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = task_supervisor.stopped() => {
                    tracing::info!("stop accept loop on {local_addr}");
                }
                () = accept_loop(listener, acceptor, incoming, local_addr) => {}
            }
        });

        let previous = self.running.lock().insert(
            address.to_string(),
            RunningListener {
                local_addr,
                supervisor,
            },
        );
        if let Some(previous) = previous {
            previous.supervisor.stop();
        }
        Ok(local_addr)
    }

    /// Closes the listening socket. Sessions accepted on it stay open.
    pub fn stop(&self, address: &str) -> bool {
        match self.running.lock().remove(address) {
            Some(listener) => {
                listener.supervisor.stop();
                tracing::info!("closed listener {address}");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn local_addr(&self, address: &str) -> Option<SocketAddr> {
        self.running.lock().get(address).map(|l| l.local_addr)
    }

    pub fn stop_all(&self) {
        for (_, listener) in std::mem::take(&mut *self.running.lock()) {
            listener.supervisor.stop();
        }
        self.supervisor.stop();
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("addresses", &self.list()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off() {
        let attempts = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();
        let connection = next_connection(
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(std::io::Error::from_raw_os_error(24))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            &"127.0.0.1:5661",
        )
        .await;
        assert_eq!(connection, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 3);
    }
}
