//! Local administrative channel over a Unix domain socket.
//!
//! Every process that can open the socket is trusted: sessions on it are
//! `Control` sessions and run without TLS.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};

use crate::{
    Dispatcher, Remote, Session, TaskSupervisor,
    envelope::Params,
    error::{Error, ErrorKind, Result},
    identity::{ConnectionDirection, PeerInfo, PeerType},
    listener::next_connection,
    session::SessionOptions,
};

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::new(ErrorKind::IoError, format!("{}: {e}", path.display()))
}

pub struct ControlChannel {
    path: PathBuf,
    supervisor: TaskSupervisor,
}

impl ControlChannel {
    /// Binds `path`, replacing a socket file nobody listens on anymore.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if another process serves the socket, `IoError` if
    /// it cannot be bound.
    pub async fn bind(
        path: impl Into<PathBuf>,
        dispatcher: Arc<Dispatcher>,
        options: SessionOptions,
        parent: &TaskSupervisor,
    ) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{} is served by another process", path.display()),
                ));
            }
            tracing::info!("removing orphaned control socket {}", path.display());
            std::fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        let listener = UnixListener::bind(&path).map_err(|e| io_error(&path, e))?;

        let supervisor = parent.child();
        let sessions = supervisor.child();
        let task_supervisor = supervisor.start_async_task();
        let address = format!("unix:{}", path.display());
        tokio::spawn(async move {
            tokio::select! {
                () = task_supervisor.stopped() => {
                    tracing::info!("stop control accept loop");
                }
                () = accept_loop(listener, address, dispatcher, options, sessions) => {}
            }
        });
        Ok(Self { path, supervisor })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the socket and every control session, and removes the file.
    pub fn stop(&self) {
        self.supervisor.stop();
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("cannot remove {}: {e}", self.path.display());
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    address: String,
    dispatcher: Arc<Dispatcher>,
    options: SessionOptions,
    sessions: TaskSupervisor,
) {
    tracing::info!("control socket ready: {address}");
    loop {
        let (stream, _) = next_connection(|| listener.accept(), &address).await;
        let peer = PeerInfo::new(&address, PeerType::Control, ConnectionDirection::Incoming);
        let session = Session::start(stream, peer, Some(dispatcher.clone()), &options, &sessions);
        tracing::debug!("control session opened: {session:?}");
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel").field("path", &self.path).finish()
    }
}

/// Client side of the control socket.
///
/// With a target set, every request is forwarded by the local node to the
/// node with that uuid.
pub struct ControlClient {
    session: Arc<Session>,
    target: Option<String>,
    _supervisor: TaskSupervisor,
}

impl ControlClient {
    /// # Errors
    ///
    /// `TcpConnectFailed` if nobody serves `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await.map_err(|e| {
            Error::new(
                ErrorKind::TcpConnectFailed,
                format!("{}: {e}", path.display()),
            )
        })?;
        let supervisor = TaskSupervisor::create();
        let peer = PeerInfo::new(
            format!("unix:{}", path.display()),
            PeerType::Control,
            ConnectionDirection::Outgoing,
        );
        let session = Session::start(stream, peer, None, &SessionOptions::default(), &supervisor);
        Ok(Self {
            session,
            target: None,
            _supervisor: supervisor,
        })
    }

    pub fn set_target(&mut self, target: Option<String>) {
        self.target = target;
    }

    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// # Errors
    pub async fn request(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        self.session
            .call(method, params.into(), self.target.clone())
            .await?
            .into_result()
    }

    /// # Errors
    pub async fn notify(&self, method: &str, params: impl Into<Params>) -> Result<()> {
        self.session.notify(method, params, self.target.clone()).await
    }

    /// Typed access through `#[api]` traits.
    #[must_use]
    pub fn remote(&self) -> Remote {
        let remote = Remote::new(self.session.clone());
        match &self.target {
            Some(target) => remote.with_target(target.as_str()),
            None => remote,
        }
    }

    pub fn close(&self) {
        self.session.close();
    }
}
