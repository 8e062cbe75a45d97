use std::{
    io::IoSlice,
    panic::AssertUnwindSafe,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    Context, Dispatcher, TaskSupervisor,
    envelope::{Envelope, Notification, Params, Request, RequestId, Response},
    error::{Error, ErrorKind, Result},
    framing::{FrameReader, encode_frame},
    identity::{NodeIdentity, PeerInfo},
    waiter::Waiter,
};

pub type CloseObserver = Box<dyn FnOnce(&Session) + Send>;

#[serde_inline_default]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionOptions {
    /// Per-request deadline. `None` waits until the session closes.
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    #[serde_inline_default(1024)]
    pub send_queue: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .unwrap()
    }
}

/// One framed JSON-RPC conversation over an established stream.
///
/// Outgoing frames go through a queue drained by a send loop, so concurrent
/// callers never interleave partial frames. Incoming requests are dispatched
/// on their own tasks and may complete in any order.
pub struct Session {
    peer: PeerInfo,
    identity: OnceLock<NodeIdentity>,
    sender: mpsc::Sender<Bytes>,
    waiter: Waiter,
    supervisor: TaskSupervisor,
    closed: AtomicBool,
    observers: Mutex<Vec<CloseObserver>>,
    request_timeout: Option<Duration>,
}

impl Session {
    /// Starts the send and receive loops over `stream`.
    ///
    /// Requests from the remote end are answered by `dispatcher`; without one
    /// they fail with `MethodNotFound`. The session closes when `parent`
    /// stops.
    pub fn start<S>(
        stream: S,
        peer: PeerInfo,
        dispatcher: Option<Arc<Dispatcher>>,
        options: &SessionOptions,
        parent: &TaskSupervisor,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (recv_stream, send_stream) = tokio::io::split(stream);
        let (sender, receiver) = mpsc::channel(options.send_queue.max(1));
        let identity = OnceLock::new();
        if let Some(declared) = &peer.identity {
            let _ = identity.set(declared.clone());
        }

        let session = Arc::new(Self {
            peer,
            identity,
            sender,
            waiter: Waiter::default(),
            supervisor: parent.child(),
            closed: AtomicBool::new(false),
            observers: Mutex::default(),
            request_timeout: options.request_timeout,
        });

        let guard = session.supervisor.start_async_task();
        tokio::spawn({
            let this = session.clone();
            async move {
                let result = tokio::select! {
                    () = guard.stopped() => Ok(()),
                    r = Self::start_send_loop(send_stream, receiver) => r,
                };
                if let Err(e) = result {
                    tracing::warn!("send loop for {} failed: {e}", this.peer.address);
                }
                this.close();
            }
        });

        let guard = session.supervisor.start_async_task();
        tokio::spawn({
            let this = session.clone();
            async move {
                let result = tokio::select! {
                    () = guard.stopped() => Ok(()),
                    r = this.start_recv_loop(recv_stream, dispatcher) => r,
                };
                match result {
                    Ok(()) => tracing::debug!("session with {} ended", this.peer.address),
                    Err(e) => tracing::warn!("recv loop for {} failed: {e}", this.peer.address),
                }
                this.close();
            }
        });

        session
    }

    #[must_use]
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// The remote identity, declared by its certificate or confirmed later.
    #[must_use]
    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.get()
    }

    /// Records the identity the remote end reported about itself.
    ///
    /// # Errors
    ///
    /// Fails with `ProtocolError` if it contradicts the identity already
    /// established for this session.
    pub fn confirm_identity(&self, reported: NodeIdentity) -> Result<&NodeIdentity> {
        let identity = self.identity.get_or_init(|| reported.clone());
        if identity.uuid == reported.uuid {
            Ok(identity)
        } else {
            Err(Error::new(
                ErrorKind::ProtocolError,
                format!(
                    "{} claims to be {}, but its certificate names {}",
                    self.peer.address, reported.uuid, identity.uuid
                ),
            ))
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.waiter.pending()
    }

    /// Sends a request and waits for the matching response.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` if the session closes first, or with
    /// `Timeout` when a request timeout is configured.
    pub async fn call(
        &self,
        method: &str,
        params: Params,
        target: Option<String>,
    ) -> Result<Response> {
        let (msg_id, receiver) = self.waiter.alloc()?;
        let request = Request {
            id: RequestId::from(msg_id),
            method: method.to_string(),
            params,
            target,
        };
        self.send(&Envelope::Request(request)).await?;
        receiver.recv_timeout(self.request_timeout).await
    }

    /// Calls `method` on the remote end itself and returns its result.
    ///
    /// # Errors
    ///
    /// Transport failures or the remote error translated into an [`Error`].
    pub async fn request(&self, method: &str, params: impl Into<Params>) -> Result<Value> {
        self.call(method, params.into(), None).await?.into_result()
    }

    /// Calls `method` on the node identified by `target`, reached through
    /// this session.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn request_on(
        &self,
        target: &str,
        method: &str,
        params: impl Into<Params>,
    ) -> Result<Value> {
        self.call(method, params.into(), Some(target.to_string()))
            .await?
            .into_result()
    }

    /// # Errors
    ///
    /// Fails with `ConnectionClosed` if the session is closed.
    pub async fn notify(
        &self,
        method: &str,
        params: impl Into<Params>,
        target: Option<String>,
    ) -> Result<()> {
        let notification = Notification {
            method: method.to_string(),
            params: params.into(),
            target,
        };
        self.send(&Envelope::Notification(notification)).await
    }

    /// Registers `observer` to run once when the session closes. Runs it
    /// immediately if the session is already closed.
    pub fn on_close(&self, observer: impl FnOnce(&Session) + Send + 'static) {
        let mut observers = self.observers.lock();
        if self.is_closed() {
            drop(observers);
            self.notify_observer(Box::new(observer));
        } else {
            observers.push(Box::new(observer));
        }
    }

    /// Closes the session. Pending requests fail with `ConnectionClosed`.
    /// Close observers run exactly once, however often this is called.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("closing session with {}", self.peer.address);
        self.waiter.close();
        self.supervisor.stop();
        let observers = std::mem::take(&mut *self.observers.lock());
        for observer in observers {
            self.notify_observer(observer);
        }
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.supervisor.stopped().await;
    }

    fn notify_observer(&self, observer: CloseObserver) {
        if std::panic::catch_unwind(AssertUnwindSafe(|| observer(self))).is_err() {
            tracing::error!("close observer for {} panicked", self.peer.address);
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::connection_closed());
        }
        let frame = encode_frame(&envelope.encode()?);
        self.sender
            .send(frame)
            .await
            .map_err(|_| Error::connection_closed())
    }

    async fn start_recv_loop<R>(
        self: &Arc<Self>,
        recv_stream: R,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = FrameReader::new(recv_stream);
        while let Some(frame) = reader.read_message().await? {
            match Envelope::decode(&frame)? {
                Envelope::Response(response) => self.handle_response(response),
                Envelope::Request(request) => self.handle_request(request, dispatcher.clone()),
                Envelope::Notification(notification) => {
                    self.handle_notification(notification, dispatcher.clone());
                }
            }
        }
        Ok(())
    }

    fn handle_response(&self, response: Response) {
        let msg_id = match &response.id {
            RequestId::Number(n) => u64::try_from(*n).ok(),
            RequestId::String(s) => s.parse::<u64>().ok(),
        };
        match msg_id {
            Some(msg_id) => {
                self.waiter.post(msg_id, response);
            }
            None => tracing::warn!(
                "response from {} with unknown id {}",
                self.peer.address,
                response.id
            ),
        }
    }

    fn handle_request(self: &Arc<Self>, request: Request, dispatcher: Option<Arc<Dispatcher>>) {
        let this = self.clone();
        self.supervisor.spawn(async move {
            let response = match dispatcher {
                Some(dispatcher) => {
                    let ctx = Context::for_session(&this, Some(request.id.clone()));
                    dispatcher.handle_request(ctx, request).await
                }
                None => Response::failure(
                    request.id,
                    Error::new(
                        ErrorKind::MethodNotFound,
                        format!("{} is not served on this session", request.method),
                    ),
                ),
            };
            if let Err(e) = this.send(&Envelope::Response(response)).await {
                tracing::debug!("dropping response to {}: {e}", this.peer.address);
            }
        });
    }

    fn handle_notification(
        self: &Arc<Self>,
        notification: Notification,
        dispatcher: Option<Arc<Dispatcher>>,
    ) {
        let Some(dispatcher) = dispatcher else {
            tracing::debug!(
                "ignoring notification {} from {}",
                notification.method,
                self.peer.address
            );
            return;
        };
        let ctx = Context::for_session(self, None);
        self.supervisor.spawn(async move {
            dispatcher.handle_notification(ctx, notification).await;
        });
    }

    async fn start_send_loop<W>(
        mut send_stream: W,
        mut receiver: mpsc::Receiver<Bytes>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        const LIMIT: usize = 64;
        let mut frames = Vec::with_capacity(LIMIT);
        loop {
            let mut bufs = [IoSlice::new(&[]); LIMIT];

            let n = receiver.recv_many(&mut frames, LIMIT).await;
            if n == 0 {
                return Ok(());
            }

            for (frame, io_slice) in frames.iter().zip(&mut bufs) {
                *io_slice = IoSlice::new(frame);
            }

            let mut slices = &mut bufs[..frames.len()];
            while !slices.is_empty() {
                match send_stream.write_vectored(slices).await {
                    Ok(0) => {
                        return Err(Error::new(ErrorKind::SendFailed, "stream closed"));
                    }
                    Ok(n) => IoSlice::advance_slices(&mut slices, n),
                    Err(e) => return Err(Error::new(ErrorKind::SendFailed, e.to_string())),
                }
            }
            send_stream
                .flush()
                .await
                .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;
            frames.clear();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.waiter.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("identity", &self.identity.get())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{ApiRegistry, Method, ParamDescriptor, RpcMethodDescriptor},
        identity::{ConnectionDirection, PeerType},
    };
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid;

    fn peer(address: &str) -> PeerInfo {
        PeerInfo::new(address, PeerType::Peer, ConnectionDirection::Outgoing)
    }

    fn sleepy_dispatcher() -> Arc<Dispatcher> {
        let mut registry = ApiRegistry::default();
        let sleep: Method = Arc::new(|_, params| {
            Box::pin(async move {
                let millis = params[0].as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(json!(millis))
            })
        });
        registry.add_method(
            RpcMethodDescriptor::new("test", "sleep", vec![ParamDescriptor::of::<u64>("millis")]),
            sleep,
        );
        let identity = NodeIdentity::new(Uuid::new_v4(), "server");
        Arc::new(Dispatcher::new(identity, registry))
    }

    fn pair(supervisor: &TaskSupervisor) -> (Arc<Session>, Arc<Session>) {
        let (a, b) = tokio::io::duplex(64 << 10);
        let client = Session::start(a, peer("b"), None, &SessionOptions::default(), supervisor);
        let server = Session::start(
            b,
            peer("a"),
            Some(sleepy_dispatcher()),
            &SessionOptions::default(),
            supervisor,
        );
        (client, server)
    }

    #[tokio::test]
    async fn test_concurrent_requests_complete_out_of_order() {
        let supervisor = TaskSupervisor::create();
        let (client, _server) = pair(&supervisor);

        let (slow, fast) = tokio::join!(
            client.request("test.sleep", vec![json!(200)]),
            client.request("test.sleep", vec![json!(10)]),
        );
        assert_eq!(slow.unwrap(), json!(200));
        assert_eq!(fast.unwrap(), json!(10));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unserved_request() {
        let supervisor = TaskSupervisor::create();
        let (_client, server) = pair(&supervisor);
        let err = server.request("test.sleep", vec![json!(1)]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MethodNotFound);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_notifies_once() {
        let supervisor = TaskSupervisor::create();
        let (client, server) = pair(&supervisor);

        let fired = Arc::new(AtomicUsize::new(0));
        client.on_close({
            let fired = fired.clone();
            move |session| {
                assert_eq!(session.peer().address, "b");
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.request("test.sleep", vec![json!(60_000)]).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.close();
        client.close();
        assert_eq!(
            pending.await.unwrap().unwrap_err().kind,
            ErrorKind::ConnectionClosed
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // the remote end sees the stream end.
        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert!(server.is_closed());

        // observers registered after close run immediately.
        client.on_close({
            let fired = fired.clone();
            move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(
            client.request("test.sleep", vec![json!(1)]).await.unwrap_err().kind,
            ErrorKind::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let supervisor = TaskSupervisor::create();
        let (mut raw, b) = tokio::io::duplex(1024);
        let session = Session::start(
            b,
            peer("raw"),
            Some(sleepy_dispatcher()),
            &SessionOptions::default(),
            &supervisor,
        );
        raw.write_all(b"5:hello,").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let supervisor = TaskSupervisor::create();
        let (a, b) = tokio::io::duplex(64 << 10);
        let options = SessionOptions {
            request_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let client = Session::start(a, peer("b"), None, &options, &supervisor);
        let _server = Session::start(
            b,
            peer("a"),
            Some(sleepy_dispatcher()),
            &SessionOptions::default(),
            &supervisor,
        );
        let err = client
            .request("test.sleep", vec![json!(1000)])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_parent_stop_closes_session() {
        let supervisor = TaskSupervisor::create();
        let (client, server) = pair(&supervisor);
        supervisor.stop();
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), supervisor.all_stopped())
            .await
            .unwrap();
        // the loops call close() once they observe the stop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.is_closed());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_confirm_identity() {
        let uuid = Uuid::new_v4();
        let supervisor = TaskSupervisor::create();
        let (a, _b) = tokio::io::duplex(1024);
        let session = Session::start(
            a,
            peer("x").with_identity(NodeIdentity::new(uuid, uuid.to_string())),
            None,
            &SessionOptions::default(),
            &supervisor,
        );
        assert!(session.confirm_identity(NodeIdentity::new(uuid, "x")).is_ok());
        let err = session
            .confirm_identity(NodeIdentity::new(Uuid::new_v4(), "y"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
    }
}
