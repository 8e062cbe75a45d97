use std::time::Duration;

use tokio::sync::oneshot;

use crate::{
    envelope::Response,
    error::{Error, ErrorKind, Result},
    waiter::WaiterCleaner,
};

pub struct ResponseReceiver<'a> {
    rx: oneshot::Receiver<Response>,
    cleaner: WaiterCleaner<'a>,
}

impl<'a> ResponseReceiver<'a> {
    pub(crate) fn new(rx: oneshot::Receiver<Response>, cleaner: WaiterCleaner<'a>) -> Self {
        Self { rx, cleaner }
    }

    /// Waits for the response. A dropped sender means the session closed.
    ///
    /// # Errors
    pub async fn recv(self) -> Result<Response> {
        let Self { rx, cleaner } = self;
        let result = rx.await.map_err(|_| Error::connection_closed());
        // the entry is already gone when a response was posted.
        if result.is_ok() {
            std::mem::forget(cleaner);
        }
        result
    }

    /// Like [`recv`](Self::recv), failing with `Timeout` after `timeout`.
    ///
    /// # Errors
    pub async fn recv_timeout(self, timeout: Option<Duration>) -> Result<Response> {
        match timeout {
            None => self.recv().await,
            Some(timeout) => tokio::time::timeout(timeout, self.recv())
                .await
                .map_err(|_| {
                    Error::new(ErrorKind::Timeout, format!("no response in {timeout:?}"))
                })?,
        }
    }
}
