use foldhash::fast::RandomState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::oneshot;

use crate::{
    envelope::Response,
    error::{Error, Result},
    receiver::ResponseReceiver,
};

/// Response waiter for correlating requests with responses.
///
/// Every outgoing request gets a fresh numeric id and a oneshot channel. The
/// receive loop posts responses by id, so responses may arrive in any order.
/// Closing the waiter drops all outstanding senders, which resolves every
/// pending receiver with a `ConnectionClosed` error.
#[derive(Default)]
pub struct Waiter {
    index: AtomicU64,
    closed: AtomicBool,
    id_map: dashmap::DashMap<u64, oneshot::Sender<Response>, RandomState>,
}

/// Removes the waiter entry when a receiver is dropped before its response.
pub struct WaiterCleaner<'a> {
    waiter: &'a Waiter,
    msg_id: u64,
}

impl Drop for WaiterCleaner<'_> {
    fn drop(&mut self) {
        self.waiter.remove(self.msg_id);
    }
}

impl Waiter {
    /// Allocates a new request id and the receiver for its response.
    ///
    /// # Errors
    ///
    /// Fails with `ConnectionClosed` once the waiter has been closed.
    pub fn alloc(&self) -> Result<(u64, ResponseReceiver<'_>)> {
        let msg_id = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.id_map.insert(msg_id, tx);
        if self.closed.load(Ordering::Acquire) {
            self.id_map.remove(&msg_id);
            return Err(Error::connection_closed());
        }
        Ok((
            msg_id,
            ResponseReceiver::new(
                rx,
                WaiterCleaner {
                    waiter: self,
                    msg_id,
                },
            ),
        ))
    }

    /// Delivers a response to the request waiting on `msg_id`.
    ///
    /// Returns false if nobody waits for that id any more (e.g. after a
    /// timeout).
    pub fn post(&self, msg_id: u64, response: Response) -> bool {
        if let Some((_, tx)) = self.id_map.remove(&msg_id) {
            tx.send(response).is_ok()
        } else {
            tracing::warn!("waiter post failed for msg_id: {msg_id}");
            false
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn contains_message_id(&self, msg_id: u64) -> bool {
        self.id_map.contains_key(&msg_id)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.id_map.len()
    }

    /// Fails every outstanding request and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.id_map.clear();
    }

    fn remove(&self, msg_id: u64) {
        self.id_map.remove(&msg_id);
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.id_map.len())
            .finish()
    }
}
