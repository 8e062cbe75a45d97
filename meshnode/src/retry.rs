use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use foldhash::fast::RandomState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio_util::sync::CancellationToken;

use crate::TaskSupervisor;

/// Bounded reconnect policy. Delays never grow between attempts.
#[serde_inline_default]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde_inline_default(Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Delay before reconnecting after an established session was lost.
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (starting at 1).
    #[must_use]
    pub fn delay(&self, _attempt: u32) -> Duration {
        self.clamp(self.interval)
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        self.clamp(self.reconnect_delay)
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.max(self.min_delay).min(self.max_delay.max(self.min_delay))
    }
}

#[derive(Default)]
struct Timers {
    next: AtomicU64,
    tokens: Mutex<HashMap<String, (u64, CancellationToken), RandomState>>,
}

impl Timers {
    fn remove_if(&self, key: &str, generation: u64) -> bool {
        let mut tokens = self.tokens.lock();
        if tokens.get(key).is_some_and(|(g, _)| *g == generation) {
            tokens.remove(key);
            true
        } else {
            false
        }
    }
}

/// At most one pending timer per key.
pub struct RetryScheduler {
    timers: Arc<Timers>,
    supervisor: TaskSupervisor,
}

impl RetryScheduler {
    #[must_use]
    pub fn new(parent: &TaskSupervisor) -> Self {
        Self {
            timers: Arc::default(),
            supervisor: parent.child(),
        }
    }

    /// Runs `task` after `delay`, replacing a timer already pending for `key`.
    pub fn schedule<F>(&self, key: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.timers.next.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self
            .timers
            .tokens
            .lock()
            .insert(key.to_string(), (generation, token.clone()))
        {
            previous.cancel();
        }

        let timers = self.timers.clone();
        let key = key.to_string();
        self.supervisor.spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if timers.remove_if(&key, generation) {
                tracing::debug!("retry timer for {key} fired");
                task.await;
            }
        });
    }

    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.tokens.lock().remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.timers.tokens.lock().drain() {
            token.cancel();
        }
    }

    #[must_use]
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.timers.tokens.lock().contains_key(key)
    }

    pub fn stop(&self) {
        self.cancel_all();
        self.supervisor.stop();
    }
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("scheduled", &self.timers.tokens.lock().len())
            .finish()
    }
}
