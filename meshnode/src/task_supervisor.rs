use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

#[derive(Debug)]
struct TaskSupervisorState {
    /// Running tasks, plus one while the supervisor itself has not been stopped.
    running: AtomicU64,
    stop_requested: AtomicBool,
    stop: CancellationToken,
    stopped: CancellationToken,
}

impl TaskSupervisorState {
    fn new(stop: CancellationToken) -> Self {
        Self {
            running: AtomicU64::new(1),
            stop_requested: AtomicBool::new(false),
            stop,
            stopped: CancellationToken::new(),
        }
    }

    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }

    fn request_stop(&self) {
        self.stop.cancel();
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            self.finish_async_task();
        }
    }
}

/// Tracks background tasks (accept loops, session loops, retry timers) so
/// that they can be cancelled together and joined.
///
/// # Examples
///
/// ```rust,no_run
/// # use meshnode::TaskSupervisor;
/// # #[tokio::main]
/// # async fn main() {
/// let supervisor = TaskSupervisor::create();
/// supervisor.spawn(async {
///     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
/// });
/// supervisor.stop();
/// supervisor.all_stopped().await;
/// # }
/// ```
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// Keeps the supervisor's running count up while alive.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        Self(Arc::new(TaskSupervisorState::new(CancellationToken::new())))
    }

    /// A supervisor that is stopped together with `self`, but can also be
    /// stopped on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self(Arc::new(TaskSupervisorState::new(self.0.stop.child_token())));
        // stopping the parent must also release the child's own count.
        let state = child.0.clone();
        let guard = self.start_async_task();
        tokio::spawn(async move {
            state.stop.cancelled().await;
            state.request_stop();
            drop(guard);
        });
        child
    }

    pub fn stop(&self) {
        self.0.request_stop();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// The returned guard calls `stop()` when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.0.stop.clone().drop_guard()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    /// Resolves once `stop()` was called and every tracked task finished.
    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }

    /// Spawns `future` as a tracked task that is dropped on `stop()`.
    ///
    /// The join handle yields `None` if the task was cancelled.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.start_async_task();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => None,
                output = future => Some(output),
            }
        })
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}
