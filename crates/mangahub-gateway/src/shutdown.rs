//! Graceful shutdown of the gateway's listener tasks.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time allowed for tasks to drain before they are aborted.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the shutdown token and the handles of every task spawned under it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tasks.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a named task that is awaited on shutdown.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push((name, tokio::spawn(task)));
    }

    /// Number of tasks still tracked.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel the token, wait up to `timeout` for every task, then abort
    /// the stragglers. Safe to call more than once.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        info!(task_count = tasks.len(), timeout_ms = timeout.as_millis(), "waiting for tasks to stop");

        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);

        match tokio::time::timeout(timeout, drain).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(task = name, error = %e, "task ended abnormally");
                    }
                }
            }
            Err(_) => {
                warn!(?timeout, "shutdown timed out, aborting remaining tasks");
                for (name, abort) in names.iter().zip(aborts) {
                    if !abort.is_finished() {
                        warn!(task = name, "aborting task");
                        abort.abort();
                    }
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
