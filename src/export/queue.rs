//! Bounded-concurrency, retrying background task queue.
//!
//! `enqueue` never blocks: tasks go onto an unbounded channel and a single
//! dispatcher admits them in arrival order as semaphore permits free up.
//! Each admitted task runs in its own spawned task, so a slow or failing
//! task only ever occupies its own permit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::QueueError;

/// Re-invocable unit of work. Called once per attempt.
pub type TaskOperation = Arc<dyn Fn() -> BoxFuture<'static, Result<(), QueueError>> + Send + Sync>;

/// Queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Tasks allowed to run at the same time.
    pub max_concurrency: usize,
    /// Per-attempt timeout, in milliseconds.
    pub default_timeout_ms: u64,
    /// Retries after the first failed attempt.
    pub default_retries: u32,
    /// First backoff delay; doubles on every further retry.
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            default_timeout_ms: 10_000,
            default_retries: 3,
            retry_base_delay_ms: 100,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl QueueConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Backoff before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

/// A deferred unit of work with its own timeout and retry budget.
pub struct QueueTask {
    pub id: String,
    operation: TaskOperation,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl std::fmt::Debug for QueueTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTask")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl QueueTask {
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            operation: Arc::new(move || Box::pin(operation())),
            timeout: None,
            retries: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Admitted but not yet running (waiting for a permit or in backoff).
    pub queued: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: QueueConfig,
    pending: AtomicUsize,
    running: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    closed: AtomicBool,
    idle: Notify,
}

impl Shared {
    async fn run(&self, task: QueueTask) {
        let timeout = task.timeout.unwrap_or_else(|| self.config.default_timeout());
        let retries = task.retries.unwrap_or(self.config.default_retries);
        let mut attempt: u32 = 0;

        loop {
            self.running.fetch_add(1, Ordering::SeqCst);
            let outcome = match tokio::time::timeout(timeout, (task.operation)()).await {
                Ok(result) => result,
                Err(_) => Err(QueueError::Timeout(timeout)),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                Ok(()) => {
                    self.succeeded.fetch_add(1, Ordering::SeqCst);
                    debug!(queue = %self.name, task_id = %task.id, attempt, "Task succeeded");
                    return;
                }
                Err(e) if attempt < retries => {
                    let delay = self.config.backoff(attempt);
                    self.retried.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        queue = %self.name,
                        task_id = %task.id,
                        attempt,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Task failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    error!(
                        queue = %self.name,
                        task_id = %task.id,
                        attempts = attempt + 1,
                        error = %e,
                        "Task permanently failed"
                    );
                    return;
                }
            }
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Handle to a running queue. Cheap to clone.
///
/// The dispatcher stops once every handle is dropped and the backlog is
/// admitted.
#[derive(Clone, Debug)]
pub struct ExportQueue {
    tx: mpsc::UnboundedSender<QueueTask>,
    shared: Arc<Shared>,
}

impl ExportQueue {
    /// Start a queue. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            idle: Notify::new(),
            config,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch(rx, Arc::clone(&shared)));
        Self { tx, shared }
    }

    async fn dispatch(mut rx: mpsc::UnboundedReceiver<QueueTask>, shared: Arc<Shared>) {
        let permits = Arc::new(Semaphore::new(shared.config.max_concurrency.max(1)));

        while let Some(task) = rx.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                shared.run(task).await;
                drop(permit);
                shared.finish_one();
            });
        }
        debug!(queue = %shared.name, "Queue dispatcher stopped");
    }

    /// Admit a task without waiting. Returns the task id.
    pub fn enqueue(&self, task: QueueTask) -> Result<String, QueueError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            warn!(queue = %self.shared.name, task_id = %task.id, "Rejecting task, queue is shut down");
            return Err(QueueError::Closed);
        }
        let id = task.id.clone();
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.shared.finish_one();
            return Err(QueueError::Closed);
        }
        debug!(queue = %self.shared.name, task_id = %id, "Task enqueued");
        Ok(id)
    }

    pub fn stats(&self) -> QueueStats {
        let pending = self.shared.pending.load(Ordering::SeqCst);
        let running = self.shared.running.load(Ordering::SeqCst);
        QueueStats {
            queued: pending.saturating_sub(running),
            running,
            succeeded: self.shared.succeeded.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
            retried: self.shared.retried.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Wait until no task is queued, running or backing off.
    pub async fn flush(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop admitting new tasks. Admitted tasks still run to completion.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}
