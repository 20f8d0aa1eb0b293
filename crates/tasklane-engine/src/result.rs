//! Asynchronous result handle returned at task submission.
//!
//! A cheap, clonable view over the result backend for one task id.
//! Supports polling, blocking waits, single-shot completion callbacks,
//! and cooperative revocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use tasklane_core::models::TaskState;
use tasklane_core::{EngineResult, Payload};

use crate::backend::ResultBackend;
use crate::cancel::CancellationRegistry;
use crate::queue::TaskQueue;

/// Poll cadence bound for [`AsyncResult::wait`].
const MAX_WAIT_POLL: Duration = Duration::from_millis(100);

/// How long a `then` monitor task waits before giving up on a task that
/// never reaches a terminal state.
const CALLBACK_MONITOR_WAIT: Duration = Duration::from_secs(24 * 3600);

struct ResultInner {
    task_id: Uuid,
    backend: Arc<dyn ResultBackend>,
    cancellations: Arc<CancellationRegistry>,
    queue: TaskQueue,
    callback_fired: AtomicBool,
}

/// Handle for asynchronously retrieving a task's outcome.
#[derive(Clone)]
pub struct AsyncResult {
    inner: Arc<ResultInner>,
}

impl AsyncResult {
    pub fn new(
        task_id: Uuid,
        backend: Arc<dyn ResultBackend>,
        cancellations: Arc<CancellationRegistry>,
        queue: TaskQueue,
    ) -> Self {
        Self {
            inner: Arc::new(ResultInner {
                task_id,
                backend,
                cancellations,
                queue,
                callback_fired: AtomicBool::new(false),
            }),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.inner.task_id
    }

    // ------------------------------------------------------------------
    // Status queries
    // ------------------------------------------------------------------

    /// Current state; `Pending` when the backend has no entry yet.
    pub async fn state(&self) -> TaskState {
        self.inner
            .backend
            .get_state(self.inner.task_id)
            .await
            .unwrap_or(TaskState::Pending)
    }

    /// Whether the task reached a terminal state.
    pub async fn is_ready(&self) -> bool {
        self.state().await.is_terminal()
    }

    pub async fn is_successful(&self) -> bool {
        self.state().await == TaskState::Succeeded
    }

    pub async fn is_failed(&self) -> bool {
        self.state().await == TaskState::Failed
    }

    pub async fn is_cancelled(&self) -> bool {
        self.state().await == TaskState::Cancelled
    }

    pub async fn progress(&self) -> f64 {
        self.inner
            .backend
            .get_progress(self.inner.task_id)
            .await
            .map(|p| p.progress)
            .unwrap_or(0.0)
    }

    pub async fn progress_message(&self) -> String {
        self.inner
            .backend
            .get_progress(self.inner.task_id)
            .await
            .map(|p| p.message)
            .unwrap_or_default()
    }

    pub async fn error_message(&self) -> Option<String> {
        self.inner
            .backend
            .get_error(self.inner.task_id)
            .await
            .map(|e| e.message)
            .ok()
    }

    // ------------------------------------------------------------------
    // Blocking retrieval
    // ------------------------------------------------------------------

    /// Wait for and return the result, delegating to the backend's
    /// blocking wait.
    pub async fn get(&self, timeout: Duration) -> EngineResult<Payload> {
        self.inner
            .backend
            .wait_for_result(self.inner.task_id, timeout)
            .await
    }

    /// Wait for completion without retrieving the result. Polls with a
    /// doubling backoff bounded at 100 ms. Returns false on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = Duration::from_millis(10);

        loop {
            if self.is_ready().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            let remaining = deadline - tokio::time::Instant::now();
            tokio::time::sleep(poll.min(remaining)).await;
            poll = (poll * 2).min(MAX_WAIT_POLL);
        }
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Register completion callbacks. If the task is already terminal the
    /// matching callback runs immediately; otherwise a single monitor task
    /// polls the backend until terminal. At most one callback fires per
    /// handle lineage, even across repeated `then` calls.
    pub async fn then<S, F>(&self, on_success: S, on_failure: F)
    where
        S: FnOnce(Payload) + Send + 'static,
        F: FnOnce(String) + Send + 'static,
    {
        if self.is_ready().await {
            self.deliver(on_success, on_failure).await;
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            // Outcome is re-read in deliver; this is only the wait.
            let _ = this
                .inner
                .backend
                .wait_for_result(this.inner.task_id, CALLBACK_MONITOR_WAIT)
                .await;
            this.deliver(on_success, on_failure).await;
        });
    }

    async fn deliver<S, F>(&self, on_success: S, on_failure: F)
    where
        S: FnOnce(Payload) + Send + 'static,
        F: FnOnce(String) + Send + 'static,
    {
        if self
            .inner
            .callback_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        match self.get(Duration::ZERO).await {
            Ok(payload) => on_success(payload),
            Err(e) => on_failure(e.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Request cancellation: sets the cooperative flag, removes the task
    /// from the queue if still queued, and records `Cancelled` in the
    /// backend. A running attempt is not forcibly stopped.
    pub async fn revoke(&self) -> EngineResult<()> {
        self.inner.cancellations.request(self.inner.task_id);
        // Only queued tasks can be pulled back; running ones observe the
        // flag cooperatively.
        let _ = self.inner.queue.cancel(self.inner.task_id);
        self.inner
            .backend
            .store_state(self.inner.task_id, TaskState::Cancelled)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::queue::QueueConfig;
    use std::sync::Mutex;

    fn handle_for(id: Uuid, backend: Arc<MemoryBackend>) -> AsyncResult {
        AsyncResult::new(
            id,
            backend,
            Arc::new(CancellationRegistry::new()),
            TaskQueue::new(QueueConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_state_defaults_to_pending() {
        let backend = Arc::new(MemoryBackend::new());
        let result = handle_for(Uuid::new_v4(), backend);
        assert_eq!(result.state().await, TaskState::Pending);
        assert!(!result.is_ready().await);
    }

    #[tokio::test]
    async fn test_status_queries() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        backend.store_state(id, TaskState::Running).await.unwrap();
        assert!(!result.is_ready().await);

        backend
            .store_result(id, Payload::new().with("ok", true))
            .await
            .unwrap();
        backend.store_state(id, TaskState::Succeeded).await.unwrap();
        assert!(result.is_ready().await);
        assert!(result.is_successful().await);
        assert!(!result.is_failed().await);
        assert!(!result.is_cancelled().await);
    }

    #[tokio::test]
    async fn test_progress_passthrough() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        backend.store_progress(id, 0.4, "working").await.unwrap();
        assert_eq!(result.progress().await, 0.4);
        assert_eq!(result.progress_message().await, "working");
    }

    #[tokio::test]
    async fn test_get_returns_result() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        backend
            .store_result(id, Payload::new().with("msg", "hi"))
            .await
            .unwrap();
        backend.store_state(id, TaskState::Succeeded).await.unwrap();

        let payload = result.get(Duration::from_secs(1)).await.unwrap();
        assert_eq!(payload.get_str("msg"), Some("hi"));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let backend = Arc::new(MemoryBackend::new());
        let result = handle_for(Uuid::new_v4(), backend);
        assert!(!result.wait(Duration::from_millis(60)).await);
    }

    #[tokio::test]
    async fn test_wait_sees_completion() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        let waiter = {
            let result = result.clone();
            tokio::spawn(async move { result.wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        backend.store_state(id, TaskState::Succeeded).await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_then_fires_immediately_when_terminal() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        backend
            .store_result(id, Payload::new().with("n", 1_i64))
            .await
            .unwrap();
        backend.store_state(id, TaskState::Succeeded).await.unwrap();

        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            result
                .then(
                    move |payload| {
                        *seen.lock().unwrap() = payload.get_i64("n");
                    },
                    |_err| panic!("should not fail"),
                )
                .await;
        }
        assert_eq!(*seen.lock().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_then_fires_on_later_completion() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            result
                .then(
                    move |payload| {
                        *seen.lock().unwrap() = payload.get_str("msg").map(String::from);
                    },
                    |_err| {},
                )
                .await;
        }

        backend
            .store_result(id, Payload::new().with("msg", "late"))
            .await
            .unwrap();
        backend.store_state(id, TaskState::Succeeded).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.lock().unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_then_failure_callback() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        backend.store_error(id, "broke", "").await.unwrap();
        backend.store_state(id, TaskState::Failed).await.unwrap();

        let seen = Arc::new(Mutex::new(String::new()));
        {
            let seen = seen.clone();
            result
                .then(
                    |_payload| panic!("should not succeed"),
                    move |err| {
                        *seen.lock().unwrap() = err;
                    },
                )
                .await;
        }
        assert!(seen.lock().unwrap().contains("broke"));
    }

    #[tokio::test]
    async fn test_callback_is_single_shot() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        backend.store_state(id, TaskState::Succeeded).await.unwrap();

        let count = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let count = count.clone();
            result
                .then(
                    move |_payload| {
                        *count.lock().unwrap() += 1;
                    },
                    |_err| {},
                )
                .await;
        }
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_revoke_records_cancelled() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        let result = handle_for(id, backend.clone());

        result.revoke().await.unwrap();
        assert!(result.is_cancelled().await);
        assert!(matches!(
            result.get(Duration::from_millis(50)).await,
            Err(tasklane_core::EngineError::Cancelled)
        ));
    }
}
