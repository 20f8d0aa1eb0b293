//! Result backend: the store for state, result, error, and progress of
//! every task.
//!
//! The engine talks to an abstract [`ResultBackend`]; the default
//! [`MemoryBackend`] keeps everything in process. A conforming backend must
//! keep state writes monotonic with respect to the task state machine:
//! once a task is terminal, later writes of a different state are ignored
//! (and logged), which is what makes terminal states final for readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tasklane_core::models::TaskState;
use tasklane_core::{EngineError, EngineResult, Payload};

/// Progress information stored in the backend.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub progress: f64,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Error information stored in the backend.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub message: String,
    pub traceback: String,
    pub occurred_at: DateTime<Utc>,
}

/// Abstract store for task execution outcomes.
///
/// All methods must be thread-safe; workers on different tasks write
/// concurrently. `wait_for_result` must be cancellable by shutdown.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Record a state transition. Writes out of a terminal state are
    /// ignored.
    async fn store_state(&self, task_id: Uuid, state: TaskState) -> EngineResult<()>;

    /// Store the successful result. Expected once per task; a second call
    /// overwrites and is logged as a programmer error.
    async fn store_result(&self, task_id: Uuid, result: Payload) -> EngineResult<()>;

    /// Store failure details.
    async fn store_error(&self, task_id: Uuid, message: &str, traceback: &str)
        -> EngineResult<()>;

    /// Store progress; `progress` is clamped to `[0, 1]`, last writer wins.
    async fn store_progress(&self, task_id: Uuid, progress: f64, message: &str)
        -> EngineResult<()>;

    async fn get_state(&self, task_id: Uuid) -> EngineResult<TaskState>;

    async fn get_result(&self, task_id: Uuid) -> EngineResult<Payload>;

    async fn get_error(&self, task_id: Uuid) -> EngineResult<ErrorInfo>;

    async fn get_progress(&self, task_id: Uuid) -> EngineResult<ProgressInfo>;

    /// Block until the task reaches a terminal state or the timeout
    /// expires. Returns the result on success; a `Handler`, `Cancelled`, or
    /// `Timeout` error otherwise; `Shutdown` when the backend is stopping.
    async fn wait_for_result(&self, task_id: Uuid, timeout: Duration) -> EngineResult<Payload>;

    /// Remove entries whose terminal time is older than `max_age`.
    async fn cleanup_expired(&self, max_age: Duration) -> EngineResult<()>;

    async fn exists(&self, task_id: Uuid) -> bool {
        self.get_state(task_id).await.is_ok()
    }

    /// Remove all stored data for one task. Default: no-op.
    async fn remove(&self, _task_id: Uuid) -> EngineResult<()> {
        Ok(())
    }

    /// Number of stored tasks. Default: unknown.
    async fn len(&self) -> usize {
        0
    }

    /// Stop the backend: blocked `wait_for_result` calls must return
    /// `Shutdown`. Default: no-op.
    async fn shutdown(&self) {}
}

struct Entry {
    state: TaskState,
    result: Option<Payload>,
    error: Option<ErrorInfo>,
    progress: ProgressInfo,
    terminal_at: Option<DateTime<Utc>>,
    notify: Arc<Notify>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            state: TaskState::Pending,
            result: None,
            error: None,
            progress: ProgressInfo {
                progress: 0.0,
                message: String::new(),
                updated_at: Utc::now(),
            },
            terminal_at: None,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// In-memory result backend for single-process deployments.
#[derive(Default)]
pub struct MemoryBackend {
    store: RwLock<HashMap<Uuid, Entry>>,
    shutdown: CancellationToken,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn terminal_outcome(entry: &Entry) -> Option<EngineResult<Payload>> {
        match entry.state {
            TaskState::Succeeded => Some(Ok(entry.result.clone().unwrap_or_default())),
            TaskState::Failed => {
                let message = entry
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "task failed".to_string());
                Some(Err(EngineError::Handler(message)))
            }
            TaskState::Cancelled => Some(Err(EngineError::Cancelled)),
            TaskState::Expired => Some(Err(EngineError::Timeout)),
            _ => None,
        }
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn store_state(&self, task_id: Uuid, state: TaskState) -> EngineResult<()> {
        let mut store = self.store.write().await;
        let entry = store.entry(task_id).or_default();

        if entry.state.is_terminal() && entry.state != state {
            tracing::warn!(
                task_id = %task_id,
                current = %entry.state,
                requested = %state,
                "Ignoring state write after terminal state"
            );
            return Ok(());
        }

        entry.state = state;
        if state.is_terminal() {
            entry.terminal_at = Some(Utc::now());
            entry.notify.notify_waiters();
        }
        Ok(())
    }

    async fn store_result(&self, task_id: Uuid, result: Payload) -> EngineResult<()> {
        let mut store = self.store.write().await;
        let entry = store.entry(task_id).or_default();
        if entry.state.is_terminal() && entry.state != TaskState::Succeeded {
            // A revoked task may still produce a result; keep the entry
            // consistent with its terminal state.
            tracing::warn!(
                task_id = %task_id,
                state = %entry.state,
                "Ignoring result for task already terminal"
            );
            return Ok(());
        }
        if entry.result.is_some() {
            tracing::warn!(task_id = %task_id, "Overwriting previously stored result");
        }
        entry.result = Some(result);
        // Result and error never coexist: a transient error from an earlier
        // attempt is dropped once a later attempt succeeds.
        entry.error = None;
        Ok(())
    }

    async fn store_error(
        &self,
        task_id: Uuid,
        message: &str,
        traceback: &str,
    ) -> EngineResult<()> {
        let mut store = self.store.write().await;
        let entry = store.entry(task_id).or_default();
        entry.error = Some(ErrorInfo {
            message: message.to_string(),
            traceback: traceback.to_string(),
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    async fn store_progress(
        &self,
        task_id: Uuid,
        progress: f64,
        message: &str,
    ) -> EngineResult<()> {
        let mut store = self.store.write().await;
        let entry = store.entry(task_id).or_default();
        entry.progress = ProgressInfo {
            progress: progress.clamp(0.0, 1.0),
            message: message.to_string(),
            updated_at: Utc::now(),
        };
        Ok(())
    }

    async fn get_state(&self, task_id: Uuid) -> EngineResult<TaskState> {
        let store = self.store.read().await;
        store
            .get(&task_id)
            .map(|entry| entry.state)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))
    }

    async fn get_result(&self, task_id: Uuid) -> EngineResult<Payload> {
        let store = self.store.read().await;
        let entry = store
            .get(&task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))?;
        entry
            .result
            .clone()
            .ok_or_else(|| EngineError::NotFound(format!("no result for task {}", task_id)))
    }

    async fn get_error(&self, task_id: Uuid) -> EngineResult<ErrorInfo> {
        let store = self.store.read().await;
        let entry = store
            .get(&task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))?;
        entry
            .error
            .clone()
            .ok_or_else(|| EngineError::NotFound(format!("no error for task {}", task_id)))
    }

    async fn get_progress(&self, task_id: Uuid) -> EngineResult<ProgressInfo> {
        let store = self.store.read().await;
        store
            .get(&task_id)
            .map(|entry| entry.progress.clone())
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))
    }

    async fn wait_for_result(&self, task_id: Uuid, timeout: Duration) -> EngineResult<Payload> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(EngineError::Shutdown);
            }

            let notify = {
                let mut store = self.store.write().await;
                let entry = store.entry(task_id).or_default();
                if let Some(outcome) = Self::terminal_outcome(entry) {
                    return outcome;
                }
                entry.notify.clone()
            };

            // Register the waiter before re-checking so a notify between the
            // check and the await is not lost.
            let mut notified = Box::pin(notify.notified());
            notified.as_mut().enable();

            {
                let store = self.store.read().await;
                if let Some(entry) = store.get(&task_id) {
                    if let Some(outcome) = Self::terminal_outcome(entry) {
                        return outcome;
                    }
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(EngineError::Timeout),
                _ = self.shutdown.cancelled() => return Err(EngineError::Shutdown),
            }
        }
    }

    async fn cleanup_expired(&self, max_age: Duration) -> EngineResult<()> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| EngineError::InvalidArgument(format!("max_age too large: {}", e)))?;
        let cutoff = Utc::now() - max_age;

        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, entry| match entry.terminal_at {
            Some(terminal_at) => terminal_at > cutoff,
            None => true,
        });
        let removed = before - store.len();
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up expired result entries");
        }
        Ok(())
    }

    async fn remove(&self, task_id: Uuid) -> EngineResult<()> {
        let mut store = self.store.write().await;
        store.remove(&task_id);
        Ok(())
    }

    async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    /// Wake all waiters and make subsequent waits return `Shutdown`.
    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_get_state() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();

        backend.store_state(id, TaskState::Pending).await.unwrap();
        assert_eq!(backend.get_state(id).await.unwrap(), TaskState::Pending);

        backend.store_state(id, TaskState::Running).await.unwrap();
        assert_eq!(backend.get_state(id).await.unwrap(), TaskState::Running);
    }

    #[tokio::test]
    async fn test_get_state_not_found() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.get_state(Uuid::new_v4()).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();

        backend.store_state(id, TaskState::Cancelled).await.unwrap();
        backend.store_state(id, TaskState::Succeeded).await.unwrap();
        assert_eq!(backend.get_state(id).await.unwrap(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_result_and_error_storage() {
        let backend = MemoryBackend::new();
        let succeeded = Uuid::new_v4();
        let failed = Uuid::new_v4();

        backend
            .store_result(succeeded, Payload::new().with("n", 6_i64))
            .await
            .unwrap();
        assert_eq!(
            backend.get_result(succeeded).await.unwrap().get_i64("n"),
            Some(6)
        );

        backend
            .store_error(failed, "boom", "at handler body")
            .await
            .unwrap();
        let error = backend.get_error(failed).await.unwrap();
        assert_eq!(error.message, "boom");
        assert_eq!(error.traceback, "at handler body");
    }

    #[tokio::test]
    async fn test_store_result_clears_earlier_error() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();

        backend.store_error(id, "transient", "").await.unwrap();
        backend
            .store_result(id, Payload::new().with("ok", true))
            .await
            .unwrap();
        backend.store_state(id, TaskState::Succeeded).await.unwrap();

        assert!(backend.get_result(id).await.is_ok());
        assert!(matches!(
            backend.get_error(id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_result_before_store_is_not_found() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();
        backend.store_state(id, TaskState::Running).await.unwrap();
        assert!(matches!(
            backend.get_result(id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_progress_clamped_and_last_writer_wins() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();

        backend.store_progress(id, 1.7, "overflow").await.unwrap();
        assert_eq!(backend.get_progress(id).await.unwrap().progress, 1.0);

        backend.store_progress(id, -0.5, "underflow").await.unwrap();
        assert_eq!(backend.get_progress(id).await.unwrap().progress, 0.0);

        backend.store_progress(id, 0.25, "quarter").await.unwrap();
        let progress = backend.get_progress(id).await.unwrap();
        assert_eq!(progress.progress, 0.25);
        assert_eq!(progress.message, "quarter");
    }

    #[tokio::test]
    async fn test_wait_for_result_success() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        backend.store_state(id, TaskState::Running).await.unwrap();

        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.wait_for_result(id, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend
            .store_result(id, Payload::new().with("ok", true))
            .await
            .unwrap();
        backend.store_state(id, TaskState::Succeeded).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.get_bool("ok"), Some(true));
    }

    #[tokio::test]
    async fn test_wait_for_result_failure_carries_message() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();

        backend
            .store_error(id, "handler exploded", "")
            .await
            .unwrap();
        backend.store_state(id, TaskState::Failed).await.unwrap();

        match backend.wait_for_result(id, Duration::from_secs(1)).await {
            Err(EngineError::Handler(msg)) => assert!(msg.contains("handler exploded")),
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_for_result_timeout() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();
        backend.store_state(id, TaskState::Running).await.unwrap();

        let result = backend.wait_for_result(id, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(EngineError::Timeout)));
    }

    #[tokio::test]
    async fn test_wait_for_result_cancelled() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();
        backend.store_state(id, TaskState::Cancelled).await.unwrap();

        let result = backend.wait_for_result(id, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_wait_for_result_shutdown() {
        let backend = Arc::new(MemoryBackend::new());
        let id = Uuid::new_v4();
        backend.store_state(id, TaskState::Running).await.unwrap();

        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.wait_for_result(id, Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.shutdown().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::Shutdown)));
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_old_terminal_entries() {
        let backend = MemoryBackend::new();
        let done = Uuid::new_v4();
        let running = Uuid::new_v4();

        backend.store_state(done, TaskState::Succeeded).await.unwrap();
        backend.store_state(running, TaskState::Running).await.unwrap();
        assert_eq!(backend.len().await, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        backend
            .cleanup_expired(Duration::from_millis(1))
            .await
            .unwrap();

        assert!(!backend.exists(done).await);
        assert!(backend.exists(running).await);
    }

    #[tokio::test]
    async fn test_remove() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();
        backend.store_state(id, TaskState::Pending).await.unwrap();
        backend.remove(id).await.unwrap();
        assert!(!backend.exists(id).await);
    }
}
