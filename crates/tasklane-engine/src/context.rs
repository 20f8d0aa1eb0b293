//! Per-attempt execution context handed to task handlers.
//!
//! The context lets a handler report progress, save checkpoints that
//! survive retries, spawn subtasks through an injected spawner, observe
//! cooperative cancellation, and append log entries visible to monitors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tasklane_core::models::Task;
use tasklane_core::{EngineResult, Payload};

use crate::backend::ResultBackend;

/// Injected mechanism for submitting subtasks from inside a handler.
#[async_trait]
pub trait SubtaskSpawner: Send + Sync {
    /// Submit a new task and return its id.
    async fn spawn(&self, task: Task) -> EngineResult<Uuid>;
}

/// One progress update, kept in the per-attempt history.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLogLevel {
    Info,
    Warning,
    Error,
}

/// Structured log entry created during task execution.
#[derive(Debug, Clone)]
pub struct TaskLogEntry {
    pub level: TaskLogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct ContextState {
    progress: f64,
    progress_message: String,
    history: Vec<ProgressUpdate>,
    checkpoint: Option<Payload>,
    logs: Vec<TaskLogEntry>,
    spawned: Vec<Uuid>,
}

/// Execution context for a single attempt of a task.
pub struct TaskContext {
    task: Task,
    attempt: u32,
    started_at: DateTime<Utc>,
    start_instant: std::time::Instant,
    cancelled: Arc<AtomicBool>,
    backend: Arc<dyn ResultBackend>,
    spawner: Option<Arc<dyn SubtaskSpawner>>,
    state: Mutex<ContextState>,
}

impl TaskContext {
    pub fn new(
        task: Task,
        attempt: u32,
        cancelled: Arc<AtomicBool>,
        backend: Arc<dyn ResultBackend>,
        spawner: Option<Arc<dyn SubtaskSpawner>>,
    ) -> Self {
        let checkpoint = task.checkpoint.clone();
        Self {
            task,
            attempt,
            started_at: Utc::now(),
            start_instant: std::time::Instant::now(),
            cancelled,
            backend,
            spawner,
            state: Mutex::new(ContextState {
                checkpoint,
                ..ContextState::default()
            }),
        }
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    /// Update progress, clamped to `[0, 1]`, and write it through to the
    /// result backend. Backend failures are logged and never fail the
    /// handler.
    pub async fn update_progress(&self, progress: f64, message: &str) {
        let progress = progress.clamp(0.0, 1.0);
        {
            let mut state = self.state.lock().expect("context lock poisoned");
            state.progress = progress;
            state.progress_message = message.to_string();
            state.history.push(ProgressUpdate {
                progress,
                message: message.to_string(),
                timestamp: Utc::now(),
            });
        }
        if let Err(e) = self
            .backend
            .store_progress(self.task.id, progress, message)
            .await
        {
            tracing::warn!(
                task_id = %self.task.id,
                error = %e,
                "Failed to store progress update"
            );
        }
    }

    pub fn progress(&self) -> f64 {
        self.state.lock().expect("context lock poisoned").progress
    }

    pub fn progress_message(&self) -> String {
        self.state
            .lock()
            .expect("context lock poisoned")
            .progress_message
            .clone()
    }

    pub fn progress_history(&self) -> Vec<ProgressUpdate> {
        self.state
            .lock()
            .expect("context lock poisoned")
            .history
            .clone()
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Save state to resume from if this task is retried.
    pub fn save_checkpoint(&self, state: Payload) {
        self.state.lock().expect("context lock poisoned").checkpoint = Some(state);
    }

    /// The saved checkpoint, from this attempt or a previous one.
    pub fn load_checkpoint(&self) -> Option<Payload> {
        self.state
            .lock()
            .expect("context lock poisoned")
            .checkpoint
            .clone()
    }

    pub fn has_checkpoint(&self) -> bool {
        self.state
            .lock()
            .expect("context lock poisoned")
            .checkpoint
            .is_some()
    }

    pub fn clear_checkpoint(&self) {
        self.state.lock().expect("context lock poisoned").checkpoint = None;
    }

    // ------------------------------------------------------------------
    // Subtasks
    // ------------------------------------------------------------------

    /// Submit a subtask through the injected spawner. The subtask is
    /// independent of this task; its id is recorded for later retrieval.
    pub async fn spawn_subtask(&self, task: Task) -> EngineResult<Uuid> {
        let spawner = self.spawner.as_ref().ok_or_else(|| {
            tasklane_core::EngineError::NotSupported("no subtask spawner injected".to_string())
        })?;
        let id = spawner.spawn(task).await?;
        self.state
            .lock()
            .expect("context lock poisoned")
            .spawned
            .push(id);
        Ok(id)
    }

    pub fn spawned_subtask_ids(&self) -> Vec<Uuid> {
        self.state
            .lock()
            .expect("context lock poisoned")
            .spawned
            .clone()
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Whether cancellation was requested. Handlers should poll this at
    /// natural suspension points and return an error to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation. Called by the worker on timeout.
    pub fn request_cancellation(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------

    pub fn log_info(&self, message: &str) {
        tracing::info!(task_id = %self.task.id, task_name = %self.task.name, "{}", message);
        self.append_log(TaskLogLevel::Info, message);
    }

    pub fn log_warning(&self, message: &str) {
        tracing::warn!(task_id = %self.task.id, task_name = %self.task.name, "{}", message);
        self.append_log(TaskLogLevel::Warning, message);
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(task_id = %self.task.id, task_name = %self.task.name, "{}", message);
        self.append_log(TaskLogLevel::Error, message);
    }

    pub fn logs(&self) -> Vec<TaskLogEntry> {
        self.state.lock().expect("context lock poisoned").logs.clone()
    }

    fn append_log(&self, level: TaskLogLevel, message: &str) {
        self.state
            .lock()
            .expect("context lock poisoned")
            .logs
            .push(TaskLogEntry {
                level,
                message: message.to_string(),
                timestamp: Utc::now(),
            });
    }

    // ------------------------------------------------------------------
    // Task information
    // ------------------------------------------------------------------

    /// Read-only view of the task being executed.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Current attempt number (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.start_instant.elapsed()
    }
}
