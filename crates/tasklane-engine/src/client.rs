//! Task client: the producer-facing submission facade, plus chain and
//! chord workflow composition.
//!
//! A workflow is tracked by a virtual parent task whose id lives only in
//! the result backend. Orchestration runs on background tokio tasks whose
//! join handles are retained by the client and aborted on shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use tasklane_core::models::{Task, TaskBuilder, TaskState};
use tasklane_core::{EngineError, EngineResult, Payload};

use crate::backend::ResultBackend;
use crate::cancel::CancellationRegistry;
use crate::context::SubtaskSpawner;
use crate::queue::TaskQueue;
use crate::result::AsyncResult;

/// Virtual task name tracking a sequential pipeline.
pub const CHAIN_TASK_NAME: &str = "__chain__";
/// Virtual task name tracking a fan-out/fan-in workflow.
pub const CHORD_TASK_NAME: &str = "__chord__";

/// Upper bound on how long an orchestrator waits for one child.
const WORKFLOW_WAIT: Duration = Duration::from_secs(24 * 3600);

/// Execution options applied to tasks built by [`TaskClient::submit_named`].
/// Explicitly built tasks carry their own configuration.
#[derive(Debug, Clone)]
pub struct TaskDefaults {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        let config = tasklane_core::models::TaskConfig::default();
        Self {
            timeout: config.timeout,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            backoff_multiplier: config.retry_backoff_multiplier,
        }
    }
}

struct ClientInner {
    queue: TaskQueue,
    backend: Arc<dyn ResultBackend>,
    cancellations: Arc<CancellationRegistry>,
    defaults: TaskDefaults,
    orchestrations: Mutex<Vec<JoinHandle<()>>>,
}

/// Thin facade over queue and backend for producers.
#[derive(Clone)]
pub struct TaskClient {
    inner: Arc<ClientInner>,
}

impl TaskClient {
    pub fn new(
        queue: TaskQueue,
        backend: Arc<dyn ResultBackend>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self::with_defaults(queue, backend, cancellations, TaskDefaults::default())
    }

    pub fn with_defaults(
        queue: TaskQueue,
        backend: Arc<dyn ResultBackend>,
        cancellations: Arc<CancellationRegistry>,
        defaults: TaskDefaults,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                queue,
                backend,
                cancellations,
                defaults,
                orchestrations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Submit a task for execution.
    pub async fn submit(&self, task: Task) -> EngineResult<AsyncResult> {
        let task_id = task.id;
        self.inner
            .backend
            .store_state(task_id, TaskState::Pending)
            .await?;

        match self.inner.queue.enqueue(task) {
            Ok(_) => {
                if let Err(e) = self
                    .inner
                    .backend
                    .store_state(task_id, TaskState::Queued)
                    .await
                {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to record queued state");
                }
                Ok(self.result_of(task_id))
            }
            Err(e) => {
                let message = format!("failed to enqueue: {}", e);
                let _ = self.inner.backend.store_error(task_id, &message, "").await;
                let _ = self
                    .inner
                    .backend
                    .store_state(task_id, TaskState::Failed)
                    .await;
                Err(e)
            }
        }
    }

    /// Build and submit a task from a name and payload, with the client's
    /// configured execution defaults.
    pub async fn submit_named(
        &self,
        task_name: &str,
        payload: Payload,
    ) -> EngineResult<AsyncResult> {
        let defaults = &self.inner.defaults;
        let task = TaskBuilder::new(task_name)
            .payload(payload)
            .timeout(defaults.timeout)
            .retries(defaults.max_retries)
            .retry_delay(defaults.retry_delay)
            .retry_backoff(defaults.backoff_multiplier)
            .build()?;
        self.submit(task).await
    }

    /// Submit a task that becomes eligible after `delay`.
    pub async fn submit_later(&self, task: Task, delay: Duration) -> EngineResult<AsyncResult> {
        let eta = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| EngineError::InvalidArgument("delay too large".to_string()))?;
        self.submit_at(task, eta).await
    }

    /// Submit a task that becomes eligible at an absolute time.
    pub async fn submit_at(
        &self,
        mut task: Task,
        eta: DateTime<Utc>,
    ) -> EngineResult<AsyncResult> {
        task.config.eta = Some(eta);
        self.submit(task).await
    }

    /// Submit several tasks; fails fast on the first rejection.
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> EngineResult<Vec<AsyncResult>> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.submit(task).await?);
        }
        Ok(results)
    }

    /// Handle for a previously submitted task.
    pub fn result_of(&self, task_id: Uuid) -> AsyncResult {
        AsyncResult::new(
            task_id,
            self.inner.backend.clone(),
            self.inner.cancellations.clone(),
            self.inner.queue.clone(),
        )
    }

    /// Cancel a task: pulls it from the queue when still queued, otherwise
    /// requests cooperative cancellation of the running attempt.
    pub async fn cancel(&self, task_id: Uuid) -> EngineResult<()> {
        let was_queued = self.inner.queue.cancel(task_id).is_ok();
        if !was_queued && !self.inner.backend.exists(task_id).await {
            return Err(EngineError::NotFound(format!("task {}", task_id)));
        }
        self.inner.cancellations.request(task_id);
        self.inner
            .backend
            .store_state(task_id, TaskState::Cancelled)
            .await
    }

    /// Cancel every queued task carrying the tag. Returns how many were
    /// cancelled.
    pub async fn cancel_by_tag(&self, tag: &str) -> EngineResult<usize> {
        let ids = self.inner.queue.cancel_by_tag(tag);
        for task_id in &ids {
            self.inner.cancellations.request(*task_id);
            if let Err(e) = self
                .inner
                .backend
                .store_state(*task_id, TaskState::Cancelled)
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to record cancellation");
            }
        }
        Ok(ids.len())
    }

    pub fn pending_count(&self, queue_name: &str) -> usize {
        self.inner.queue.queue_size(queue_name)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.queue.is_running()
    }

    // ------------------------------------------------------------------
    // Workflow composition
    // ------------------------------------------------------------------

    /// Sequential pipe: each task's result becomes the next task's
    /// payload. The returned handle tracks the workflow as a whole; its
    /// result is the last child's result. Any child failure fails the
    /// workflow and stops submission.
    pub async fn chain(&self, mut tasks: Vec<Task>) -> EngineResult<AsyncResult> {
        if tasks.is_empty() {
            return Err(EngineError::InvalidArgument(
                "chain requires at least one task".to_string(),
            ));
        }
        if tasks.len() == 1 {
            return self.submit(tasks.remove(0)).await;
        }

        let workflow = TaskBuilder::new(CHAIN_TASK_NAME).build()?;
        let workflow_id = workflow.id;
        self.inner
            .backend
            .store_state(workflow_id, TaskState::Pending)
            .await?;
        let _ = self
            .inner
            .backend
            .store_progress(workflow_id, 0.0, "chain started")
            .await;

        let remaining: Vec<Task> = tasks.split_off(1);
        let first = tasks.remove(0);
        let total = remaining.len() + 1;

        let first_result = match self.submit(first).await {
            Ok(result) => result,
            Err(e) => {
                self.fail_workflow(workflow_id, format!("failed to submit first chain task: {}", e))
                    .await;
                return Err(e);
            }
        };

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_chain(workflow_id, first_result, remaining, total)
                .await;
        });
        self.track(handle);

        tracing::debug!(workflow_id = %workflow_id, steps = total, "Chain started");
        Ok(self.result_of(workflow_id))
    }

    async fn run_chain(
        &self,
        workflow_id: Uuid,
        first: AsyncResult,
        mut remaining: Vec<Task>,
        total: usize,
    ) {
        let mut current = first;
        let mut completed = 0_usize;

        loop {
            let payload = match current.get(WORKFLOW_WAIT).await {
                Ok(payload) => payload,
                Err(e) => {
                    self.fail_workflow(
                        workflow_id,
                        format!("chain step {} failed: {}", completed + 1, e),
                    )
                    .await;
                    return;
                }
            };

            completed += 1;
            let progress = completed as f64 / total as f64;
            let _ = self
                .inner
                .backend
                .store_progress(
                    workflow_id,
                    progress,
                    &format!("completed {}/{}", completed, total),
                )
                .await;

            if remaining.is_empty() {
                let _ = self.inner.backend.store_result(workflow_id, payload).await;
                let _ = self
                    .inner
                    .backend
                    .store_state(workflow_id, TaskState::Succeeded)
                    .await;
                tracing::debug!(workflow_id = %workflow_id, "Chain completed");
                return;
            }

            let mut next = remaining.remove(0);
            next.payload = payload;
            current = match self.submit(next).await {
                Ok(result) => result,
                Err(e) => {
                    self.fail_workflow(
                        workflow_id,
                        format!("failed to submit chain step {}: {}", completed + 1, e),
                    )
                    .await;
                    return;
                }
            };
        }
    }

    /// Fan-out/fan-in: submits all `parallels`, awaits every child in
    /// input order, then runs `callback` with the collected results. The
    /// callback payload carries each child result as a nested container
    /// keyed by its input index, plus a `count` entry. The first child
    /// failure fails the workflow and the callback never runs. With no
    /// parallels the callback runs alone and its result is the chord's
    /// result.
    pub async fn chord(&self, parallels: Vec<Task>, callback: Task) -> EngineResult<AsyncResult> {
        if parallels.is_empty() {
            return self.submit(callback).await;
        }

        let workflow = TaskBuilder::new(CHORD_TASK_NAME).build()?;
        let workflow_id = workflow.id;
        self.inner
            .backend
            .store_state(workflow_id, TaskState::Pending)
            .await?;
        let _ = self
            .inner
            .backend
            .store_progress(workflow_id, 0.0, "chord started")
            .await;

        let mut children = Vec::with_capacity(parallels.len());
        for task in parallels {
            match self.submit(task).await {
                Ok(result) => children.push(result),
                Err(e) => {
                    self.fail_workflow(workflow_id, format!("failed to submit chord task: {}", e))
                        .await;
                    return Err(e);
                }
            }
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_chord(workflow_id, children, callback).await;
        });
        self.track(handle);

        tracing::debug!(workflow_id = %workflow_id, "Chord started");
        Ok(self.result_of(workflow_id))
    }

    async fn run_chord(&self, workflow_id: Uuid, children: Vec<AsyncResult>, mut callback: Task) {
        let total = children.len();
        let mut collected = Vec::with_capacity(total);

        for (index, child) in children.into_iter().enumerate() {
            match child.get(WORKFLOW_WAIT).await {
                Ok(payload) => {
                    collected.push(payload);
                    let progress = (index + 1) as f64 / (total + 1) as f64;
                    let _ = self
                        .inner
                        .backend
                        .store_progress(
                            workflow_id,
                            progress,
                            &format!("completed {}/{} parallel tasks", index + 1, total),
                        )
                        .await;
                }
                Err(e) => {
                    self.fail_workflow(
                        workflow_id,
                        format!("chord task {} failed: {}", index, e),
                    )
                    .await;
                    return;
                }
            }
        }

        // Stable ordering: child results keyed by input index.
        let mut payload = Payload::new();
        for (index, result) in collected.into_iter().enumerate() {
            payload.set(index.to_string(), result);
        }
        payload.set("count", total as i64);
        callback.payload = payload;

        let callback_result = match self.submit(callback).await {
            Ok(result) => result,
            Err(e) => {
                self.fail_workflow(workflow_id, format!("failed to submit chord callback: {}", e))
                    .await;
                return;
            }
        };

        match callback_result.get(WORKFLOW_WAIT).await {
            Ok(payload) => {
                let _ = self.inner.backend.store_result(workflow_id, payload).await;
                let _ = self
                    .inner
                    .backend
                    .store_state(workflow_id, TaskState::Succeeded)
                    .await;
                let _ = self
                    .inner
                    .backend
                    .store_progress(workflow_id, 1.0, "chord completed")
                    .await;
                tracing::debug!(workflow_id = %workflow_id, "Chord completed");
            }
            Err(EngineError::Cancelled) => {
                let _ = self
                    .inner
                    .backend
                    .store_state(workflow_id, TaskState::Cancelled)
                    .await;
            }
            Err(e) => {
                self.fail_workflow(workflow_id, format!("chord callback failed: {}", e))
                    .await;
            }
        }
    }

    async fn fail_workflow(&self, workflow_id: Uuid, message: String) {
        tracing::error!(workflow_id = %workflow_id, error = %message, "Workflow failed");
        let _ = self
            .inner
            .backend
            .store_error(workflow_id, &message, "")
            .await;
        let _ = self
            .inner
            .backend
            .store_state(workflow_id, TaskState::Failed)
            .await;
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut orchestrations = self
            .inner
            .orchestrations
            .lock()
            .expect("orchestration lock poisoned");
        // Drop handles of orchestrations that already finished.
        orchestrations.retain(|h| !h.is_finished());
        orchestrations.push(handle);
    }

    /// Abort outstanding workflow orchestrations.
    pub fn shutdown(&self) {
        let mut orchestrations = self
            .inner
            .orchestrations
            .lock()
            .expect("orchestration lock poisoned");
        for handle in orchestrations.drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl SubtaskSpawner for TaskClient {
    async fn spawn(&self, task: Task) -> EngineResult<Uuid> {
        let task_id = task.id;
        self.submit(task).await?;
        Ok(task_id)
    }
}
