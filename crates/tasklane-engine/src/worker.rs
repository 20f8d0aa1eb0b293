//! Worker pool: the task execution engine.
//!
//! Owns N long-lived tokio worker tasks. Each worker pulls the best
//! eligible task across its assigned queues, matches it to a registered
//! handler, and executes it with a per-attempt deadline. Failures follow
//! the retry policy with exponential backoff; panics inside handlers are
//! converted to internal errors at the attempt boundary so a worker never
//! dies. Cancellation is cooperative: on timeout the worker sets the flag,
//! waits a grace window, then abandons the attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tasklane_core::models::{Task, TaskState};
use tasklane_core::{
    EngineError, EngineResult, MetricsSink, NoOpMetricsSink, Payload, WorkerMetrics,
};

use crate::backend::ResultBackend;
use crate::cancel::CancellationRegistry;
use crate::context::{SubtaskSpawner, TaskContext};
use crate::monitor::MonitorHub;
use crate::queue::TaskQueue;
use crate::registry::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker executors.
    pub concurrency: usize,
    /// Queues drained by this pool, in declared polling order.
    pub queues: Vec<String>,
    /// How long a worker blocks on empty queues before re-polling.
    pub dequeue_timeout: Duration,
    /// Window between requesting cancellation on timeout and abandoning
    /// the attempt.
    pub cancel_grace: Duration,
    /// Honor retry rules when no handler matches the task name.
    pub retry_on_routing_errors: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queues: vec!["default".to_string()],
            dequeue_timeout: Duration::from_millis(1000),
            cancel_grace: Duration::from_millis(100),
            retry_on_routing_errors: false,
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatistics {
    pub total_tasks_processed: u64,
    pub total_tasks_succeeded: u64,
    pub total_tasks_failed: u64,
    pub total_tasks_retried: u64,
    pub total_tasks_timed_out: u64,
    pub total_execution_time: Duration,
    pub avg_execution_time: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub last_task_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatsInner {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    timed_out: AtomicU64,
    execution_ms: AtomicU64,
    timestamps: Mutex<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
}

impl StatsInner {
    fn mark_started(&self) {
        let mut ts = self.timestamps.lock().expect("stats lock poisoned");
        ts.0 = Some(Utc::now());
    }

    fn record_outcome(&self, success: bool, duration: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.execution_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        let mut ts = self.timestamps.lock().expect("stats lock poisoned");
        ts.1 = Some(Utc::now());
    }

    fn record_cancelled(&self, duration: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.execution_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        let mut ts = self.timestamps.lock().expect("stats lock poisoned");
        ts.1 = Some(Utc::now());
    }

    fn snapshot(&self) -> WorkerStatistics {
        let processed = self.processed.load(Ordering::Relaxed);
        let execution_ms = self.execution_ms.load(Ordering::Relaxed);
        let (started_at, last_task_at) = *self.timestamps.lock().expect("stats lock poisoned");
        WorkerStatistics {
            total_tasks_processed: processed,
            total_tasks_succeeded: self.succeeded.load(Ordering::Relaxed),
            total_tasks_failed: self.failed.load(Ordering::Relaxed),
            total_tasks_retried: self.retried.load(Ordering::Relaxed),
            total_tasks_timed_out: self.timed_out.load(Ordering::Relaxed),
            total_execution_time: Duration::from_millis(execution_ms),
            avg_execution_time: if processed > 0 {
                Duration::from_millis(execution_ms / processed)
            } else {
                Duration::ZERO
            },
            started_at,
            last_task_at,
        }
    }
}

/// Heartbeat entry for one worker.
#[derive(Debug, Clone)]
pub struct WorkerHeartbeat {
    pub last_heartbeat: DateTime<Utc>,
    pub active_task: Option<Uuid>,
}

/// Pool of cooperative task executors.
pub struct WorkerPool {
    config: WorkerConfig,
    queue: TaskQueue,
    backend: Arc<dyn ResultBackend>,
    registry: Arc<HandlerRegistry>,
    cancellations: Arc<CancellationRegistry>,
    hub: Arc<MonitorHub>,
    metrics: Arc<dyn MetricsSink>,
    spawner: Mutex<Option<Arc<dyn SubtaskSpawner>>>,
    stats: StatsInner,
    heartbeats: Mutex<HashMap<String, WorkerHeartbeat>>,
    worker_metrics: Mutex<HashMap<String, WorkerMetrics>>,
    active: Mutex<HashMap<Uuid, Task>>,
    shutdown: CancellationToken,
    workers: tokio::sync::Mutex<Vec<(String, JoinHandle<()>)>>,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        queue: TaskQueue,
        backend: Arc<dyn ResultBackend>,
        registry: Arc<HandlerRegistry>,
        cancellations: Arc<CancellationRegistry>,
        hub: Arc<MonitorHub>,
    ) -> Self {
        Self {
            config,
            queue,
            backend,
            registry,
            cancellations,
            hub,
            metrics: Arc::new(NoOpMetricsSink),
            spawner: Mutex::new(None),
            stats: StatsInner::default(),
            heartbeats: Mutex::new(HashMap::new()),
            worker_metrics: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            workers: tokio::sync::Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Replace the metrics sink. Call before `start`.
    pub fn set_metrics_sink(&mut self, metrics: Arc<dyn MetricsSink>) {
        self.metrics = metrics;
    }

    /// Inject the mechanism handlers use to spawn subtasks.
    pub fn set_subtask_spawner(&self, spawner: Arc<dyn SubtaskSpawner>) {
        *self.spawner.lock().expect("spawner lock poisoned") = Some(spawner);
    }

    /// Spawn the worker tasks. Errors if the pool is already running.
    pub async fn start(self: Arc<Self>) -> EngineResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidArgument(
                "worker pool is already running".to_string(),
            ));
        }
        self.stats.mark_started();

        let mut workers = self.workers.lock().await;
        for index in 0..self.config.concurrency {
            let worker_id = format!("worker-{}", index);
            let pool = self.clone();
            let id = worker_id.clone();
            let handle = tokio::spawn(async move {
                pool.run_worker(&id).await;
            });
            workers.push((worker_id, handle));
        }

        tracing::info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Worker pool started"
        );
        Ok(())
    }

    async fn run_worker(&self, worker_id: &str) {
        tracing::debug!(worker_id, "Worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.heartbeat(worker_id, None);

            let idle_start = Instant::now();
            let task = tokio::select! {
                task = self
                    .queue
                    .dequeue_any(&self.config.queues, self.config.dequeue_timeout) => task,
                _ = self.shutdown.cancelled() => break,
            };

            match task {
                Some(task) => {
                    let idle = idle_start.elapsed();
                    let busy_start = Instant::now();
                    self.process_one(worker_id, task).await;
                    self.report_worker_metrics(worker_id, idle, busy_start.elapsed());
                }
                None => continue,
            }
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    async fn process_one(&self, worker_id: &str, mut task: Task) {
        // Expired while sitting in the queue.
        if task.is_expired() {
            task.state = TaskState::Expired;
            task.completed_at = Some(Utc::now());
            self.store_state_logged(task.id, TaskState::Expired).await;
            self.cancellations.release(task.id);
            tracing::debug!(task_id = %task.id, task_name = %task.name, "Task expired on dequeue");
            return;
        }

        // Revoked while queued.
        if self.cancellations.is_requested(task.id) {
            task.state = TaskState::Cancelled;
            task.completed_at = Some(Utc::now());
            self.store_state_logged(task.id, TaskState::Cancelled).await;
            self.cancellations.release(task.id);
            tracing::debug!(task_id = %task.id, "Task cancelled before dispatch");
            return;
        }

        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());
        task.attempt_count += 1;
        self.store_state_logged(task.id, TaskState::Running).await;
        self.heartbeat(worker_id, Some(task.id));
        self.active
            .lock()
            .expect("active lock poisoned")
            .insert(task.id, task.clone());
        self.hub.notify_task_started(&task);
        self.metrics.record_job_started(&task.name);
        let started = Instant::now();

        let handler = match self.registry.get(&task.name) {
            Some(handler) => handler,
            None => {
                let message = format!("handler not found: {}", task.name);
                tracing::error!(task_id = %task.id, task_name = %task.name, "No handler registered");
                self.finish_failure(
                    &mut task,
                    message,
                    String::new(),
                    self.config.retry_on_routing_errors,
                    started,
                    None,
                )
                .await;
                self.clear_active(worker_id, task.id);
                return;
            }
        };

        let flag = self.cancellations.register(task.id);
        let ctx = Arc::new(TaskContext::new(
            task.clone(),
            task.attempt_count,
            flag.clone(),
            self.backend.clone(),
            self.spawner.lock().expect("spawner lock poisoned").clone(),
        ));

        // The handler runs in its own task so a panic is contained at the
        // attempt boundary.
        let mut execution = {
            let handler = handler.clone();
            let task = task.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { handler.execute(task, ctx).await })
        };

        match tokio::time::timeout(task.config.timeout, &mut execution).await {
            Ok(Ok(Ok(result))) => {
                self.finish_success(&mut task, result, started).await;
            }
            Ok(Ok(Err(error))) => {
                if flag.load(Ordering::Acquire) {
                    // Handler observed a cancellation request and returned.
                    self.finish_cancelled(&mut task, started).await;
                } else {
                    let message = error.to_string();
                    let traceback = error.traceback();
                    let recoverable = error.is_recoverable();
                    self.finish_failure(
                        &mut task,
                        message,
                        traceback,
                        recoverable,
                        started,
                        ctx.load_checkpoint(),
                    )
                    .await;
                }
            }
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    format!("handler panicked: {}", panic_message(join_error))
                } else {
                    "handler task aborted".to_string()
                };
                tracing::error!(task_id = %task.id, task_name = %task.name, "{}", message);
                self.finish_failure(
                    &mut task,
                    message,
                    String::new(),
                    true,
                    started,
                    ctx.load_checkpoint(),
                )
                .await;
            }
            Err(_elapsed) => {
                // Deadline: request cancellation, wait the grace window,
                // then abandon the attempt.
                ctx.request_cancellation();
                let _ = tokio::time::timeout(self.config.cancel_grace, &mut execution).await;
                execution.abort();
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    task_id = %task.id,
                    task_name = %task.name,
                    timeout_ms = task.config.timeout.as_millis() as u64,
                    "Task attempt timed out"
                );
                let timeout_msg = format!("task timed out after {:?}", task.config.timeout);
                self.finish_failure(
                    &mut task,
                    timeout_msg,
                    String::new(),
                    true,
                    started,
                    ctx.load_checkpoint(),
                )
                .await;
            }
        }

        self.clear_active(worker_id, task.id);
    }

    async fn finish_success(&self, task: &mut Task, result: Payload, started: Instant) {
        let duration = started.elapsed();
        task.state = TaskState::Succeeded;
        task.completed_at = Some(Utc::now());
        task.result = Some(result.clone());

        if let Err(e) = self.backend.store_result(task.id, result).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to store result");
        }
        self.store_state_logged(task.id, TaskState::Succeeded).await;

        self.hub.notify_task_completed(task, true);
        self.metrics
            .record_job_completed(&task.name, true, duration);
        self.stats.record_outcome(true, duration);
        self.cancellations.release(task.id);
        tracing::info!(
            task_id = %task.id,
            task_name = %task.name,
            attempt = task.attempt_count,
            duration_ms = duration.as_millis() as u64,
            "Task succeeded"
        );
    }

    async fn finish_cancelled(&self, task: &mut Task, started: Instant) {
        task.state = TaskState::Cancelled;
        task.completed_at = Some(Utc::now());
        self.store_state_logged(task.id, TaskState::Cancelled).await;
        self.hub.notify_task_completed(task, false);
        self.stats.record_cancelled(started.elapsed());
        self.cancellations.release(task.id);
        tracing::info!(task_id = %task.id, task_name = %task.name, "Task cancelled");
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failure(
        &self,
        task: &mut Task,
        message: String,
        traceback: String,
        recoverable: bool,
        started: Instant,
        checkpoint: Option<Payload>,
    ) {
        let duration = started.elapsed();
        task.state = TaskState::Failed;
        task.error_message = Some(message.clone());
        task.error_traceback = if traceback.is_empty() {
            None
        } else {
            Some(traceback.clone())
        };

        if recoverable && task.should_retry() {
            let delay = task.next_retry_delay();
            task.state = TaskState::Retrying;
            self.store_state_logged(task.id, TaskState::Retrying).await;

            let mut retry = task.clone();
            retry.state = TaskState::Pending;
            retry.started_at = None;
            retry.completed_at = None;
            retry.checkpoint = checkpoint;
            retry.config.eta = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| Utc::now().checked_add_signed(delay));

            match self.queue.enqueue(retry) {
                Ok(_) => {
                    self.store_state_logged(task.id, TaskState::Queued).await;
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_job_retried(&task.name);
                    self.cancellations.release(task.id);
                    tracing::info!(
                        task_id = %task.id,
                        task_name = %task.name,
                        attempt = task.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Task scheduled for retry"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        task_id = %task.id,
                        error = %e,
                        "Failed to re-enqueue retry; failing task"
                    );
                }
            }
        }

        task.state = TaskState::Failed;
        task.completed_at = Some(Utc::now());
        // Only terminal failures reach the backend; a retried attempt's
        // error stays on the task record until the outcome is known.
        if let Err(e) = self.backend.store_error(task.id, &message, &traceback).await {
            tracing::error!(task_id = %task.id, error = %e, "Failed to store error");
        }
        self.store_state_logged(task.id, TaskState::Failed).await;
        self.hub.notify_task_completed(task, false);
        self.hub.notify_task_failed(task, &message);
        self.metrics
            .record_job_completed(&task.name, false, duration);
        self.stats.record_outcome(false, duration);
        self.cancellations.release(task.id);
        tracing::error!(
            task_id = %task.id,
            task_name = %task.name,
            attempt = task.attempt_count,
            error = %message,
            "Task failed"
        );
    }

    async fn store_state_logged(&self, task_id: Uuid, state: TaskState) {
        // Losing a state write must never wedge the worker.
        if let Err(e) = self.backend.store_state(task_id, state).await {
            tracing::error!(task_id = %task_id, state = %state, error = %e, "Failed to store state");
        }
    }

    fn heartbeat(&self, worker_id: &str, active_task: Option<Uuid>) {
        let mut heartbeats = self.heartbeats.lock().expect("heartbeat lock poisoned");
        heartbeats.insert(
            worker_id.to_string(),
            WorkerHeartbeat {
                last_heartbeat: Utc::now(),
                active_task,
            },
        );
    }

    fn clear_active(&self, worker_id: &str, task_id: Uuid) {
        self.active
            .lock()
            .expect("active lock poisoned")
            .remove(&task_id);
        self.heartbeat(worker_id, None);
    }

    fn report_worker_metrics(&self, worker_id: &str, idle: Duration, busy: Duration) {
        let snapshot = {
            let mut metrics = self
                .worker_metrics
                .lock()
                .expect("worker metrics lock poisoned");
            let entry = metrics.entry(worker_id.to_string()).or_default();
            entry.jobs_processed += 1;
            entry.total_processing_time += busy;
            entry.idle_time += idle;
            entry.context_switches += 1;
            entry.clone()
        };
        self.metrics.update_worker_metrics(worker_id, snapshot);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop accepting work and wait up to `timeout` for in-flight attempts.
    /// Past the deadline workers are abandoned and their tasks recorded as
    /// failed.
    pub async fn shutdown_graceful(&self, timeout: Duration) -> EngineResult<()> {
        self.shutdown.cancel();
        let deadline = Instant::now() + timeout;
        let mut abandoned: Vec<String> = Vec::new();

        let mut workers = self.workers.lock().await;
        for (worker_id, mut handle) in workers.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
                abandoned.push(worker_id);
            }
        }
        drop(workers);
        self.running.store(false, Ordering::SeqCst);

        if abandoned.is_empty() {
            tracing::info!("Worker pool stopped gracefully");
            return Ok(());
        }

        self.fail_inflight("worker shutdown").await;
        for worker_id in &abandoned {
            self.hub.notify_worker_offline(worker_id);
        }
        tracing::warn!(
            abandoned = abandoned.len(),
            "Worker pool shutdown timed out; abandoned in-flight attempts"
        );
        Err(EngineError::Timeout)
    }

    /// Stop immediately, abandoning in-flight attempts.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut workers = self.workers.lock().await;
        let had_workers = !workers.is_empty();
        for (_, handle) in workers.drain(..) {
            handle.abort();
        }
        drop(workers);
        self.running.store(false, Ordering::SeqCst);
        self.fail_inflight("worker shutdown").await;
        if had_workers {
            tracing::info!("Worker pool stopped");
        }
    }

    async fn fail_inflight(&self, reason: &str) {
        let inflight: Vec<Task> = {
            let mut active = self.active.lock().expect("active lock poisoned");
            active.drain().map(|(_, task)| task).collect()
        };
        for mut task in inflight {
            task.state = TaskState::Failed;
            task.completed_at = Some(Utc::now());
            if let Err(e) = self.backend.store_error(task.id, reason, "").await {
                tracing::error!(task_id = %task.id, error = %e, "Failed to store shutdown error");
            }
            self.store_state_logged(task.id, TaskState::Failed).await;
            self.hub.notify_task_failed(&task, reason);
            self.cancellations.release(task.id);
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Number of workers currently executing a task.
    pub fn active_workers(&self) -> usize {
        self.heartbeats
            .lock()
            .expect("heartbeat lock poisoned")
            .values()
            .filter(|hb| hb.active_task.is_some())
            .count()
    }

    pub fn total_workers(&self) -> usize {
        self.config.concurrency
    }

    pub fn statistics(&self) -> WorkerStatistics {
        self.stats.snapshot()
    }

    /// Tasks currently being executed, for monitors.
    pub fn active_snapshot(&self) -> Vec<Task> {
        self.active
            .lock()
            .expect("active lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<(String, WorkerHeartbeat)> {
        self.heartbeats
            .lock()
            .expect("heartbeat lock poisoned")
            .iter()
            .map(|(id, hb)| (id.clone(), hb.clone()))
            .collect()
    }

    pub fn queues(&self) -> &[String] {
        &self.config.queues
    }

    pub fn dequeue_timeout(&self) -> Duration {
        self.config.dequeue_timeout
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        }
        Err(e) => e.to_string(),
    }
}
