//! Task system facade.
//!
//! Owns the backend, queue, handler registry, worker pool, client, and the
//! optional scheduler and monitor, wiring them together and managing their
//! lifecycle: components are created backend-first and stopped in reverse.
//! Configuration is consumed here; the core components never read the
//! environment themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tasklane_core::models::Task;
use tasklane_core::{EngineConfig, EngineError, EngineResult, MetricsSink, Payload};

use crate::backend::{MemoryBackend, ResultBackend};
use crate::cancel::CancellationRegistry;
use crate::client::{TaskClient, TaskDefaults};
use crate::monitor::{MonitorHub, TaskMonitor};
use crate::queue::{QueueConfig, TaskQueue};
use crate::registry::{HandlerRegistry, TaskHandler};
use crate::result::AsyncResult;
use crate::scheduler::Scheduler;
use crate::worker::{WorkerConfig, WorkerPool, WorkerStatistics};

/// Interval between result-backend cleanup sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TaskSystemConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    /// Execution defaults applied to tasks built through `submit_named`.
    pub task_defaults: TaskDefaults,
    pub enable_scheduler: bool,
    pub enable_monitor: bool,
    /// Age after which terminal result entries are evicted; zero disables
    /// the periodic cleanup sweep.
    pub result_retention: Duration,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            task_defaults: TaskDefaults::default(),
            enable_scheduler: true,
            enable_monitor: true,
            result_retention: Duration::from_secs(86_400),
        }
    }
}

impl From<EngineConfig> for TaskSystemConfig {
    fn from(config: EngineConfig) -> Self {
        Self {
            queue: QueueConfig {
                capacity: config.queue_capacity,
            },
            worker: WorkerConfig {
                concurrency: config.worker_concurrency,
                queues: config.worker_queues,
                dequeue_timeout: config.dequeue_timeout,
                cancel_grace: config.cancel_grace,
                retry_on_routing_errors: false,
            },
            task_defaults: TaskDefaults {
                timeout: config.default_task_timeout,
                max_retries: config.default_max_retries,
                retry_delay: config.default_retry_delay,
                backoff_multiplier: config.default_backoff_multiplier,
            },
            enable_scheduler: config.enable_scheduler,
            enable_monitor: config.enable_monitor,
            result_retention: config.result_retention,
        }
    }
}

/// Facade integrating the task queue components behind one API.
pub struct TaskSystem {
    backend: Arc<dyn ResultBackend>,
    queue: TaskQueue,
    registry: Arc<HandlerRegistry>,
    #[allow(dead_code)]
    cancellations: Arc<CancellationRegistry>,
    hub: Arc<MonitorHub>,
    pool: Arc<WorkerPool>,
    client: TaskClient,
    scheduler: Option<Scheduler>,
    monitor: Option<TaskMonitor>,
    result_retention: Duration,
    cleanup: CancellationToken,
    running: AtomicBool,
}

impl TaskSystem {
    /// Build a system with the default in-memory result backend.
    pub fn new(config: TaskSystemConfig) -> Self {
        Self::with_backend(config, Arc::new(MemoryBackend::new()))
    }

    /// Build a system around an injected result backend.
    pub fn with_backend(config: TaskSystemConfig, backend: Arc<dyn ResultBackend>) -> Self {
        Self::build(config, backend, None)
    }

    /// Build a system with a metrics sink wired into the worker pool.
    pub fn with_metrics(
        config: TaskSystemConfig,
        backend: Arc<dyn ResultBackend>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self::build(config, backend, Some(metrics))
    }

    fn build(
        config: TaskSystemConfig,
        backend: Arc<dyn ResultBackend>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        let queue = TaskQueue::new(config.queue.clone());
        let registry = Arc::new(HandlerRegistry::new());
        let cancellations = Arc::new(CancellationRegistry::new());
        let hub = Arc::new(MonitorHub::new());

        let mut pool = WorkerPool::new(
            config.worker.clone(),
            queue.clone(),
            backend.clone(),
            registry.clone(),
            cancellations.clone(),
            hub.clone(),
        );
        if let Some(metrics) = metrics {
            pool.set_metrics_sink(metrics);
        }
        let pool = Arc::new(pool);

        let client = TaskClient::with_defaults(
            queue.clone(),
            backend.clone(),
            cancellations.clone(),
            config.task_defaults.clone(),
        );
        pool.set_subtask_spawner(Arc::new(client.clone()));

        let scheduler = config
            .enable_scheduler
            .then(|| Scheduler::new(client.clone()));
        let monitor = config.enable_monitor.then(|| {
            TaskMonitor::new(queue.clone(), backend.clone(), pool.clone(), hub.clone())
        });

        Self {
            backend,
            queue,
            registry,
            cancellations,
            hub,
            pool,
            client,
            scheduler,
            monitor,
            result_retention: config.result_retention,
            cleanup: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Build from environment configuration.
    pub fn from_env() -> anyhow::Result<Self> {
        let config = EngineConfig::from_env()?;
        Ok(Self::new(config.into()))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the worker pool and the result cleanup sweep.
    pub async fn start(&self) -> EngineResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidArgument(
                "task system is already running".to_string(),
            ));
        }

        self.pool.clone().start().await?;

        if !self.result_retention.is_zero() {
            let backend = self.backend.clone();
            let retention = self.result_retention;
            let token = self.cleanup.child_token();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = backend.cleanup_expired(retention).await {
                                tracing::error!(error = %e, "Result cleanup sweep failed");
                            }
                        }
                        _ = token.cancelled() => break,
                    }
                }
            });
        }

        tracing::info!("Task system started");
        Ok(())
    }

    /// Stop immediately: scheduler, orchestrations, workers, queue,
    /// backend, in that order. In-flight attempts are abandoned.
    pub async fn stop(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown();
        }
        self.cleanup.cancel();
        self.client.shutdown();
        self.pool.stop().await;
        self.queue.shutdown();
        self.backend.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Task system stopped");
    }

    /// Stop, waiting up to `timeout` for in-flight tasks to finish.
    pub async fn shutdown_graceful(&self, timeout: Duration) -> EngineResult<()> {
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown();
        }
        self.cleanup.cancel();
        // Stop feeding workers, then drain.
        self.queue.shutdown();
        let result = self.pool.shutdown_graceful(timeout).await;
        self.client.shutdown();
        self.backend.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Task system shut down");
        result
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.pool.is_running()
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    pub fn client(&self) -> &TaskClient {
        &self.client
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn backend(&self) -> Arc<dyn ResultBackend> {
        self.backend.clone()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    pub fn monitor(&self) -> Option<&TaskMonitor> {
        self.monitor.as_ref()
    }

    pub fn events(&self) -> &MonitorHub {
        &self.hub
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    pub fn register_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.registry.register(handler);
    }

    pub fn register_handler_fn<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Task, Arc<crate::context::TaskContext>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, tasklane_core::HandlerError>>
            + Send
            + 'static,
    {
        self.registry.register_fn(name, handler);
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    pub async fn submit(&self, task: Task) -> EngineResult<AsyncResult> {
        self.client.submit(task).await
    }

    pub async fn submit_named(&self, name: &str, payload: Payload) -> EngineResult<AsyncResult> {
        self.client.submit_named(name, payload).await
    }

    pub async fn submit_later(&self, task: Task, delay: Duration) -> EngineResult<AsyncResult> {
        self.client.submit_later(task, delay).await
    }

    pub async fn submit_batch(&self, tasks: Vec<Task>) -> EngineResult<Vec<AsyncResult>> {
        self.client.submit_batch(tasks).await
    }

    pub async fn chain(&self, tasks: Vec<Task>) -> EngineResult<AsyncResult> {
        self.client.chain(tasks).await
    }

    pub async fn chord(&self, parallels: Vec<Task>, callback: Task) -> EngineResult<AsyncResult> {
        self.client.chord(parallels, callback).await
    }

    pub fn result_of(&self, task_id: Uuid) -> AsyncResult {
        self.client.result_of(task_id)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    pub fn schedule_periodic(
        &self,
        name: impl Into<String>,
        template: Task,
        interval: Duration,
    ) -> EngineResult<()> {
        match &self.scheduler {
            Some(scheduler) => scheduler.add_periodic(name, template, interval),
            None => Err(EngineError::NotSupported(
                "scheduler is disabled".to_string(),
            )),
        }
    }

    pub fn schedule_cron(
        &self,
        name: impl Into<String>,
        template: Task,
        expression: &str,
    ) -> EngineResult<()> {
        match &self.scheduler {
            Some(scheduler) => scheduler.add_cron(name, template, expression),
            None => Err(EngineError::NotSupported(
                "scheduler is disabled".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn statistics(&self) -> WorkerStatistics {
        self.pool.statistics()
    }

    pub fn pending_count(&self, queue_name: &str) -> usize {
        self.queue.queue_size(queue_name)
    }

    pub fn active_workers(&self) -> usize {
        self.pool.active_workers()
    }

    pub fn total_workers(&self) -> usize {
        self.pool.total_workers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasklane_core::models::TaskBuilder;

    fn quick_config() -> TaskSystemConfig {
        TaskSystemConfig {
            worker: WorkerConfig {
                concurrency: 2,
                dequeue_timeout: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
            ..TaskSystemConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_submit_and_get() {
        let system = TaskSystem::new(quick_config());
        system.register_handler_fn("echo", |task: Task, _ctx| async move { Ok(task.payload) });
        system.start().await.unwrap();
        assert!(system.is_running());

        let result = system
            .submit_named("echo", Payload::new().with("msg", "hi"))
            .await
            .unwrap();
        let payload = result.get(Duration::from_secs(2)).await.unwrap();
        assert_eq!(payload.get_str("msg"), Some("hi"));

        system.stop().await;
        assert!(!system.is_running());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let system = TaskSystem::new(quick_config());
        system.start().await.unwrap();
        assert!(matches!(
            system.start().await,
            Err(EngineError::InvalidArgument(_))
        ));
        system.stop().await;
    }

    #[tokio::test]
    async fn test_scheduler_disabled_reports_not_supported() {
        let config = TaskSystemConfig {
            enable_scheduler: false,
            ..quick_config()
        };
        let system = TaskSystem::new(config);
        assert!(system.scheduler().is_none());

        let template = TaskBuilder::new("tick").build().unwrap();
        assert!(matches!(
            system.schedule_periodic("job", template, Duration::from_secs(60)),
            Err(EngineError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_monitor_disabled() {
        let config = TaskSystemConfig {
            enable_monitor: false,
            ..quick_config()
        };
        let system = TaskSystem::new(config);
        assert!(system.monitor().is_none());
    }

    #[tokio::test]
    async fn test_config_from_engine_config() {
        let engine = EngineConfig {
            worker_concurrency: 7,
            queue_capacity: 99,
            worker_queues: vec!["a".to_string(), "b".to_string()],
            ..EngineConfig::default()
        };
        let config: TaskSystemConfig = engine.into();
        assert_eq!(config.worker.concurrency, 7);
        assert_eq!(config.queue.capacity, 99);
        assert_eq!(config.worker.queues.len(), 2);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_completes_inflight() {
        let system = TaskSystem::new(quick_config());
        system.register_handler_fn("brief", |_task: Task, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(Payload::new().with("done", true))
        });
        system.start().await.unwrap();

        let result = system
            .submit_named("brief", Payload::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        system
            .shutdown_graceful(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.is_successful().await);
    }
}
