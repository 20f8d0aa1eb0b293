//! Monitoring: lifecycle event fan-out and read-only system stats.
//!
//! [`MonitorHub`] is injected into the worker pool and fans lifecycle
//! events out to subscribers synchronously — handlers must return quickly.
//! [`TaskMonitor`] aggregates queue, worker, and task views without
//! mutating anything.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use tasklane_core::models::Task;

use crate::backend::ResultBackend;
use crate::queue::TaskQueue;
use crate::worker::{WorkerPool, WorkerStatistics};

/// Bound on the retained failed-task history.
const MAX_FAILED_TASKS: usize = 1000;

type TaskStartedHandler = Box<dyn Fn(&Task) + Send + Sync>;
type TaskCompletedHandler = Box<dyn Fn(&Task, bool) + Send + Sync>;
type TaskFailedHandler = Box<dyn Fn(&Task, &str) + Send + Sync>;
type WorkerOfflineHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Statistics for a single queue.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub name: String,
    pub pending: usize,
    pub running: usize,
    pub delayed: usize,
}

/// Information about one worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: String,
    pub queues: Vec<String>,
    pub active_tasks: usize,
    pub last_heartbeat: DateTime<Utc>,
    pub healthy: bool,
}

/// Lifecycle event fan-out. Handlers run synchronously inside the
/// notifier.
#[derive(Default)]
pub struct MonitorHub {
    started: RwLock<Vec<TaskStartedHandler>>,
    completed: RwLock<Vec<TaskCompletedHandler>>,
    failed: RwLock<Vec<TaskFailedHandler>>,
    offline: RwLock<Vec<WorkerOfflineHandler>>,
    failed_ring: Mutex<VecDeque<Task>>,
}

impl MonitorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_task_started(&self, handler: impl Fn(&Task) + Send + Sync + 'static) {
        self.started
            .write()
            .expect("monitor lock poisoned")
            .push(Box::new(handler));
    }

    pub fn on_task_completed(&self, handler: impl Fn(&Task, bool) + Send + Sync + 'static) {
        self.completed
            .write()
            .expect("monitor lock poisoned")
            .push(Box::new(handler));
    }

    pub fn on_task_failed(&self, handler: impl Fn(&Task, &str) + Send + Sync + 'static) {
        self.failed
            .write()
            .expect("monitor lock poisoned")
            .push(Box::new(handler));
    }

    pub fn on_worker_offline(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.offline
            .write()
            .expect("monitor lock poisoned")
            .push(Box::new(handler));
    }

    pub fn notify_task_started(&self, task: &Task) {
        for handler in self.started.read().expect("monitor lock poisoned").iter() {
            handler(task);
        }
    }

    pub fn notify_task_completed(&self, task: &Task, success: bool) {
        for handler in self.completed.read().expect("monitor lock poisoned").iter() {
            handler(task, success);
        }
    }

    pub fn notify_task_failed(&self, task: &Task, error: &str) {
        {
            let mut ring = self.failed_ring.lock().expect("monitor lock poisoned");
            if ring.len() == MAX_FAILED_TASKS {
                ring.pop_front();
            }
            ring.push_back(task.clone());
        }
        for handler in self.failed.read().expect("monitor lock poisoned").iter() {
            handler(task, error);
        }
    }

    pub fn notify_worker_offline(&self, worker_id: &str) {
        for handler in self.offline.read().expect("monitor lock poisoned").iter() {
            handler(worker_id);
        }
    }

    /// Most recent failed tasks, newest last.
    pub fn failed_tasks(&self, limit: usize) -> Vec<Task> {
        let ring = self.failed_ring.lock().expect("monitor lock poisoned");
        ring.iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

/// Read-only aggregator over queue, workers, and backend.
pub struct TaskMonitor {
    queue: TaskQueue,
    #[allow(dead_code)]
    backend: Arc<dyn ResultBackend>,
    pool: Arc<WorkerPool>,
    hub: Arc<MonitorHub>,
}

impl TaskMonitor {
    pub fn new(
        queue: TaskQueue,
        backend: Arc<dyn ResultBackend>,
        pool: Arc<WorkerPool>,
        hub: Arc<MonitorHub>,
    ) -> Self {
        Self {
            queue,
            backend,
            pool,
            hub,
        }
    }

    /// Per-queue `{pending, running, delayed}` counts. Delayed tasks are
    /// reported on the queue they will be released to.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let active = self.pool.active_snapshot();
        let delayed = self.queue.delayed_sizes();

        // A queue holding only delayed tasks has no heap yet; include it
        // anyway.
        let mut names = self.queue.queue_names();
        for name in delayed.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let running = active
                    .iter()
                    .filter(|task| task.config.queue == name)
                    .count();
                QueueStats {
                    pending: self.queue.queue_size(&name),
                    running,
                    delayed: delayed.get(&name).copied().unwrap_or(0),
                    name,
                }
            })
            .collect()
    }

    /// Per-worker status. A worker is healthy if it reported activity
    /// within three dequeue timeouts.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let threshold = chrono::Duration::from_std(self.pool.dequeue_timeout() * 3)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();
        let queues = self.pool.queues().to_vec();

        self.pool
            .heartbeats()
            .into_iter()
            .map(|(id, heartbeat)| WorkerInfo {
                id,
                queues: queues.clone(),
                active_tasks: usize::from(heartbeat.active_task.is_some()),
                last_heartbeat: heartbeat.last_heartbeat,
                healthy: now - heartbeat.last_heartbeat <= threshold,
            })
            .collect()
    }

    pub fn worker_statistics(&self) -> WorkerStatistics {
        self.pool.statistics()
    }

    /// Tasks currently being executed.
    pub fn list_active_tasks(&self) -> Vec<Task> {
        self.pool.active_snapshot()
    }

    /// Tasks waiting in a queue.
    pub fn list_pending_tasks(&self, queue_name: &str) -> Vec<Task> {
        self.queue.pending_snapshot(queue_name)
    }

    /// Most recently failed tasks.
    pub fn list_failed_tasks(&self, limit: usize) -> Vec<Task> {
        self.hub.failed_tasks(limit)
    }

    pub fn on_task_started(&self, handler: impl Fn(&Task) + Send + Sync + 'static) {
        self.hub.on_task_started(handler);
    }

    pub fn on_task_completed(&self, handler: impl Fn(&Task, bool) + Send + Sync + 'static) {
        self.hub.on_task_completed(handler);
    }

    pub fn on_task_failed(&self, handler: impl Fn(&Task, &str) + Send + Sync + 'static) {
        self.hub.on_task_failed(handler);
    }

    pub fn on_worker_offline(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.hub.on_worker_offline(handler);
    }
}
