//! Priority task queue: per-queue priority heaps, a delayed-task heap, and
//! a release daemon.
//!
//! Eligible tasks are ordered by priority (descending), then eligibility
//! time (`eta` or `created_at`, ascending), then global insertion order.
//! Tasks with a future `eta` sit in a single delayed min-heap; a daemon
//! task sleeps until the head's `eta`, moves due entries into their owning
//! queue, and wakes blocked dequeuers.
//!
//! Lock discipline: a heap lock may nest the index lock; the index lock
//! never nests a heap lock. Cancellation removes a task from the index
//! only — heap entries whose id is no longer indexed are dropped when they
//! surface at the top.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tasklane_core::models::{Task, TaskState};
use tasklane_core::{EngineError, EngineResult};

/// How long the release daemon sleeps when no delayed task exists.
const IDLE_RELEASE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum outstanding (queued + delayed) tasks across all queues.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

struct QueuedEntry {
    task: Task,
    eligible: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier eligibility, then
        // earlier insertion.
        self.task
            .config
            .priority
            .cmp(&other.task.config.priority)
            .then_with(|| other.eligible.cmp(&self.eligible))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct DelayedEntry {
    task: Task,
    eta: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap on eta via reversed comparison.
        other
            .eta
            .cmp(&self.eta)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct NamedQueue {
    heap: Mutex<BinaryHeap<QueuedEntry>>,
}

struct IndexEntry {
    queue: String,
    tags: Vec<String>,
    delayed: bool,
}

struct QueueInner {
    capacity: usize,
    queues: Mutex<HashMap<String, Arc<NamedQueue>>>,
    delayed: Mutex<BinaryHeap<DelayedEntry>>,
    /// Live queued tasks by id. Absence of a heap entry's id here means the
    /// entry was cancelled.
    index: Mutex<HashMap<Uuid, IndexEntry>>,
    outstanding: AtomicUsize,
    seq: AtomicU64,
    /// Cursor rotating the scan start across multi-queue polls, so equal
    /// top priorities round-robin between queues.
    rotation: AtomicUsize,
    ready: Notify,
    delayed_changed: Notify,
    shutdown: CancellationToken,
}

/// Thread-safe, in-memory priority queue over named sub-queues.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create the queue and spawn its delayed-release daemon. Must be
    /// called from within a tokio runtime.
    pub fn new(config: QueueConfig) -> Self {
        let inner = Arc::new(QueueInner {
            capacity: config.capacity,
            queues: Mutex::new(HashMap::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            index: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            rotation: AtomicUsize::new(0),
            ready: Notify::new(),
            delayed_changed: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let daemon_inner = inner.clone();
        tokio::spawn(async move {
            Self::release_loop(daemon_inner).await;
        });

        Self { inner }
    }

    /// Add a task. Future-`eta` tasks go to the delayed heap; everything
    /// else becomes immediately eligible. The task moves to `Queued`.
    pub fn enqueue(&self, mut task: Task) -> EngineResult<Uuid> {
        task.validate()?;

        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        if self.inner.outstanding.load(Ordering::SeqCst) >= self.inner.capacity {
            return Err(EngineError::QueueFull {
                queue: task.config.queue.clone(),
                capacity: self.inner.capacity,
            });
        }

        task.state = TaskState::Queued;
        let task_id = task.id;
        let queue_name = task.config.queue.clone();
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let delayed = task.config.eta.map(|eta| eta > now).unwrap_or(false);

        {
            let mut index = self.inner.index.lock().expect("queue index lock poisoned");
            index.insert(
                task_id,
                IndexEntry {
                    queue: queue_name.clone(),
                    tags: task.config.tags.clone(),
                    delayed,
                },
            );
        }
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);

        if delayed {
            let eta = task.config.eta.expect("delayed task has eta");
            let mut heap = self.inner.delayed.lock().expect("delayed lock poisoned");
            heap.push(DelayedEntry { task, eta, seq });
            drop(heap);
            self.inner.delayed_changed.notify_waiters();
        } else {
            let eligible = task.eligible_at();
            let queue = self.named_queue(&queue_name);
            let mut heap = queue.heap.lock().expect("queue heap lock poisoned");
            heap.push(QueuedEntry {
                task,
                eligible,
                seq,
            });
            drop(heap);
            self.inner.ready.notify_waiters();
        }

        tracing::debug!(task_id = %task_id, queue = %queue_name, delayed, "Task enqueued");
        Ok(task_id)
    }

    /// Block up to `timeout` for the best eligible task on one queue.
    pub async fn dequeue(&self, queue_name: &str, timeout: Duration) -> Option<Task> {
        self.dequeue_any(std::slice::from_ref(&queue_name), timeout)
            .await
    }

    /// Block up to `timeout` for the best eligible task across the named
    /// queues. A strictly higher top priority always wins; queues whose
    /// tops tie on priority are serviced round-robin. Returns `None` on
    /// timeout or shutdown.
    pub async fn dequeue_any<S: AsRef<str>>(&self, names: &[S], timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.inner.shutdown.is_cancelled() {
                return None;
            }
            if let Some(task) = self.try_pop(names) {
                return Some(task);
            }

            // Register before the re-check so an enqueue between the check
            // and the await is not lost.
            let mut notified = Box::pin(self.inner.ready.notified());
            notified.as_mut().enable();

            if let Some(task) = self.try_pop(names) {
                return Some(task);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = self.inner.shutdown.cancelled() => return None,
            }
        }
    }

    /// Pop the best eligible task without blocking. Queues are scanned
    /// starting from a rotating cursor; only a strictly higher top
    /// priority moves the choice off the rotation's first candidate, so
    /// equal top priorities alternate between queues across polls. Within
    /// the chosen queue the heap order (priority, eligibility, insertion)
    /// applies.
    fn try_pop<S: AsRef<str>>(&self, names: &[S]) -> Option<Task> {
        if names.is_empty() {
            return None;
        }
        let start = self.inner.rotation.fetch_add(1, Ordering::Relaxed) % names.len();
        let mut best_queue: Option<String> = None;
        let mut best_priority = i32::MIN;

        for offset in 0..names.len() {
            let name = names[(start + offset) % names.len()].as_ref();
            let queue = match self.existing_queue(name) {
                Some(queue) => queue,
                None => continue,
            };
            let mut heap = queue.heap.lock().expect("queue heap lock poisoned");
            self.drop_stale_tops(&mut heap);
            if let Some(top) = heap.peek() {
                let priority = top.task.config.priority.as_i32();
                if best_queue.is_none() || priority > best_priority {
                    best_priority = priority;
                    best_queue = Some(name.to_string());
                }
            }
        }

        let queue_name = best_queue?;
        let queue = self.existing_queue(&queue_name)?;
        let mut heap = queue.heap.lock().expect("queue heap lock poisoned");
        self.drop_stale_tops(&mut heap);
        let entry = heap.pop()?;
        drop(heap);

        {
            let mut index = self.inner.index.lock().expect("queue index lock poisoned");
            index.remove(&entry.task.id);
        }
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        Some(entry.task)
    }

    /// Pop and discard top entries whose id was cancelled out of the index.
    fn drop_stale_tops(&self, heap: &mut BinaryHeap<QueuedEntry>) {
        loop {
            let stale = match heap.peek() {
                Some(top) => {
                    let index = self.inner.index.lock().expect("queue index lock poisoned");
                    !index.contains_key(&top.task.id)
                }
                None => break,
            };
            if stale {
                heap.pop();
            } else {
                break;
            }
        }
    }

    /// Mark a queued task cancelled. Tasks already dispatched to a worker
    /// are not affected.
    pub fn cancel(&self, task_id: Uuid) -> EngineResult<()> {
        let removed = {
            let mut index = self.inner.index.lock().expect("queue index lock poisoned");
            index.remove(&task_id)
        };
        match removed {
            Some(_) => {
                self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!(task_id = %task_id, "Queued task cancelled");
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "task {} is not queued",
                task_id
            ))),
        }
    }

    /// Cancel every queued task carrying the tag. Returns the cancelled
    /// ids.
    pub fn cancel_by_tag(&self, tag: &str) -> Vec<Uuid> {
        let ids: Vec<Uuid> = {
            let mut index = self.inner.index.lock().expect("queue index lock poisoned");
            let ids: Vec<Uuid> = index
                .iter()
                .filter(|(_, entry)| entry.tags.iter().any(|t| t == tag))
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                index.remove(id);
            }
            ids
        };
        self.inner.outstanding.fetch_sub(ids.len(), Ordering::SeqCst);
        if !ids.is_empty() {
            tracing::debug!(tag = %tag, count = ids.len(), "Queued tasks cancelled by tag");
        }
        ids
    }

    /// Number of immediately eligible tasks in a queue.
    pub fn queue_size(&self, queue_name: &str) -> usize {
        let index = self.inner.index.lock().expect("queue index lock poisoned");
        index
            .values()
            .filter(|entry| entry.queue == queue_name && !entry.delayed)
            .count()
    }

    /// Number of delayed tasks across all queues.
    pub fn delayed_size(&self) -> usize {
        let index = self.inner.index.lock().expect("queue index lock poisoned");
        index.values().filter(|entry| entry.delayed).count()
    }

    /// Delayed-task counts keyed by the queue each task will be released
    /// to.
    pub fn delayed_sizes(&self) -> HashMap<String, usize> {
        let index = self.inner.index.lock().expect("queue index lock poisoned");
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in index.values().filter(|entry| entry.delayed) {
            *counts.entry(entry.queue.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Total outstanding tasks (eligible + delayed).
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Names of every queue that has ever been created.
    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.inner.queues.lock().expect("queue registry lock poisoned");
        queues.keys().cloned().collect()
    }

    /// Snapshot of the live pending tasks in a queue, for monitors.
    pub fn pending_snapshot(&self, queue_name: &str) -> Vec<Task> {
        let queue = match self.existing_queue(queue_name) {
            Some(queue) => queue,
            None => return Vec::new(),
        };
        let heap = queue.heap.lock().expect("queue heap lock poisoned");
        let index = self.inner.index.lock().expect("queue index lock poisoned");
        heap.iter()
            .filter(|entry| index.contains_key(&entry.task.id))
            .map(|entry| entry.task.clone())
            .collect()
    }

    /// Stop the queue: wakes every blocked dequeuer and the release daemon.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.ready.notify_waiters();
        self.inner.delayed_changed.notify_waiters();
        tracing::info!("Task queue shut down");
    }

    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    fn named_queue(&self, name: &str) -> Arc<NamedQueue> {
        let mut queues = self.inner.queues.lock().expect("queue registry lock poisoned");
        queues.entry(name.to_string()).or_default().clone()
    }

    fn existing_queue(&self, name: &str) -> Option<Arc<NamedQueue>> {
        let queues = self.inner.queues.lock().expect("queue registry lock poisoned");
        queues.get(name).cloned()
    }

    async fn release_loop(inner: Arc<QueueInner>) {
        let queue = TaskQueue { inner };
        loop {
            if queue.inner.shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let mut due = Vec::new();
            let next_eta = {
                let mut delayed = queue.inner.delayed.lock().expect("delayed lock poisoned");
                while let Some(top) = delayed.peek() {
                    if top.eta <= now {
                        due.push(delayed.pop().expect("peeked entry exists"));
                    } else {
                        break;
                    }
                }
                delayed.peek().map(|entry| entry.eta)
            };

            let mut released = 0_usize;
            for entry in due {
                let live = {
                    let mut index = queue.inner.index.lock().expect("queue index lock poisoned");
                    match index.get_mut(&entry.task.id) {
                        Some(index_entry) => {
                            index_entry.delayed = false;
                            true
                        }
                        // Cancelled while delayed; already unindexed.
                        None => false,
                    }
                };
                if live {
                    let named = queue.named_queue(&entry.task.config.queue);
                    let mut heap = named.heap.lock().expect("queue heap lock poisoned");
                    heap.push(QueuedEntry {
                        eligible: entry.eta,
                        task: entry.task,
                        seq: entry.seq,
                    });
                    released += 1;
                }
            }
            if released > 0 {
                tracing::trace!(released, "Released delayed tasks");
                queue.inner.ready.notify_waiters();
            }

            let mut notified = Box::pin(queue.inner.delayed_changed.notified());
            notified.as_mut().enable();

            // An earlier head may have arrived before we registered.
            let head_changed = {
                let delayed = queue.inner.delayed.lock().expect("delayed lock poisoned");
                delayed.peek().map(|entry| entry.eta) != next_eta
            };
            if head_changed {
                continue;
            }

            let wait = next_eta
                .map(|eta| (eta - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_RELEASE_WAIT);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
                _ = queue.inner.shutdown.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasklane_core::models::{Priority, TaskBuilder};

    fn build(name: &str) -> Task {
        TaskBuilder::new(name).build().unwrap()
    }

    fn build_with_priority(name: &str, priority: Priority) -> Task {
        TaskBuilder::new(name).priority(priority).build().unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_moves_task_to_queued() {
        let queue = TaskQueue::new(QueueConfig::default());
        queue.enqueue(build("echo")).unwrap();
        let task = queue.dequeue("default", Duration::from_millis(100)).await;
        assert_eq!(task.unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_task() {
        let queue = TaskQueue::new(QueueConfig::default());
        let mut task = build("echo");
        task.name = String::new();
        assert!(matches!(
            queue.enqueue(task),
            Err(EngineError::InvalidTask(_))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_queue_full() {
        let queue = TaskQueue::new(QueueConfig { capacity: 2 });
        queue.enqueue(build("a")).unwrap();
        queue.enqueue(build("b")).unwrap();
        assert!(matches!(
            queue.enqueue(build("c")),
            Err(EngineError::QueueFull { .. })
        ));
    }

    #[tokio::test]
    async fn test_dequeue_timeout_returns_none() {
        let queue = TaskQueue::new(QueueConfig::default());
        let task = queue.dequeue("default", Duration::from_millis(50)).await;
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = TaskQueue::new(QueueConfig::default());
        queue.enqueue(build_with_priority("low", Priority::Low)).unwrap();
        queue
            .enqueue(build_with_priority("critical", Priority::Critical))
            .unwrap();
        queue
            .enqueue(build_with_priority("normal", Priority::Normal))
            .unwrap();
        queue.enqueue(build_with_priority("high", Priority::High)).unwrap();

        let mut names = Vec::new();
        for _ in 0..4 {
            let task = queue
                .dequeue("default", Duration::from_millis(100))
                .await
                .unwrap();
            names.push(task.name);
        }
        assert_eq!(names, vec!["critical", "high", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_fifo_within_equal_priority() {
        let queue = TaskQueue::new(QueueConfig::default());
        for i in 0..5 {
            let mut task = build("job");
            task.payload.set("i", i as i64);
            // Same created_at so insertion order is the only tiebreak.
            task.created_at = chrono::DateTime::<Utc>::MIN_UTC;
            queue.enqueue(task).unwrap();
        }
        for i in 0..5 {
            let task = queue
                .dequeue("default", Duration::from_millis(100))
                .await
                .unwrap();
            assert_eq!(task.payload.get_i64("i"), Some(i));
        }
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let queue = TaskQueue::new(QueueConfig::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue("default", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.enqueue(build("late")).unwrap();

        let task = waiter.await.unwrap();
        assert_eq!(task.unwrap().name, "late");
    }

    #[tokio::test]
    async fn test_delayed_task_invisible_until_eta() {
        let queue = TaskQueue::new(QueueConfig::default());
        let task = TaskBuilder::new("later")
            .countdown(Duration::from_millis(150))
            .build()
            .unwrap();
        queue.enqueue(task).unwrap();

        assert_eq!(queue.delayed_size(), 1);
        assert!(queue
            .dequeue("default", Duration::from_millis(30))
            .await
            .is_none());

        let task = queue.dequeue("default", Duration::from_secs(2)).await;
        assert_eq!(task.unwrap().name, "later");
        assert_eq!(queue.delayed_size(), 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let queue = TaskQueue::new(QueueConfig::default());
        let id = queue.enqueue(build("doomed")).unwrap();

        queue.cancel(id).unwrap();
        assert!(queue
            .dequeue("default", Duration::from_millis(30))
            .await
            .is_none());
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_not_found() {
        let queue = TaskQueue::new(QueueConfig::default());
        assert!(matches!(
            queue.cancel(Uuid::new_v4()),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_by_tag() {
        let queue = TaskQueue::new(QueueConfig::default());
        let tagged_a = TaskBuilder::new("a").tag("bulk").build().unwrap();
        let tagged_b = TaskBuilder::new("b").tag("bulk").build().unwrap();
        let untagged = TaskBuilder::new("c").build().unwrap();
        queue.enqueue(tagged_a).unwrap();
        queue.enqueue(tagged_b).unwrap();
        queue.enqueue(untagged).unwrap();

        let cancelled = queue.cancel_by_tag("bulk");
        assert_eq!(cancelled.len(), 2);

        let survivor = queue
            .dequeue("default", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(survivor.name, "c");
        assert!(queue
            .dequeue("default", Duration::from_millis(30))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_cancelled_delayed_task_is_not_released() {
        let queue = TaskQueue::new(QueueConfig::default());
        let task = TaskBuilder::new("later")
            .countdown(Duration::from_millis(50))
            .build()
            .unwrap();
        let id = queue.enqueue(task).unwrap();
        queue.cancel(id).unwrap();

        assert!(queue
            .dequeue("default", Duration::from_millis(200))
            .await
            .is_none());
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_any_prefers_higher_priority_across_queues() {
        let queue = TaskQueue::new(QueueConfig::default());
        let normal = TaskBuilder::new("normal").queue("first").build().unwrap();
        let critical = TaskBuilder::new("critical")
            .queue("second")
            .priority(Priority::Critical)
            .build()
            .unwrap();
        queue.enqueue(normal).unwrap();
        queue.enqueue(critical).unwrap();

        let task = queue
            .dequeue_any(&["first", "second"], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(task.name, "critical");
    }

    #[tokio::test]
    async fn test_dequeue_any_round_robins_equal_top_priorities() {
        let queue = TaskQueue::new(QueueConfig::default());
        for _ in 0..2 {
            let task = TaskBuilder::new("job").queue("first").build().unwrap();
            queue.enqueue(task).unwrap();
        }
        for _ in 0..2 {
            let task = TaskBuilder::new("job").queue("second").build().unwrap();
            queue.enqueue(task).unwrap();
        }

        let mut served = Vec::new();
        for _ in 0..4 {
            let task = queue
                .dequeue_any(&["first", "second"], Duration::from_millis(100))
                .await
                .unwrap();
            served.push(task.config.queue.clone());
        }

        // Equal top priorities alternate between the queues instead of
        // draining the globally oldest entries first.
        assert_eq!(served, vec!["first", "second", "first", "second"]);
    }

    #[tokio::test]
    async fn test_queue_size_counts_only_eligible() {
        let queue = TaskQueue::new(QueueConfig::default());
        queue.enqueue(build("now")).unwrap();
        let delayed = TaskBuilder::new("later")
            .countdown(Duration::from_secs(60))
            .build()
            .unwrap();
        queue.enqueue(delayed).unwrap();

        assert_eq!(queue.queue_size("default"), 1);
        assert_eq!(queue.delayed_size(), 1);
        assert_eq!(queue.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_delayed_sizes_grouped_by_queue() {
        let queue = TaskQueue::new(QueueConfig::default());
        for _ in 0..2 {
            let task = TaskBuilder::new("later")
                .queue("bulk")
                .countdown(Duration::from_secs(60))
                .build()
                .unwrap();
            queue.enqueue(task).unwrap();
        }
        let task = TaskBuilder::new("later")
            .countdown(Duration::from_secs(60))
            .build()
            .unwrap();
        queue.enqueue(task).unwrap();

        let delayed = queue.delayed_sizes();
        assert_eq!(delayed.get("bulk").copied(), Some(2));
        assert_eq!(delayed.get("default").copied(), Some(1));
        assert_eq!(queue.delayed_size(), 3);
    }

    #[tokio::test]
    async fn test_pending_snapshot() {
        let queue = TaskQueue::new(QueueConfig::default());
        queue.enqueue(build("a")).unwrap();
        queue.enqueue(build("b")).unwrap();
        let snapshot = queue.pending_snapshot("default");
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_dequeue_and_rejects_enqueue() {
        let queue = TaskQueue::new(QueueConfig::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue("default", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.shutdown();
        assert!(waiter.await.unwrap().is_none());
        assert!(matches!(
            queue.enqueue(build("too-late")),
            Err(EngineError::Shutdown)
        ));
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_eta_orders_within_priority() {
        let queue = TaskQueue::new(QueueConfig::default());
        let now = Utc::now();

        // Both already eligible; the one with the earlier eta wins.
        let mut later = build("later");
        later.config.eta = Some(now - chrono::Duration::milliseconds(10));
        let mut earlier = build("earlier");
        earlier.config.eta = Some(now - chrono::Duration::milliseconds(500));

        queue.enqueue(later).unwrap();
        queue.enqueue(earlier).unwrap();

        let first = queue
            .dequeue("default", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(first.name, "earlier");
    }
}
