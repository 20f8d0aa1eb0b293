//! Cooperative cancellation flags.
//!
//! Cancellation is a request, never a preemption. `revoke` and
//! `cancel_by_tag` set a flag here; the executing attempt's context exposes
//! it through `is_cancelled`, and handlers observe it at their own
//! suspension points.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Registry of per-task cancellation flags.
///
/// A flag requested before the task starts running is observed at dispatch;
/// a flag requested mid-run is observed by the handler through its context.
#[derive(Default)]
pub struct CancellationRegistry {
    flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the flag for a task. Called by the worker at attempt
    /// start; a pre-existing requested flag is preserved.
    pub fn register(&self, task_id: Uuid) -> Arc<AtomicBool> {
        let mut flags = self.flags.lock().expect("cancellation lock poisoned");
        flags.entry(task_id).or_default().clone()
    }

    /// Request cancellation for a task, creating the flag if the task has
    /// not started yet.
    pub fn request(&self, task_id: Uuid) {
        let flag = self.register(task_id);
        flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested for a task.
    pub fn is_requested(&self, task_id: Uuid) -> bool {
        let flags = self.flags.lock().expect("cancellation lock poisoned");
        flags
            .get(&task_id)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Drop the flag once the task reaches a terminal state.
    pub fn release(&self, task_id: Uuid) {
        let mut flags = self.flags.lock().expect("cancellation lock poisoned");
        flags.remove(&task_id);
    }

    pub fn len(&self) -> usize {
        self.flags.lock().expect("cancellation lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
