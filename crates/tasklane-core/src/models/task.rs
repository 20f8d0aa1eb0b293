use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::payload::Payload;

/// Maximum delay before a retry attempt. Caps exponential backoff so that
/// high attempt counts do not produce excessively long delays.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Default per-attempt execution timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
    Expired,
}

impl TaskState {
    /// Terminal states are final; no further transitions are legal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled | TaskState::Expired
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Retrying => write!(f, "retrying"),
            TaskState::Cancelled => write!(f, "cancelled"),
            TaskState::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "succeeded" => Ok(TaskState::Succeeded),
            "failed" => Ok(TaskState::Failed),
            "retrying" => Ok(TaskState::Retrying),
            "cancelled" => Ok(TaskState::Cancelled),
            "expired" => Ok(TaskState::Expired),
            _ => Err(anyhow::anyhow!("Invalid task state: {}", s)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 3,
    #[default]
    Normal = 5,
    High = 7,
    Critical = 10,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            0..=3 => Priority::Low,
            4..=6 => Priority::Normal,
            7..=9 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority as i32
    }
}

/// Execution options attached to every task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Per-attempt wall-clock timeout. Must be greater than zero.
    pub timeout: Duration,
    /// Maximum number of attempts after the first failure; 0 means a single
    /// attempt only.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub retry_delay: Duration,
    /// Exponential backoff multiplier, at least 1.0.
    pub retry_backoff_multiplier: f64,
    pub priority: Priority,
    /// Earliest time the task becomes visible to workers.
    pub eta: Option<DateTime<Utc>>,
    /// Lifetime from `created_at` after which the task expires on dequeue.
    pub expires: Option<Duration>,
    pub queue: String,
    /// Labels used for bulk cancellation.
    pub tags: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TASK_TIMEOUT,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff_multiplier: 2.0,
            priority: Priority::Normal,
            eta: None,
            expires: None,
            queue: "default".to_string(),
            tags: Vec::new(),
        }
    }
}

/// A unit of work identified by a handler name and carrying a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub state: TaskState,
    pub config: TaskConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub payload: Payload,
    pub attempt_count: u32,
    pub progress: f64,
    pub progress_message: String,
    pub result: Option<Payload>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    /// Checkpoint saved by a previous attempt, restored into the next
    /// attempt's context on retry.
    pub checkpoint: Option<Payload>,
}

impl Task {
    /// Create a task with defaults. Prefer [`TaskBuilder`] for validated
    /// construction with non-default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: TaskState::Pending,
            config: TaskConfig::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            payload: Payload::new(),
            attempt_count: 0,
            progress: 0.0,
            progress_message: String::new(),
            result: None,
            error_message: None,
            error_traceback: None,
            checkpoint: None,
        }
    }

    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the task should be retried after a failure.
    ///
    /// The caller must have set the state to `Failed` and incremented the
    /// attempt count before asking.
    pub fn should_retry(&self) -> bool {
        self.state == TaskState::Failed && self.attempt_count < self.config.max_retries
    }

    /// Delay before the next retry attempt: exponential backoff from
    /// `retry_delay` with `retry_backoff_multiplier`, capped at one hour.
    pub fn next_retry_delay(&self) -> Duration {
        let base_ms = self.config.retry_delay.as_millis() as f64;
        let factor = self
            .config
            .retry_backoff_multiplier
            .powi(self.attempt_count as i32);
        let delay_ms = (base_ms * factor).min(MAX_RETRY_DELAY.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Whether the task's lifetime has elapsed.
    pub fn is_expired(&self) -> bool {
        match self.config.expires {
            Some(expires) => match chrono::Duration::from_std(expires)
                .ok()
                .and_then(|lifetime| self.created_at.checked_add_signed(lifetime))
            {
                Some(deadline) => Utc::now() >= deadline,
                // Lifetime too large to represent: never expires.
                None => false,
            },
            None => false,
        }
    }

    /// The time used for eligibility ordering: `eta` when scheduled,
    /// `created_at` otherwise.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.config.eta.unwrap_or(self.created_at)
    }

    /// Clone this task as a fresh submission: new id, reset state, timing,
    /// attempts, and outcome fields. Used by the scheduler when firing a
    /// schedule's template.
    pub fn from_template(&self) -> Task {
        Task {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            state: TaskState::Pending,
            config: TaskConfig {
                eta: None,
                ..self.config.clone()
            },
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            payload: self.payload.clone(),
            attempt_count: 0,
            progress: 0.0,
            progress_message: String::new(),
            result: None,
            error_message: None,
            error_traceback: None,
            checkpoint: None,
        }
    }

    /// Validate the invariants the builder enforces. The queue re-checks
    /// these on enqueue since `Task` fields are public.
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidTask(
                "task name cannot be empty".to_string(),
            ));
        }
        if self.config.timeout.is_zero() {
            return Err(EngineError::InvalidTask(
                "task timeout must be greater than zero".to_string(),
            ));
        }
        if self.config.retry_backoff_multiplier < 1.0 {
            return Err(EngineError::InvalidTask(format!(
                "retry backoff multiplier must be at least 1.0, got {}",
                self.config.retry_backoff_multiplier
            )));
        }
        if self.config.queue.trim().is_empty() {
            return Err(EngineError::InvalidTask(
                "queue name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for validated task construction.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            task: Task::new(name),
        }
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.task.config.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.task.config.timeout = timeout;
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.task.config.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.task.config.retry_delay = delay;
        self
    }

    pub fn retry_backoff(mut self, multiplier: f64) -> Self {
        self.task.config.retry_backoff_multiplier = multiplier;
        self
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.task.config.queue = queue_name.into();
        self
    }

    pub fn eta(mut self, execute_at: DateTime<Utc>) -> Self {
        self.task.config.eta = Some(execute_at);
        self
    }

    /// Schedule execution `delay` from now.
    pub fn countdown(mut self, delay: Duration) -> Self {
        self.task.config.eta = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay));
        self
    }

    pub fn expires(mut self, expires_in: Duration) -> Self {
        self.task.config.expires = Some(expires_in);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.task.config.tags.push(tag.into());
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.task.config.tags.extend(tags);
        self
    }

    pub fn build(self) -> EngineResult<Task> {
        self.task.validate()?;
        Ok(self.task)
    }
}
