//! Tasklane Engine
//!
//! The task execution engine: priority queues, the result backend, the
//! worker pool with retry/timeout/cancellation semantics, the submission
//! client with chain/chord workflow composition, async result handles, the
//! periodic/cron scheduler, and the monitor. [`TaskSystem`] ties the pieces
//! together behind a single facade.

pub mod backend;
pub mod cancel;
pub mod client;
pub mod context;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod result;
pub mod scheduler;
pub mod system;
pub mod worker;

pub use backend::{ErrorInfo, MemoryBackend, ProgressInfo, ResultBackend};
pub use cancel::CancellationRegistry;
pub use client::{TaskClient, TaskDefaults};
pub use context::{ProgressUpdate, SubtaskSpawner, TaskContext, TaskLogEntry, TaskLogLevel};
pub use monitor::{MonitorHub, QueueStats, TaskMonitor, WorkerInfo};
pub use queue::{QueueConfig, TaskQueue};
pub use registry::{HandlerRegistry, TaskHandler};
pub use result::AsyncResult;
pub use scheduler::{CronSchedule, ScheduleInfo, Scheduler};
pub use system::{TaskSystem, TaskSystemConfig};
pub use worker::{WorkerConfig, WorkerHeartbeat, WorkerPool, WorkerStatistics};
