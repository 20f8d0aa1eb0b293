//! Hooks and traits for external monitoring integration
//!
//! This module provides trait interfaces that let the engine report worker
//! and job metrics without depending on a concrete metrics system. A
//! collector implements [`MetricsSink`]; the engine calls it as a pure sink
//! with no back-pressure.

use std::time::Duration;

/// Per-worker metrics reported by the worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    pub jobs_processed: u64,
    pub total_processing_time: Duration,
    pub idle_time: Duration,
    pub context_switches: u64,
}

/// Trait for reporting execution metrics to an external collector.
///
/// All methods are fire-and-forget; implementations must not block the
/// calling worker.
pub trait MetricsSink: Send + Sync {
    /// Report a worker's aggregate metrics.
    fn update_worker_metrics(&self, worker_id: &str, metrics: WorkerMetrics);

    /// Record that a job started executing.
    fn record_job_started(&self, task_name: &str);

    /// Record that a job finished, with its outcome and duration.
    fn record_job_completed(&self, task_name: &str, success: bool, duration: Duration);

    /// Record that a job was scheduled for retry.
    fn record_job_retried(&self, task_name: &str);
}

/// No-op implementation for when metrics collection is disabled.
pub struct NoOpMetricsSink;

impl MetricsSink for NoOpMetricsSink {
    fn update_worker_metrics(&self, _worker_id: &str, _metrics: WorkerMetrics) {}

    fn record_job_started(&self, _task_name: &str) {}

    fn record_job_completed(&self, _task_name: &str, _success: bool, _duration: Duration) {}

    fn record_job_retried(&self, _task_name: &str) {}
}
