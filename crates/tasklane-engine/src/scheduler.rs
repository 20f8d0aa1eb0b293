//! Periodic and cron-driven task scheduling.
//!
//! Each named schedule runs on its own tokio task. On every fire the
//! schedule's template is cloned with a fresh id and submitted through the
//! client. Missed ticks during downtime are not back-filled; the next fire
//! is strictly in the future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tasklane_core::models::Task;
use tasklane_core::{EngineError, EngineResult};

use crate::client::TaskClient;

/// Bound on the forward scan in [`CronSchedule::next_after`]: one leap
/// year of minutes.
const MAX_CRON_SCAN_MINUTES: i64 = 366 * 24 * 60;

/// A parsed 5-field cron expression: minute, hour, day-of-month, month,
/// day-of-week. Fields accept `*`, values, lists, ranges, and steps
/// (numeric only; 7 is accepted as Sunday in the day-of-week field).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> EngineResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::InvalidArgument(format!(
                "cron expression must have 5 fields, got {}: '{}'",
                fields.len(),
                expression
            )));
        }

        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)?;
        let days_of_month = parse_field(fields[2], 1, 31)?;
        let months = parse_field(fields[3], 1, 12)?;
        let mut days_of_week = parse_field(fields[4], 0, 7)?;
        // 7 is an alias for Sunday.
        for dow in days_of_week.iter_mut() {
            if *dow == 7 {
                *dow = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    /// Whether the schedule fires at the given minute.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minutes.contains(&at.minute())
            || !self.hours.contains(&at.hour())
            || !self.months.contains(&at.month())
        {
            return false;
        }

        let dom_match = self.days_of_month.contains(&at.day());
        let dow_match = self
            .days_of_week
            .contains(&at.weekday().num_days_from_sunday());

        // Standard cron: when both day fields are restricted, either may
        // match; otherwise the restricted one (or both wildcards) decides.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_match || dow_match,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (false, false) => true,
        }
    }

    /// The first matching wall-clock minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + chrono::Duration::minutes(1);

        for _ in 0..MAX_CRON_SCAN_MINUTES {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> EngineResult<Vec<u32>> {
    if field.is_empty() {
        return Err(EngineError::InvalidArgument(
            "empty cron field".to_string(),
        ));
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    EngineError::InvalidArgument(format!("invalid cron step: '{}'", part))
                })?;
                if step == 0 {
                    return Err(EngineError::InvalidArgument(format!(
                        "cron step cannot be zero: '{}'",
                        part
                    )));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((low, high)) = range_part.split_once('-') {
            let low: u32 = low.parse().map_err(|_| {
                EngineError::InvalidArgument(format!("invalid cron range: '{}'", part))
            })?;
            let high: u32 = high.parse().map_err(|_| {
                EngineError::InvalidArgument(format!("invalid cron range: '{}'", part))
            })?;
            if low > high {
                return Err(EngineError::InvalidArgument(format!(
                    "cron range start exceeds end: '{}'",
                    part
                )));
            }
            (low, high)
        } else {
            let value: u32 = range_part.parse().map_err(|_| {
                EngineError::InvalidArgument(format!("invalid cron value: '{}'", part))
            })?;
            (value, value)
        };

        if start < min || end > max {
            return Err(EngineError::InvalidArgument(format!(
                "cron value out of range [{}, {}]: '{}'",
                min, max, part
            )));
        }

        values.extend((start..=end).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}

enum ScheduleKind {
    Periodic(Duration),
    Cron(String),
}

impl ScheduleKind {
    fn describe(&self) -> String {
        match self {
            ScheduleKind::Periodic(interval) => format!("every {:?}", interval),
            ScheduleKind::Cron(expression) => format!("cron '{}'", expression),
        }
    }
}

/// Summary of one named schedule.
#[derive(Debug, Clone)]
pub struct ScheduleInfo {
    pub name: String,
    pub schedule: String,
    pub task_name: String,
}

struct ScheduleEntry {
    kind: ScheduleKind,
    task_name: String,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    client: TaskClient,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
    shutdown: CancellationToken,
}

/// Named periodic/cron enqueuer over a [`TaskClient`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(client: TaskClient) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                client,
                entries: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Fire `template` every `interval`, starting one interval from now.
    pub fn add_periodic(
        &self,
        name: impl Into<String>,
        template: Task,
        interval: Duration,
    ) -> EngineResult<()> {
        if interval.is_zero() {
            return Err(EngineError::InvalidArgument(
                "schedule interval must be greater than zero".to_string(),
            ));
        }
        template.validate()?;
        let name = name.into();

        let mut entries = self.inner.entries.lock().expect("scheduler lock poisoned");
        if entries.contains_key(&name) {
            return Err(EngineError::InvalidArgument(format!(
                "schedule '{}' already exists",
                name
            )));
        }

        let client = self.inner.client.clone();
        let token = self.inner.shutdown.child_token();
        let schedule_name = name.clone();
        let task_name = template.name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + interval,
                interval,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => fire(&client, &schedule_name, &template).await,
                    _ = token.cancelled() => break,
                }
            }
        });

        entries.insert(
            name.clone(),
            ScheduleEntry {
                kind: ScheduleKind::Periodic(interval),
                task_name,
                handle,
            },
        );
        tracing::info!(schedule = %name, interval_ms = interval.as_millis() as u64, "Periodic schedule added");
        Ok(())
    }

    /// Fire `template` at every minute matching the cron expression.
    pub fn add_cron(
        &self,
        name: impl Into<String>,
        template: Task,
        expression: &str,
    ) -> EngineResult<()> {
        let schedule = CronSchedule::parse(expression)?;
        template.validate()?;
        let name = name.into();

        let mut entries = self.inner.entries.lock().expect("scheduler lock poisoned");
        if entries.contains_key(&name) {
            return Err(EngineError::InvalidArgument(format!(
                "schedule '{}' already exists",
                name
            )));
        }

        let client = self.inner.client.clone();
        let token = self.inner.shutdown.child_token();
        let schedule_name = name.clone();
        let task_name = template.name.clone();
        let handle = tokio::spawn(async move {
            loop {
                let next = match schedule.next_after(Utc::now()) {
                    Some(next) => next,
                    None => {
                        tracing::warn!(schedule = %schedule_name, "Cron schedule has no future fire time");
                        break;
                    }
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => fire(&client, &schedule_name, &template).await,
                    _ = token.cancelled() => break,
                }
            }
        });

        entries.insert(
            name.clone(),
            ScheduleEntry {
                kind: ScheduleKind::Cron(expression.to_string()),
                task_name,
                handle,
            },
        );
        tracing::info!(schedule = %name, expression = %expression, "Cron schedule added");
        Ok(())
    }

    /// Remove a schedule and stop its runner.
    pub fn remove(&self, name: &str) -> EngineResult<()> {
        let removed = {
            let mut entries = self.inner.entries.lock().expect("scheduler lock poisoned");
            entries.remove(name)
        };
        match removed {
            Some(entry) => {
                entry.handle.abort();
                tracing::info!(schedule = %name, "Schedule removed");
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("schedule '{}'", name))),
        }
    }

    pub fn list(&self) -> Vec<ScheduleInfo> {
        let entries = self.inner.entries.lock().expect("scheduler lock poisoned");
        entries
            .iter()
            .map(|(name, entry)| ScheduleInfo {
                name: name.clone(),
                schedule: entry.kind.describe(),
                task_name: entry.task_name.clone(),
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .entries
            .lock()
            .expect("scheduler lock poisoned")
            .contains_key(name)
    }

    /// Stop every schedule runner.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut entries = self.inner.entries.lock().expect("scheduler lock poisoned");
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
        tracing::info!("Scheduler shut down");
    }
}

async fn fire(client: &TaskClient, schedule_name: &str, template: &Task) {
    let task = template.from_template();
    let task_id = task.id;
    match client.submit(task).await {
        Ok(_) => {
            tracing::debug!(
                schedule = %schedule_name,
                task_id = %task_id,
                task_name = %template.name,
                "Scheduled task submitted"
            );
        }
        Err(e) => {
            tracing::error!(
                schedule = %schedule_name,
                task_name = %template.name,
                error = %e,
                "Failed to submit scheduled task"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cancel::CancellationRegistry;
    use crate::queue::{QueueConfig, TaskQueue};
    use chrono::TimeZone;
    use tasklane_core::models::TaskBuilder;

    fn scheduler() -> (Scheduler, TaskQueue) {
        let queue = TaskQueue::new(QueueConfig::default());
        let client = TaskClient::new(
            queue.clone(),
            Arc::new(MemoryBackend::new()),
            Arc::new(CancellationRegistry::new()),
        );
        (Scheduler::new(client), queue)
    }

    #[test]
    fn test_cron_parse_wildcards() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(schedule.minutes.len(), 60);
        assert_eq!(schedule.hours.len(), 24);
        assert_eq!(schedule.days_of_month.len(), 31);
        assert_eq!(schedule.months.len(), 12);
        assert_eq!(schedule.days_of_week.len(), 7);
    }

    #[test]
    fn test_cron_parse_lists_ranges_steps() {
        let schedule = CronSchedule::parse("0,30 9-17 */10 1,6 1-5").unwrap();
        assert_eq!(schedule.minutes, vec![0, 30]);
        assert_eq!(schedule.hours, (9..=17).collect::<Vec<_>>());
        assert_eq!(schedule.days_of_month, vec![1, 11, 21, 31]);
        assert_eq!(schedule.months, vec![1, 6]);
        assert_eq!(schedule.days_of_week, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cron_parse_rejects_bad_input() {
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("* 24 * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("* * * 13 *").is_err());
        assert!(CronSchedule::parse("* * * * 8").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("x * * * *").is_err());
    }

    #[test]
    fn test_cron_sunday_alias() {
        let schedule = CronSchedule::parse("0 0 * * 7").unwrap();
        assert_eq!(schedule.days_of_week, vec![0]);
    }

    #[test]
    fn test_cron_matches_specific_minute() {
        let schedule = CronSchedule::parse("30 14 * * *").unwrap();
        let hit = Utc.with_ymd_and_hms(2025, 6, 15, 14, 30, 0).unwrap();
        let miss = Utc.with_ymd_and_hms(2025, 6, 15, 14, 31, 0).unwrap();
        assert!(schedule.matches(hit));
        assert!(!schedule.matches(miss));
    }

    #[test]
    fn test_cron_dom_dow_either_when_both_restricted() {
        // Fires on the 15th OR on Mondays.
        let schedule = CronSchedule::parse("0 0 15 * 1").unwrap();
        // 2025-09-15 is a Monday and the 15th.
        let both = Utc.with_ymd_and_hms(2025, 9, 15, 0, 0, 0).unwrap();
        // 2025-09-08 is a Monday but not the 15th.
        let monday = Utc.with_ymd_and_hms(2025, 9, 8, 0, 0, 0).unwrap();
        // 2025-10-15 is a Wednesday.
        let fifteenth = Utc.with_ymd_and_hms(2025, 10, 15, 0, 0, 0).unwrap();
        // 2025-09-09 is a Tuesday, not the 15th.
        let neither = Utc.with_ymd_and_hms(2025, 9, 9, 0, 0, 0).unwrap();

        assert!(schedule.matches(both));
        assert!(schedule.matches(monday));
        assert!(schedule.matches(fifteenth));
        assert!(!schedule.matches(neither));
    }

    #[test]
    fn test_cron_next_after_is_strictly_future() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 14, 30, 45).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 15, 14, 31, 0).unwrap());
        assert!(next > now);
    }

    #[test]
    fn test_cron_next_after_skips_to_matching_day() {
        let schedule = CronSchedule::parse("0 3 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 14, 30, 0).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 16, 3, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_periodic_schedule_fires_repeatedly() {
        let (scheduler, queue) = scheduler();
        let template = TaskBuilder::new("tick").build().unwrap();

        scheduler
            .add_periodic("ticker", template, Duration::from_millis(40))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(queue.queue_size("default") >= 2);

        // Fresh ids per fire.
        let snapshot = queue.pending_snapshot("default");
        let mut ids: Vec<_> = snapshot.iter().map(|t| t.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), snapshot.len());

        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_periodic_rejects_zero_interval() {
        let (scheduler, _queue) = scheduler();
        let template = TaskBuilder::new("tick").build().unwrap();
        assert!(scheduler
            .add_periodic("bad", template, Duration::ZERO)
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_schedule_name_rejected() {
        let (scheduler, _queue) = scheduler();
        scheduler
            .add_periodic(
                "job",
                TaskBuilder::new("tick").build().unwrap(),
                Duration::from_secs(60),
            )
            .unwrap();
        let result = scheduler.add_periodic(
            "job",
            TaskBuilder::new("tock").build().unwrap(),
            Duration::from_secs(60),
        );
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_remove_schedule() {
        let (scheduler, _queue) = scheduler();
        scheduler
            .add_periodic(
                "job",
                TaskBuilder::new("tick").build().unwrap(),
                Duration::from_secs(60),
            )
            .unwrap();

        assert!(scheduler.contains("job"));
        scheduler.remove("job").unwrap();
        assert!(!scheduler.contains("job"));
        assert!(matches!(
            scheduler.remove("job"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_schedules() {
        let (scheduler, _queue) = scheduler();
        scheduler
            .add_periodic(
                "every-minute",
                TaskBuilder::new("tick").build().unwrap(),
                Duration::from_secs(60),
            )
            .unwrap();
        scheduler
            .add_cron(
                "nightly",
                TaskBuilder::new("report").build().unwrap(),
                "0 3 * * *",
            )
            .unwrap();

        let mut names: Vec<_> = scheduler.list().into_iter().map(|s| s.name).collect();
        names.sort();
        assert_eq!(names, vec!["every-minute".to_string(), "nightly".to_string()]);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_cron_rejects_invalid_expression_on_add() {
        let (scheduler, _queue) = scheduler();
        let result = scheduler.add_cron(
            "bad",
            TaskBuilder::new("tick").build().unwrap(),
            "not a cron",
        );
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }
}
