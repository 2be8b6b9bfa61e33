//! Deferred and recurring updates.
//!
//! Pending entries are held ordered by `scheduled_time`; a cooperative tick
//! dequeues the ones whose time has passed. Elapsed time is measured against
//! a monotonic baseline, so entries that land in the future after a
//! wall-clock correction are left alone rather than executed early.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Recurrence specification: `@daily`, `@weekly`, `@monthly`, or
/// `+<duration>` (e.g. `+12h`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence(pub String);

impl Recurrence {
    pub fn parse(spec: &str) -> Option<Self> {
        match spec {
            "@daily" | "@weekly" | "@monthly" => Some(Self(spec.to_string())),
            _ => {
                let trimmed = spec.strip_prefix('+')?;
                humantime::parse_duration(trimmed).ok()?;
                Some(Self(spec.to_string()))
            }
        }
    }

    /// The occurrence after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self.0.as_str() {
            "@daily" => from + chrono::Duration::days(1),
            "@weekly" => from + chrono::Duration::weeks(1),
            "@monthly" => from + chrono::Duration::days(30),
            spec => {
                let duration = spec
                    .strip_prefix('+')
                    .and_then(|inner| humantime::parse_duration(inner).ok())
                    .unwrap_or(Duration::from_secs(86_400));
                from + chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::days(1))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledUpdate {
    pub id: String,
    pub version: String,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub status: ScheduleStatus,
}

impl ScheduledUpdate {
    pub fn new(version: impl Into<String>, scheduled_time: DateTime<Utc>) -> Self {
        let version = version.into();
        Self {
            id: format!("sched-{}-{}", version, scheduled_time.timestamp()),
            version,
            scheduled_time,
            recurrence: None,
            max_retries: 3,
            retry_count: 0,
            status: ScheduleStatus::Pending,
        }
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }
}

/// The pending queue plus a monotonic view of "now".
pub struct UpdateScheduler {
    pending: Mutex<Vec<ScheduledUpdate>>,
    /// Wall-clock and monotonic instants captured together at startup;
    /// "now" is derived as baseline_wall + monotonic elapsed.
    baseline_wall: DateTime<Utc>,
    baseline_instant: Instant,
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateScheduler {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            baseline_wall: Utc::now(),
            baseline_instant: Instant::now(),
        }
    }

    /// Monotonic wall-clock: immune to the system clock stepping backwards.
    pub fn monotonic_now(&self) -> DateTime<Utc> {
        self.baseline_wall
            + chrono::Duration::from_std(self.baseline_instant.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Add an entry. Scheduling the same `(version, scheduled_time)` twice
    /// keeps one pending entry, not two.
    pub fn schedule(&self, entry: ScheduledUpdate) -> bool {
        let mut pending = self.pending.lock();
        let duplicate = pending.iter().any(|existing| {
            existing.version == entry.version
                && existing.scheduled_time == entry.scheduled_time
                && existing.status == ScheduleStatus::Pending
        });
        if duplicate {
            debug!(version = %entry.version, "duplicate schedule ignored");
            return false;
        }
        pending.push(entry);
        pending.sort_by_key(|entry| entry.scheduled_time);
        true
    }

    pub fn cancel(&self, id: &str) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|entry| entry.id != id);
        pending.len() != before
    }

    pub fn pending(&self) -> Vec<ScheduledUpdate> {
        self.pending.lock().clone()
    }

    /// Dequeue every entry whose time has passed, in non-decreasing
    /// `scheduled_time` order. Entries in the future after a clock
    /// correction stay queued.
    pub fn due_entries(&self) -> Vec<ScheduledUpdate> {
        let now = self.monotonic_now();
        let mut pending = self.pending.lock();
        let mut due = Vec::new();
        let mut keep = Vec::new();
        for entry in pending.drain(..) {
            if entry.status == ScheduleStatus::Pending && entry.scheduled_time <= now {
                due.push(entry);
            } else {
                keep.push(entry);
            }
        }
        *pending = keep;
        // The queue was sorted on insert, so this preserves time order.
        due
    }

    /// Report the outcome of a dequeued entry. Successful recurring entries
    /// are re-queued at the next occurrence; failures retry until the cap.
    pub fn report_outcome(&self, mut entry: ScheduledUpdate, success: bool) {
        if success {
            if let Some(recurrence) = entry.recurrence.clone() {
                let next = recurrence.next_after(self.monotonic_now());
                let mut requeued = ScheduledUpdate::new(entry.version.clone(), next)
                    .with_recurrence(recurrence);
                requeued.max_retries = entry.max_retries;
                info!(version = %requeued.version, at = %next, "recurring update re-queued");
                self.schedule(requeued);
            }
            return;
        }

        entry.retry_count += 1;
        if entry.retry_count > entry.max_retries {
            warn!(version = %entry.version, "scheduled update exhausted retries");
            entry.status = ScheduleStatus::Failed;
            self.pending.lock().push(entry);
        } else {
            // Retry shortly, preserving the retry count.
            entry.scheduled_time = self.monotonic_now() + chrono::Duration::minutes(5);
            entry.status = ScheduleStatus::Pending;
            let mut pending = self.pending.lock();
            pending.push(entry);
            pending.sort_by_key(|entry| entry.scheduled_time);
        }
    }

    /// Cooperative timer loop. `execute` runs each due entry and reports
    /// success; the loop exits on cancellation.
    pub async fn run_loop<F, Fut>(
        &self,
        tick_interval: Duration,
        cancel: CancellationToken,
        mut execute: F,
    ) where
        F: FnMut(ScheduledUpdate) -> Fut,
        Fut: std::future::Future<Output = (ScheduledUpdate, bool)>,
    {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("scheduler loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    for entry in self.due_entries() {
                        let (entry, success) = execute(entry).await;
                        self.report_outcome(entry, success);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn past(seconds: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(seconds)
    }

    fn future(seconds: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(seconds)
    }

    #[test]
    fn duplicate_schedule_yields_one_entry() {
        let scheduler = UpdateScheduler::new();
        let when = future(60);
        assert!(scheduler.schedule(ScheduledUpdate::new("1.1.0", when)));
        assert!(!scheduler.schedule(ScheduledUpdate::new("1.1.0", when)));
        assert_eq!(scheduler.pending().len(), 1);
    }

    #[test]
    fn due_entries_come_out_in_time_order() {
        let scheduler = UpdateScheduler::new();
        scheduler.schedule(ScheduledUpdate::new("1.3.0", past(10)));
        scheduler.schedule(ScheduledUpdate::new("1.1.0", past(300)));
        scheduler.schedule(ScheduledUpdate::new("1.2.0", past(60)));
        scheduler.schedule(ScheduledUpdate::new("2.0.0", future(600)));

        let due = scheduler.due_entries();
        let versions: Vec<&str> = due.iter().map(|entry| entry.version.as_str()).collect();
        assert_eq!(versions, vec!["1.1.0", "1.2.0", "1.3.0"]);
        // The future entry stays queued.
        assert_eq!(scheduler.pending().len(), 1);
    }

    #[test]
    fn future_entries_are_not_due() {
        let scheduler = UpdateScheduler::new();
        scheduler.schedule(ScheduledUpdate::new("9.9.9", future(3600)));
        assert!(scheduler.due_entries().is_empty());
    }

    #[test]
    fn failed_entry_retries_then_fails_terminally() {
        let scheduler = UpdateScheduler::new();
        let mut entry = ScheduledUpdate::new("1.1.0", past(10));
        entry.max_retries = 1;

        scheduler.report_outcome(entry, false);
        let pending = scheduler.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].status, ScheduleStatus::Pending);

        let entry = pending.into_iter().next().unwrap();
        scheduler.cancel(&entry.id);
        scheduler.report_outcome(entry, false);
        let pending = scheduler.pending();
        assert_eq!(pending[0].status, ScheduleStatus::Failed);
        assert_eq!(pending[0].retry_count, 2);
    }

    #[test]
    fn successful_recurring_entry_requeues_next_occurrence() {
        let scheduler = UpdateScheduler::new();
        let entry = ScheduledUpdate::new("1.1.0", past(10))
            .with_recurrence(Recurrence::parse("@daily").unwrap());

        scheduler.report_outcome(entry, true);
        let pending = scheduler.pending();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].scheduled_time > Utc::now() + chrono::Duration::hours(23));
        assert_eq!(pending[0].retry_count, 0);
    }

    #[test]
    fn successful_one_shot_entry_is_gone() {
        let scheduler = UpdateScheduler::new();
        let entry = ScheduledUpdate::new("1.1.0", past(10));
        scheduler.report_outcome(entry, true);
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn recurrence_specs_parse() {
        assert!(Recurrence::parse("@daily").is_some());
        assert!(Recurrence::parse("@weekly").is_some());
        assert!(Recurrence::parse("@monthly").is_some());
        assert!(Recurrence::parse("+12h").is_some());
        assert!(Recurrence::parse("+90m").is_some());
        assert!(Recurrence::parse("yearly").is_none());
        assert!(Recurrence::parse("+banana").is_none());
    }

    #[test]
    fn plus_duration_recurrence_advances_by_that_much() {
        let recurrence = Recurrence::parse("+2h").unwrap();
        let from = Utc::now();
        let next = recurrence.next_after(from);
        assert_eq!(next - from, chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn run_loop_executes_due_entries_and_stops_on_cancel() {
        let scheduler = UpdateScheduler::new();
        scheduler.schedule(ScheduledUpdate::new("1.1.0", past(10)));

        let cancel = CancellationToken::new();
        let executed = std::sync::Arc::new(Mutex::new(Vec::new()));

        let loop_cancel = cancel.clone();
        let loop_executed = executed.clone();
        let loop_fut = scheduler.run_loop(Duration::from_millis(10), loop_cancel, {
            let executed = loop_executed;
            move |entry: ScheduledUpdate| {
                let executed = executed.clone();
                async move {
                    executed.lock().push(entry.version.clone());
                    (entry, true)
                }
            }
        });

        tokio::select! {
            _ = loop_fut => {}
            _ = async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
                tokio::time::sleep(Duration::from_millis(50)).await;
            } => {}
        }

        assert_eq!(executed.lock().as_slice(), ["1.1.0".to_string()]);
    }
}
