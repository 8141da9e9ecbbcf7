//! Shared job vocabulary: types, priorities, statuses, options and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for any computed retry delay (24 hours)
pub const MAX_BACKOFF_MS: u64 = 86_400_000;

/// Closed set of work categories. Each one owns a queue and a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    ContentProcessing,
    Email,
    Notification,
    Report,
    Cleanup,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::ContentProcessing,
        JobType::Email,
        JobType::Notification,
        JobType::Report,
        JobType::Cleanup,
    ];

    /// Stable queue name used by the backend
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::ContentProcessing => "content-processing",
            Self::Email => "email",
            Self::Notification => "notification",
            Self::Report => "report",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_name())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.queue_name() == s)
            .ok_or_else(|| format!("unknown job type '{}'", s))
    }
}

/// Dispatch hint. Higher priorities are handed out first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Numeric rank, 0 for `Low` up to 3 for `Critical`
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Removed,
}

impl JobStatus {
    /// Completed or failed; the record only changes again by operator action
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay strategy between failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64 },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts already failed.
    ///
    /// Exponential backoff doubles per failure: `base`, `2 * base`, `4 * base`...
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let ms = match *self {
            Self::Fixed { delay_ms } => delay_ms,
            Self::Exponential { base_ms } => {
                let exp = failed_attempts.saturating_sub(1);
                base_ms.saturating_mul(2u64.saturating_pow(exp))
            }
        };
        Duration::from_millis(ms.min(MAX_BACKOFF_MS))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential { base_ms: 1000 }
    }
}

/// Fully resolved execution settings stored on every record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub priority: JobPriority,
    /// Maximum number of attempts, always at least 1
    pub attempts: u32,
    pub backoff: Backoff,
    pub timeout_ms: Option<u64>,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl JobSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            attempts: 3,
            backoff: Backoff::default(),
            timeout_ms: None,
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

/// Per-submission options. Unset fields fall back to queue defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub priority: Option<JobPriority>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub timeout: Option<Duration>,
    /// Explicit id; submitting the same id twice returns the existing job
    pub job_id: Option<String>,
    pub delay: Option<Duration>,
    pub remove_on_complete: Option<bool>,
    pub remove_on_fail: Option<bool>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn attempts(mut self, n: u32) -> Self {
        self.attempts = Some(n);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }

    /// Fill unset fields from `defaults`
    pub fn merge_over(&self, defaults: &JobSettings) -> JobSettings {
        JobSettings {
            priority: self.priority.unwrap_or(defaults.priority),
            attempts: self.attempts.unwrap_or(defaults.attempts).max(1),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            timeout_ms: self
                .timeout
                .map(|t| t.as_millis() as u64)
                .or(defaults.timeout_ms),
            remove_on_complete: self
                .remove_on_complete
                .unwrap_or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.unwrap_or(defaults.remove_on_fail),
        }
    }
}

/// A job as stored by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub settings: JobSettings,
    pub status: JobStatus,
    /// 0-100, last value reported by the processor holding the job
    pub progress: u8,
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Recurring registration this occurrence was spawned from
    pub repeat_key: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dispatched
    pub run_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    /// Issued when the job is fetched. Only the holder may settle it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
}

/// What happened to a record after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { run_at: DateTime<Utc> },
    Exhausted,
}

impl JobRecord {
    /// New record, `delayed` if `run_at` lies in the future
    pub fn new(
        id: String,
        job_type: JobType,
        payload: serde_json::Value,
        settings: JobSettings,
        now: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Self {
        let status = if run_at > now {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        Self {
            id,
            job_type,
            payload,
            settings,
            status,
            progress: 0,
            attempts_made: 0,
            failed_reason: None,
            result: None,
            repeat_key: None,
            created_at: now,
            run_at,
            processed_on: None,
            finished_on: None,
            lock_token: None,
        }
    }

    pub fn queue_name(&self) -> &'static str {
        self.job_type.queue_name()
    }

    pub fn attempts_left(&self) -> u32 {
        self.settings.attempts.saturating_sub(self.attempts_made)
    }

    /// Take the job for processing under `token`
    pub(crate) fn activate(&mut self, now: DateTime<Utc>, token: String) {
        self.status = JobStatus::Active;
        self.processed_on = Some(now);
        self.lock_token = Some(token);
    }

    /// Whether `token` is the lock handed out by the last fetch
    pub fn is_held_by(&self, token: &str) -> bool {
        self.status == JobStatus::Active && self.lock_token.as_deref() == Some(token)
    }

    /// Record a successful attempt
    pub(crate) fn settle_success(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) {
        self.attempts_made = (self.attempts_made + 1).min(self.settings.attempts);
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = result;
        self.failed_reason = None;
        self.finished_on = Some(now);
        self.lock_token = None;
    }

    /// Record a failed attempt and decide between backoff retry and permanent failure
    pub(crate) fn settle_failure(
        &mut self,
        reason: impl Into<String>,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.attempts_made = (self.attempts_made + 1).min(self.settings.attempts);
        self.failed_reason = Some(reason.into());
        self.lock_token = None;

        if retryable && self.attempts_made < self.settings.attempts {
            let delay = self.settings.backoff.delay_for(self.attempts_made);
            let run_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            self.status = JobStatus::Delayed;
            self.run_at = run_at;
            FailureOutcome::Retry { run_at }
        } else {
            self.status = JobStatus::Failed;
            self.finished_on = Some(now);
            FailureOutcome::Exhausted
        }
    }

    /// The lock expired without the job finishing. A stall consumes one
    /// attempt; returns `true` if the job goes back to `waiting`.
    pub(crate) fn settle_stall(&mut self, reason: &str, now: DateTime<Utc>) -> bool {
        self.lock_token = None;
        self.attempts_made = (self.attempts_made + 1).min(self.settings.attempts);
        if self.attempts_made < self.settings.attempts {
            self.status = JobStatus::Waiting;
            self.run_at = now;
            true
        } else {
            self.status = JobStatus::Failed;
            self.failed_reason = Some(reason.to_string());
            self.finished_on = Some(now);
            false
        }
    }

    /// Operator retry: back to `waiting` with a fresh attempt budget
    pub(crate) fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Waiting;
        self.run_at = now;
        self.progress = 0;
        self.attempts_made = 0;
        self.failed_reason = None;
        self.result = None;
        self.processed_on = None;
        self.finished_on = None;
        self.lock_token = None;
    }
}

/// Lifecycle notifications published by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Waiting {
        job_type: JobType,
        job_id: String,
    },
    Delayed {
        job_type: JobType,
        job_id: String,
        run_at: DateTime<Utc>,
    },
    Active {
        job_type: JobType,
        job_id: String,
        attempt: u32,
    },
    Progress {
        job_type: JobType,
        job_id: String,
        progress: u8,
    },
    Completed {
        job_type: JobType,
        job_id: String,
        result: Option<serde_json::Value>,
    },
    Failed {
        job_type: JobType,
        job_id: String,
        reason: String,
        will_retry: bool,
    },
    Stalled {
        job_type: JobType,
        job_id: String,
    },
    Removed {
        job_type: JobType,
        job_id: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Waiting { job_id, .. }
            | Self::Delayed { job_id, .. }
            | Self::Active { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stalled { job_id, .. }
            | Self::Removed { job_id, .. } => job_id,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Self::Waiting { job_type, .. }
            | Self::Delayed { job_type, .. }
            | Self::Active { job_type, .. }
            | Self::Progress { job_type, .. }
            | Self::Completed { job_type, .. }
            | Self::Failed { job_type, .. }
            | Self::Stalled { job_type, .. }
            | Self::Removed { job_type, .. } => *job_type,
        }
    }

    /// No further events follow for this job unless it is retried or
    /// resubmitted
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { will_retry: false, .. } | Self::Removed { .. }
        )
    }

    /// Event name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting { .. } => "waiting",
            Self::Delayed { .. } => "delayed",
            Self::Active { .. } => "active",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stalled { .. } => "stalled",
            Self::Removed { .. } => "removed",
        }
    }
}

/// Query for `search_jobs` / `list`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
    /// Empty means any status
    pub statuses: Vec<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.job_type.map_or(true, |t| t == record.job_type)
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
    }
}

/// Live counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: bool,
}

impl QueueCounts {
    fn accumulate(&mut self, other: &QueueCounts) {
        self.waiting += other.waiting;
        self.active += other.active;
        self.delayed += other.delayed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.paused |= other.paused;
    }
}

/// Counts per queue plus system-wide totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queues: std::collections::BTreeMap<JobType, QueueCounts>,
    pub totals: QueueCounts,
    /// Jobs this process saw complete since startup
    pub processed: u64,
    /// Jobs this process saw fail since startup (including retried attempts)
    pub failed: u64,
}

impl QueueMetrics {
    pub fn insert(&mut self, job_type: JobType, counts: QueueCounts) {
        self.totals.accumulate(&counts);
        self.queues.insert(job_type, counts);
    }
}

/// A recurring job registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub key: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// 5-field cron expression
    pub cron: String,
    pub settings: JobSettings,
    pub next_run: DateTime<Utc>,
}

impl RepeatSpec {
    /// Deterministic id for the occurrence due at `at`
    pub fn occurrence_id(&self, at: DateTime<Utc>) -> String {
        format!("repeat:{}:{}", self.key, at.timestamp_millis())
    }

    /// Materialize the occurrence due at `at` as a waiting record
    pub fn occurrence(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> JobRecord {
        let mut record = JobRecord::new(
            self.occurrence_id(at),
            self.job_type,
            self.payload.clone(),
            self.settings.clone(),
            now,
            now,
        );
        record.repeat_key = Some(self.key.clone());
        record
    }
}
