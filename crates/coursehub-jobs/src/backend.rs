use crate::error::Result;
use crate::job::{JobEvent, JobFilter, JobRecord, JobStatus, JobType, QueueCounts, RepeatSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Capacity of the lifecycle event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Durable queue storage shared by coordinators and workers.
///
/// Queues are partitioned by [`JobType`]. Implementations provide atomic
/// dequeue-with-lock, delayed dispatch, a repeating schedule primitive and
/// at-least-once delivery; everything above this trait relies on those
/// guarantees instead of in-process locking.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Current time as the backend sees it
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Check that the backend is reachable
    async fn ping(&self) -> Result<()>;

    /// Store a new job. If a job with the same id exists it is returned
    /// unchanged and nothing is added.
    async fn add(&self, record: JobRecord) -> Result<JobRecord>;

    async fn get(&self, job_type: JobType, id: &str) -> Result<Option<JobRecord>>;

    /// Jobs in one queue matching `filter`, newest first
    async fn list(&self, job_type: JobType, filter: &JobFilter) -> Result<Vec<JobRecord>>;

    /// Delete a job whatever its state. Fails with `JobNotFound` if absent.
    async fn remove(&self, job_type: JobType, id: &str) -> Result<()>;

    /// Put a job back to `waiting` with a fresh attempt budget.
    /// Fails with `JobNotFound` if absent and `InvalidState` if active.
    async fn retry(&self, job_type: JobType, id: &str) -> Result<()>;

    async fn pause(&self, job_type: JobType) -> Result<()>;

    async fn resume(&self, job_type: JobType) -> Result<()>;

    async fn is_paused(&self, job_type: JobType) -> Result<bool>;

    /// Delete `completed` or `failed` jobs finished more than `older_than` ago.
    /// Any other status is never touched. Returns the removed ids.
    async fn clean(
        &self,
        job_type: JobType,
        status: JobStatus,
        older_than: Duration,
    ) -> Result<Vec<String>>;

    async fn counts(&self, job_type: JobType) -> Result<QueueCounts>;

    /// Atomically take the next runnable job and lock it for `lock_ttl`.
    ///
    /// The returned record carries a fresh `lock_token`; every call that
    /// touches the job while it is active must present it. Due delayed
    /// jobs and due recurring occurrences are promoted first. Returns
    /// `None` when the queue is paused or nothing is runnable.
    async fn fetch_next(&self, job_type: JobType, lock_ttl: Duration)
        -> Result<Option<JobRecord>>;

    /// Renew the lock on an active job. `false` means the lock was lost,
    /// either expired and reclaimed or now held under another token.
    async fn extend_lock(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        lock_ttl: Duration,
    ) -> Result<bool>;

    /// Fails with `LockMismatch` unless `token` holds the job
    async fn update_progress(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        progress: u8,
    ) -> Result<()>;

    /// Finish an active job successfully. Honors `remove_on_complete`.
    ///
    /// Check and settle happen atomically: a holder whose lock was
    /// reclaimed gets `LockMismatch` (or `InvalidState` if the job is no
    /// longer active) and the record is left untouched.
    async fn complete(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        result: Option<serde_json::Value>,
    ) -> Result<JobRecord>;

    /// Record a failed attempt. Retries with backoff while attempts remain
    /// and `retryable` is set, otherwise fails permanently (honoring
    /// `remove_on_fail`). Same lock rules as [`JobBackend::complete`].
    async fn fail(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<JobRecord>;

    /// Reclaim active jobs whose lock expired. Returns the reclaimed ids.
    async fn recover_stalled(&self, job_type: JobType) -> Result<Vec<String>>;

    /// Register a recurring job. `false` if the key was already registered.
    async fn add_repeatable(&self, spec: RepeatSpec) -> Result<bool>;

    async fn list_repeatables(&self, job_type: JobType) -> Result<Vec<RepeatSpec>>;

    /// `false` if no registration had that key
    async fn remove_repeatable(&self, job_type: JobType, key: &str) -> Result<bool>;

    /// Stream of lifecycle events for every queue
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;

    /// Release connections. The backend is unusable afterwards.
    async fn close(&self) -> Result<()>;
}

/// Token identifying one fetch of a job
pub(crate) fn new_lock_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Reason recorded when a stalled job runs out of attempts
pub const STALLED_REASON: &str = "job stalled more than allowable limit";
