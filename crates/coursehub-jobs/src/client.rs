use crate::coordinator::JobCoordinator;
use crate::error::{JobError, Result};
use crate::job::{JobEvent, JobFilter, JobOptions, JobPriority, JobRecord, JobStatus, JobType};
use crate::processor::Job;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const DEFAULT_ATTEMPTS: u32 = 3;

/// What to run and how, for [`JobClient::submit`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOptions {
    pub data: serde_json::Value,
    /// Defaults to `Normal`
    pub priority: Option<JobPriority>,
    /// Defaults to 3
    pub attempts: Option<u32>,
    pub delay: Option<Duration>,
    pub timeout: Option<Duration>,
    pub job_id: Option<String>,
    pub remove_on_complete: Option<bool>,
}

impl SubmitOptions {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
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

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    fn into_parts(self) -> (serde_json::Value, JobOptions) {
        let options = JobOptions {
            priority: Some(self.priority.unwrap_or_default()),
            attempts: Some(self.attempts.unwrap_or(DEFAULT_ATTEMPTS)),
            timeout: self.timeout,
            job_id: self.job_id,
            delay: self.delay,
            remove_on_complete: self.remove_on_complete,
            ..JobOptions::default()
        };
        (self.data, options)
    }
}

/// Caller-facing snapshot of a job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub state: JobStatus,
    pub progress: u8,
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(record: &JobRecord) -> Self {
        Self {
            state: record.status,
            progress: record.progress,
            attempts_made: record.attempts_made,
            failed_reason: record.failed_reason.clone(),
            processed_on: record.processed_on,
            finished_on: record.finished_on,
        }
    }
}

/// Handle for one registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn Fn(&JobEvent) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: AtomicU64,
    by_job: Mutex<HashMap<String, Vec<(SubscriptionId, Listener)>>>,
}

impl Observers {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriptionId, Listener)>>> {
        self.by_job.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Listeners run under the registry lock, so an `unsubscribe` that
    /// returns has also waited out any delivery in progress. A job's
    /// listeners are dropped after its terminal event.
    fn notify(&self, event: &JobEvent) {
        let mut by_job = self.lock();
        if let Some(listeners) = by_job.get(event.job_id()) {
            for (_, listener) in listeners {
                listener(event);
            }
            if event.is_terminal() {
                by_job.remove(event.job_id());
            }
        }
    }
}

/// Typed convenience layer over [`JobCoordinator`].
///
/// Jobs are addressed by id alone; the client finds the queue they live in.
/// Must be created inside a Tokio runtime.
pub struct JobClient {
    coordinator: Arc<JobCoordinator>,
    observers: Arc<Observers>,
    dispatcher: JoinHandle<()>,
}

impl JobClient {
    pub fn new(coordinator: Arc<JobCoordinator>) -> Self {
        let observers = Arc::new(Observers::default());
        let dispatcher = tokio::spawn(deliver(coordinator.subscribe(), observers.clone()));
        Self {
            coordinator,
            observers,
            dispatcher,
        }
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator> {
        &self.coordinator
    }

    /// Submit a job; returns its id
    pub async fn submit(&self, job_type: JobType, options: SubmitOptions) -> Result<String> {
        let (data, options) = options.into_parts();
        let record = self.coordinator.create_job(job_type, data, options).await?;
        Ok(record.id)
    }

    /// Submit a typed job with default options
    pub async fn submit_job<J: Job>(&self, data: &J::Data) -> Result<String> {
        let data = serde_json::to_value(data)?;
        self.submit(J::TYPE, SubmitOptions::new(data)).await
    }

    /// Submit jobs one by one. Not atomic: each entry reports its own
    /// outcome and earlier successes stand when a later one fails.
    pub async fn submit_batch(&self, jobs: Vec<(JobType, SubmitOptions)>) -> Vec<Result<String>> {
        let total = jobs.len();
        let mut results = Vec::with_capacity(total);
        for (job_type, options) in jobs {
            results.push(self.submit(job_type, options).await);
        }

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(total, failed, "Job batch partially submitted");
        } else {
            tracing::debug!(total, "Job batch submitted");
        }
        results
    }

    async fn record(&self, id: &str) -> Result<JobRecord> {
        self.coordinator
            .find_job(id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))
    }

    pub async fn get_status(&self, id: &str) -> Result<JobStatusView> {
        Ok(JobStatusView::from(&self.record(id).await?))
    }

    /// The processor's return value, once the job completed
    pub async fn get_result(&self, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.record(id).await?.result)
    }

    pub async fn get_progress(&self, id: &str) -> Result<u8> {
        Ok(self.record(id).await?.progress)
    }

    /// Remove the job. A processor already running it is not stopped.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let record = self.record(id).await?;
        self.coordinator.remove_job(record.job_type, id).await
    }

    pub async fn retry(&self, id: &str) -> Result<()> {
        let record = self.record(id).await?;
        self.coordinator.retry_job(record.job_type, id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.coordinator.search_jobs(filter).await
    }

    /// Remove completed and failed jobs that finished more than `older_than` ago
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize> {
        self.coordinator.cleanup_older_than(older_than).await
    }

    /// Call `listener` for every lifecycle event of `job_id`.
    ///
    /// Listeners run on the client's delivery task. They must not call
    /// back into `subscribe`/`unsubscribe`. They are dropped once the job
    /// completes, fails for good or is removed.
    pub fn subscribe<F>(&self, job_id: impl Into<String>, listener: F) -> SubscriptionId
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.observers.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .entry(job_id.into())
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    /// Drop every listener for `job_id`; returns how many were removed.
    /// None of them is invoked after this returns.
    pub fn unsubscribe(&self, job_id: &str) -> usize {
        self.observers
            .lock()
            .remove(job_id)
            .map_or(0, |listeners| listeners.len())
    }

    /// Drop a single listener
    pub fn remove_listener(&self, subscription: SubscriptionId) -> bool {
        let mut by_job = self.observers.lock();
        let mut removed = false;
        by_job.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != subscription);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }
}

impl fmt::Debug for JobClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let watched = self.observers.lock().len();
        f.debug_struct("JobClient")
            .field("watched_jobs", &watched)
            .finish()
    }
}

impl Drop for JobClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn deliver(mut rx: broadcast::Receiver<JobEvent>, observers: Arc<Observers>) {
    loop {
        match rx.recv().await {
            Ok(event) => observers.notify(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Job client fell behind, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::backend::JobBackend;
    use crate::coordinator::CoordinatorConfig;
    use serde::Deserialize;
    use serde_json::json;

    async fn client(queues: Vec<JobType>) -> (JobClient, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let coordinator = Arc::new(JobCoordinator::new(Arc::new(backend.clone())));
        coordinator
            .initialize(CoordinatorConfig {
                queues,
                ..CoordinatorConfig::default()
            })
            .await
            .unwrap();
        (JobClient::new(coordinator), backend)
    }

    #[tokio::test]
    async fn submit_fills_in_defaults() {
        let (c, backend) = client(JobType::ALL.to_vec()).await;
        let id = c
            .submit(JobType::Email, SubmitOptions::new(json!({ "to": "a@b.c" })))
            .await
            .unwrap();

        let record = backend.get(JobType::Email, &id).await.unwrap().unwrap();
        assert_eq!(record.settings.priority, JobPriority::Normal);
        assert_eq!(record.settings.attempts, 3);

        let id = c
            .submit(
                JobType::Email,
                SubmitOptions::new(json!({}))
                    .priority(JobPriority::High)
                    .attempts(7),
            )
            .await
            .unwrap();
        let record = backend.get(JobType::Email, &id).await.unwrap().unwrap();
        assert_eq!(record.settings.priority, JobPriority::High);
        assert_eq!(record.settings.attempts, 7);
    }

    #[tokio::test]
    async fn typed_submit_serializes_payload() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Digest {
            user_id: u64,
        }

        struct DigestJob;

        #[async_trait::async_trait]
        impl Job for DigestJob {
            const TYPE: JobType = JobType::Notification;
            type Data = Digest;

            async fn execute(
                &self,
                _ctx: crate::processor::JobContext,
                _data: Digest,
            ) -> Result<serde_json::Value> {
                Ok(serde_json::Value::Null)
            }
        }

        let (c, backend) = client(JobType::ALL.to_vec()).await;
        let id = c.submit_job::<DigestJob>(&Digest { user_id: 9 }).await.unwrap();
        let record = backend.get(JobType::Notification, &id).await.unwrap().unwrap();
        assert_eq!(record.payload, json!({ "user_id": 9 }));
    }

    #[tokio::test]
    async fn batch_reports_each_outcome() {
        let (c, _) = client(vec![JobType::Email, JobType::Report]).await;
        let results = c
            .submit_batch(vec![
                (JobType::Email, SubmitOptions::new(json!(1))),
                (JobType::Cleanup, SubmitOptions::new(json!(2))),
                (JobType::Report, SubmitOptions::new(json!(3))),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(JobError::QueueNotFound(JobType::Cleanup))));
        let report_id = results[2].as_ref().unwrap();
        assert_eq!(c.get_status(report_id).await.unwrap().state, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn status_view_tracks_the_record() {
        let (c, backend) = client(JobType::ALL.to_vec()).await;
        let id = c
            .submit(
                JobType::Report,
                SubmitOptions::new(json!({})).remove_on_complete(false),
            )
            .await
            .unwrap();

        let job = backend
            .fetch_next(JobType::Report, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let token = job.lock_token.as_deref().unwrap();
        backend.update_progress(JobType::Report, &id, token, 40).await.unwrap();
        assert_eq!(c.get_progress(&id).await.unwrap(), 40);
        assert_eq!(c.get_status(&id).await.unwrap().state, JobStatus::Active);

        backend
            .complete(JobType::Report, &id, token, Some(json!({ "rows": 12 })))
            .await
            .unwrap();
        let view = c.get_status(&id).await.unwrap();
        assert_eq!(view.state, JobStatus::Completed);
        assert_eq!(view.progress, 100);
        assert_eq!(view.attempts_made, 1);
        assert!(view.finished_on.is_some());
        assert_eq!(c.get_result(&id).await.unwrap(), Some(json!({ "rows": 12 })));
    }

    #[tokio::test]
    async fn cancel_and_retry_by_id() {
        let (c, backend) = client(JobType::ALL.to_vec()).await;
        let id = c
            .submit(JobType::Cleanup, SubmitOptions::new(json!({})).attempts(1))
            .await
            .unwrap();
        let job = backend
            .fetch_next(JobType::Cleanup, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let token = job.lock_token.as_deref().unwrap();
        backend
            .fail(JobType::Cleanup, &id, token, "disk full", true)
            .await
            .unwrap();
        assert_eq!(c.get_status(&id).await.unwrap().state, JobStatus::Failed);

        c.retry(&id).await.unwrap();
        let view = c.get_status(&id).await.unwrap();
        assert_eq!(view.state, JobStatus::Waiting);
        assert_eq!(view.attempts_made, 0);

        c.cancel(&id).await.unwrap();
        assert!(matches!(c.get_status(&id).await, Err(JobError::JobNotFound(_))));
        assert!(matches!(c.cancel(&id).await, Err(JobError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn listeners_stop_after_unsubscribe() {
        let (c, backend) = client(JobType::ALL.to_vec()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = seen.clone();
        c.subscribe("weekly-digest", move |event| {
            sink.lock().unwrap().push(event.name());
            let _ = tx.send(());
        });

        let id = c
            .submit(
                JobType::Email,
                SubmitOptions::new(json!({}))
                    .job_id("weekly-digest")
                    .delay(Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        rx.recv().await.unwrap();
        c.retry(&id).await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["delayed", "waiting"]);

        assert_eq!(c.unsubscribe(&id), 1);
        assert_eq!(c.unsubscribe(&id), 0);
        backend.remove(JobType::Email, &id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["delayed", "waiting"]);
    }

    #[tokio::test]
    async fn listeners_are_dropped_after_the_final_event() {
        let (c, backend) = client(JobType::ALL.to_vec()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for id in ["retried", "finished"] {
            let tx = tx.clone();
            c.subscribe(id, move |event| {
                let _ = tx.send((event.job_id().to_string(), event.name()));
            });
            c.submit(
                JobType::Email,
                SubmitOptions::new(json!({})).job_id(id).attempts(2),
            )
            .await
            .unwrap();
        }

        let lock = Duration::from_secs(30);
        let first = backend.fetch_next(JobType::Email, lock).await.unwrap().unwrap();
        let second = backend.fetch_next(JobType::Email, lock).await.unwrap().unwrap();
        assert_eq!(first.id, "retried");
        backend
            .fail(JobType::Email, "retried", first.lock_token.as_deref().unwrap(), "flaky", true)
            .await
            .unwrap();
        backend
            .complete(JobType::Email, "finished", second.lock_token.as_deref().unwrap(), None)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 6 {
            seen.push(rx.recv().await.unwrap());
        }
        assert!(seen.contains(&("retried".to_string(), "failed")));
        assert_eq!(seen.last(), Some(&("finished".to_string(), "completed")));

        // a retry keeps the job's listeners, completion drops them
        assert_eq!(c.unsubscribe("finished"), 0);
        assert_eq!(c.unsubscribe("retried"), 1);
    }

    #[tokio::test]
    async fn remove_listener_drops_only_that_listener() {
        let (c, _) = client(JobType::ALL.to_vec()).await;
        let a = c.subscribe("job-1", |_| {});
        let _b = c.subscribe("job-1", |_| {});
        assert!(c.remove_listener(a));
        assert!(!c.remove_listener(a));
        assert_eq!(c.unsubscribe("job-1"), 1);
    }
}
