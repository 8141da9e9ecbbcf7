use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use coursehub_jobs::{
    Clock, CoordinatorConfig, InMemoryBackend, JobBackend, JobCoordinator, JobEvent, JobFilter,
    JobOptions, JobRecord, JobStatus, JobType, ManualClock, QueueCounts, QueueManager,
    QueueManagerConfig, RepeatSpec, Result,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// In-memory backend that counts recurring registrations and records
/// pause/close calls in order
#[derive(Debug, Clone)]
struct CountingBackend {
    inner: InMemoryBackend,
    repeat_calls: Arc<AtomicUsize>,
    lifecycle: Arc<Mutex<Vec<String>>>,
}

impl CountingBackend {
    fn new(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            repeat_calls: Arc::new(AtomicUsize::new(0)),
            lifecycle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn repeat_calls(&self) -> usize {
        self.repeat_calls.load(Ordering::SeqCst)
    }

    fn lifecycle(&self) -> Vec<String> {
        self.lifecycle.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobBackend for CountingBackend {
    fn now(&self) -> chrono::DateTime<Utc> {
        self.inner.now()
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn add(&self, record: JobRecord) -> Result<JobRecord> {
        self.inner.add(record).await
    }

    async fn get(&self, job_type: JobType, id: &str) -> Result<Option<JobRecord>> {
        self.inner.get(job_type, id).await
    }

    async fn list(&self, job_type: JobType, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.inner.list(job_type, filter).await
    }

    async fn remove(&self, job_type: JobType, id: &str) -> Result<()> {
        self.inner.remove(job_type, id).await
    }

    async fn retry(&self, job_type: JobType, id: &str) -> Result<()> {
        self.inner.retry(job_type, id).await
    }

    async fn pause(&self, job_type: JobType) -> Result<()> {
        self.lifecycle.lock().unwrap().push(format!("pause:{}", job_type));
        self.inner.pause(job_type).await
    }

    async fn resume(&self, job_type: JobType) -> Result<()> {
        self.inner.resume(job_type).await
    }

    async fn is_paused(&self, job_type: JobType) -> Result<bool> {
        self.inner.is_paused(job_type).await
    }

    async fn clean(
        &self,
        job_type: JobType,
        status: JobStatus,
        older_than: Duration,
    ) -> Result<Vec<String>> {
        self.inner.clean(job_type, status, older_than).await
    }

    async fn counts(&self, job_type: JobType) -> Result<QueueCounts> {
        self.inner.counts(job_type).await
    }

    async fn fetch_next(
        &self,
        job_type: JobType,
        lock_ttl: Duration,
    ) -> Result<Option<JobRecord>> {
        self.inner.fetch_next(job_type, lock_ttl).await
    }

    async fn extend_lock(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        lock_ttl: Duration,
    ) -> Result<bool> {
        self.inner.extend_lock(job_type, id, token, lock_ttl).await
    }

    async fn update_progress(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        progress: u8,
    ) -> Result<()> {
        self.inner.update_progress(job_type, id, token, progress).await
    }

    async fn complete(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        result: Option<serde_json::Value>,
    ) -> Result<JobRecord> {
        self.inner.complete(job_type, id, token, result).await
    }

    async fn fail(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<JobRecord> {
        self.inner.fail(job_type, id, token, reason, retryable).await
    }

    async fn recover_stalled(&self, job_type: JobType) -> Result<Vec<String>> {
        self.inner.recover_stalled(job_type).await
    }

    async fn add_repeatable(&self, spec: RepeatSpec) -> Result<bool> {
        self.repeat_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.add_repeatable(spec).await
    }

    async fn list_repeatables(&self, job_type: JobType) -> Result<Vec<RepeatSpec>> {
        self.inner.list_repeatables(job_type).await
    }

    async fn remove_repeatable(&self, job_type: JobType, key: &str) -> Result<bool> {
        self.inner.remove_repeatable(job_type, key).await
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.lifecycle.lock().unwrap().push("close".to_string());
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_recurring_job_registered_once() {
    let backend = CountingBackend::new(InMemoryBackend::new());
    let coordinator = JobCoordinator::new(Arc::new(backend.clone()));
    coordinator
        .initialize(CoordinatorConfig::default())
        .await
        .unwrap();

    for _ in 0..3 {
        coordinator
            .create_recurring_job(
                JobType::Cleanup,
                serde_json::json!({ "target": "expired-sessions" }),
                "0 0 * * *",
                JobOptions::new(),
            )
            .await
            .unwrap();
    }

    assert_eq!(backend.repeat_calls(), 1);
    let registered = backend.list_repeatables(JobType::Cleanup).await.unwrap();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].cron, "0 0 * * *");
}

#[tokio::test]
async fn test_recurring_job_survives_coordinator_restart() {
    let memory = InMemoryBackend::new();
    let first = JobCoordinator::new(Arc::new(memory.clone()));
    first.initialize(CoordinatorConfig::default()).await.unwrap();
    let spec = first
        .create_recurring_job(
            JobType::Report,
            serde_json::json!({}),
            "30 6 * * 1",
            JobOptions::new(),
        )
        .await
        .unwrap();

    // a second process on the same backend registers the same schedule
    let second = JobCoordinator::new(Arc::new(memory.clone()));
    second.initialize(CoordinatorConfig::default()).await.unwrap();
    let again = second
        .create_recurring_job(
            JobType::Report,
            serde_json::json!({}),
            "30 6 * * 1",
            JobOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(spec.key, again.key);
    assert_eq!(memory.list_repeatables(JobType::Report).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_recurring_job_enqueues_one_occurrence_per_tick() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 58).unwrap());
    let backend = InMemoryBackend::with_clock(Arc::new(clock.clone()));
    let coordinator = JobCoordinator::new(Arc::new(backend.clone()));
    coordinator
        .initialize(CoordinatorConfig::default())
        .await
        .unwrap();
    coordinator
        .create_recurring_job(
            JobType::Cleanup,
            serde_json::json!({}),
            "0 0 * * *",
            JobOptions::new(),
        )
        .await
        .unwrap();

    let lock = Duration::from_secs(30);
    assert!(backend.fetch_next(JobType::Cleanup, lock).await.unwrap().is_none());

    clock.advance(Duration::from_secs(5));
    let occurrence = backend
        .fetch_next(JobType::Cleanup, lock)
        .await
        .unwrap()
        .expect("midnight occurrence");
    let midnight = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap();
    assert_eq!(
        occurrence.id,
        format!("repeat:cleanup:0 0 * * *:{}", midnight.timestamp_millis())
    );
    assert!(backend.fetch_next(JobType::Cleanup, lock).await.unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_pauses_every_queue_before_closing() {
    let backend = CountingBackend::new(InMemoryBackend::new());
    let coordinator = JobCoordinator::new(Arc::new(backend.clone()));
    coordinator
        .initialize(CoordinatorConfig {
            queues: vec![JobType::Email, JobType::Report],
            ..CoordinatorConfig::default()
        })
        .await
        .unwrap();

    coordinator.shutdown().await.unwrap();
    assert_eq!(backend.lifecycle(), vec!["pause:email", "pause:report", "close"]);
}

#[tokio::test]
async fn test_shutdown_can_leave_queues_running() {
    let backend = CountingBackend::new(InMemoryBackend::new());
    let manager = QueueManager::connect(
        Arc::new(backend.clone()),
        QueueManagerConfig {
            pause_on_shutdown: false,
            ..QueueManagerConfig::default()
        },
    )
    .await
    .unwrap();

    manager.shutdown().await.unwrap();
    assert_eq!(backend.lifecycle(), vec!["close"]);
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl Kind {
    fn job_type(self) -> JobType {
        match self {
            Kind::Waiting => JobType::Notification,
            Kind::Delayed => JobType::Report,
            Kind::Active => JobType::ContentProcessing,
            Kind::Completed => JobType::Email,
            Kind::Failed => JobType::Cleanup,
        }
    }

    fn is_finished(self) -> bool {
        matches!(self, Kind::Completed | Kind::Failed)
    }
}

fn kind() -> impl Strategy<Value = Kind> {
    prop_oneof![
        Just(Kind::Waiting),
        Just(Kind::Delayed),
        Just(Kind::Active),
        Just(Kind::Completed),
        Just(Kind::Failed),
    ]
}

/// Put a job into `kind`'s state as of `age_secs` ago
async fn seed(
    manager: &QueueManager,
    backend: &InMemoryBackend,
    clock: &ManualClock,
    kind: Kind,
    age_secs: u64,
) -> String {
    let now = clock.now();
    clock.set(now - chrono::Duration::seconds(age_secs as i64));

    let job_type = kind.job_type();
    let mut options = JobOptions::new().attempts(1).remove_on_complete(false);
    if let Kind::Delayed = kind {
        options = options.delay(Duration::from_secs(30 * 86_400));
    }
    let record = manager
        .enqueue(job_type, serde_json::json!({}), options)
        .await
        .unwrap();

    let lock = Duration::from_secs(365 * 86_400);
    let fetched = match kind {
        Kind::Waiting | Kind::Delayed => None,
        _ => backend.fetch_next(job_type, lock).await.unwrap(),
    };
    let token = fetched.and_then(|job| job.lock_token).unwrap_or_default();
    match kind {
        Kind::Completed => {
            backend
                .complete(job_type, &record.id, &token, None)
                .await
                .unwrap();
        }
        Kind::Failed => {
            backend
                .fail(job_type, &record.id, &token, "broken", true)
                .await
                .unwrap();
        }
        Kind::Waiting | Kind::Delayed | Kind::Active => {}
    }

    clock.set(now);
    record.id
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    /// Cleanup removes exactly the finished jobs older than the threshold
    #[test]
    fn prop_cleanup_only_removes_old_finished_jobs(
        jobs in prop::collection::vec((kind(), 0u64..7200), 1..20),
    ) {
        tokio::runtime::Runtime::new().unwrap().block_on(async {
            let clock = ManualClock::default();
            let backend = InMemoryBackend::with_clock(Arc::new(clock.clone()));
            let manager = QueueManager::connect(
                Arc::new(backend.clone()),
                QueueManagerConfig::default(),
            )
            .await
            .unwrap();

            let mut seeded = Vec::new();
            for (kind, age) in &jobs {
                let id = seed(&manager, &backend, &clock, *kind, *age).await;
                seeded.push((id, *kind, *age));
            }

            let threshold = 3600;
            let removed = manager.cleanup(Duration::from_secs(threshold)).await.unwrap();

            let mut expected_removed = 0;
            for (id, kind, age) in &seeded {
                let should_go = kind.is_finished() && *age > threshold;
                if should_go {
                    expected_removed += 1;
                }
                let present = backend.get(kind.job_type(), id).await.unwrap().is_some();
                prop_assert_eq!(present, !should_go);
            }
            prop_assert_eq!(removed, expected_removed);
            Ok(())
        })?;
    }
}
