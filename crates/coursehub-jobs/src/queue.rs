use crate::backend::{JobBackend, EVENT_CHANNEL_CAPACITY};
use crate::error::{JobError, Result};
use crate::job::{
    JobEvent, JobFilter, JobOptions, JobPriority, JobRecord, JobSettings, JobStatus, JobType,
    QueueMetrics, RepeatSpec,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Which queues exist and what unset job options default to
#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub queues: Vec<JobType>,
    pub defaults: JobSettings,
    /// Pause every managed queue on shutdown. The pause lives in the
    /// backend, so it also holds back other processes until resumed.
    pub pause_on_shutdown: bool,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            queues: JobType::ALL.to_vec(),
            defaults: JobSettings::default(),
            pause_on_shutdown: true,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Main job queue manager.
///
/// Owns one logical queue per registered [`JobType`] on a shared backend
/// and re-publishes the backend's lifecycle events locally.
pub struct QueueManager {
    backend: Arc<dyn JobBackend>,
    queues: BTreeSet<JobType>,
    defaults: JobSettings,
    pause_on_shutdown: bool,
    shutting_down: AtomicBool,
    counters: Arc<Counters>,
    events: broadcast::Sender<JobEvent>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    /// Check the backend is reachable and start relaying its events
    pub async fn connect(backend: Arc<dyn JobBackend>, config: QueueManagerConfig) -> Result<Self> {
        backend.ping().await?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let counters = Arc::new(Counters::default());
        let relay = tokio::spawn(relay_events(
            backend.subscribe(),
            events.clone(),
            counters.clone(),
        ));

        let queues: BTreeSet<JobType> = config.queues.into_iter().collect();
        tracing::info!(queues = ?queues, "Queue manager connected");

        Ok(Self {
            backend,
            queues,
            defaults: config.defaults,
            pause_on_shutdown: config.pause_on_shutdown,
            shutting_down: AtomicBool::new(false),
            counters,
            events,
            relay: Mutex::new(Some(relay)),
        })
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.backend.now()
    }

    pub fn queues(&self) -> impl Iterator<Item = JobType> + '_ {
        self.queues.iter().copied()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Local stream of lifecycle events for every managed queue
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn check_queue(&self, job_type: JobType) -> Result<()> {
        if self.queues.contains(&job_type) {
            Ok(())
        } else {
            Err(JobError::QueueNotFound(job_type))
        }
    }

    /// Submit a job
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobRecord> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        self.check_queue(job_type)?;

        let settings = options.merge_over(&self.defaults);
        let now = self.now();
        let delay = options.delay.unwrap_or_default();
        let run_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let record = JobRecord::new(id, job_type, payload, settings, now, run_at);
        let stored = self.backend.add(record).await?;
        tracing::debug!(
            job_id = %stored.id,
            job_type = %job_type,
            priority = ?stored.settings.priority,
            status = %stored.status,
            "Job enqueued"
        );
        Ok(stored)
    }

    /// Submit a job with a fixed priority and default options otherwise
    pub async fn enqueue_priority(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        priority: JobPriority,
    ) -> Result<JobRecord> {
        self.enqueue(job_type, payload, JobOptions::new().priority(priority))
            .await
    }

    pub async fn get_status(&self, job_type: JobType, id: &str) -> Result<Option<JobRecord>> {
        self.check_queue(job_type)?;
        self.backend.get(job_type, id).await
    }

    /// Look a job up by id across every managed queue
    pub async fn find(&self, id: &str) -> Result<Option<JobRecord>> {
        for job_type in self.queues() {
            if let Some(record) = self.backend.get(job_type, id).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Stop dispatching new jobs of this type; queued jobs stay queued
    pub async fn pause(&self, job_type: JobType) -> Result<()> {
        self.check_queue(job_type)?;
        self.backend.pause(job_type).await?;
        tracing::info!(queue = %job_type, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self, job_type: JobType) -> Result<()> {
        self.check_queue(job_type)?;
        self.backend.resume(job_type).await?;
        tracing::info!(queue = %job_type, "Queue resumed");
        Ok(())
    }

    /// Operator retry of a finished or queued job
    pub async fn retry(&self, job_type: JobType, id: &str) -> Result<()> {
        self.check_queue(job_type)?;
        self.backend.retry(job_type, id).await?;
        tracing::info!(job_id = %id, job_type = %job_type, "Job manually retried");
        Ok(())
    }

    /// Delete a job whatever its status.
    ///
    /// A processor already running the job is not interrupted; its outcome
    /// is discarded when it tries to report back.
    pub async fn remove(&self, job_type: JobType, id: &str) -> Result<()> {
        self.check_queue(job_type)?;
        self.backend.remove(job_type, id).await?;
        tracing::debug!(job_id = %id, job_type = %job_type, "Job removed");
        Ok(())
    }

    /// Jobs matching `filter` across the managed queues, newest first
    pub async fn search(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let types: Vec<JobType> = match filter.job_type {
            Some(t) => {
                self.check_queue(t)?;
                vec![t]
            }
            None => self.queues().collect(),
        };

        let mut records = Vec::new();
        for job_type in types {
            records.extend(self.backend.list(job_type, filter).await?);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Live counts for every managed queue plus this process's counters
    pub async fn metrics(&self) -> Result<QueueMetrics> {
        let mut metrics = QueueMetrics {
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            ..QueueMetrics::default()
        };
        for job_type in self.queues() {
            metrics.insert(job_type, self.backend.counts(job_type).await?);
        }
        Ok(metrics)
    }

    /// Delete completed and failed jobs that finished more than `older_than` ago
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize> {
        let mut removed = 0;
        for job_type in self.queues() {
            for status in [JobStatus::Completed, JobStatus::Failed] {
                removed += self.backend.clean(job_type, status, older_than).await?.len();
            }
        }
        tracing::info!(removed, older_than_secs = older_than.as_secs(), "Old jobs cleaned up");
        Ok(removed)
    }

    pub async fn add_repeatable(&self, spec: RepeatSpec) -> Result<bool> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        self.check_queue(spec.job_type)?;
        self.backend.add_repeatable(spec).await
    }

    pub async fn remove_repeatable(&self, job_type: JobType, key: &str) -> Result<bool> {
        self.check_queue(job_type)?;
        self.backend.remove_repeatable(job_type, key).await
    }

    /// Stop accepting jobs, pause every managed queue (unless
    /// `pause_on_shutdown` is off) and release the backend.
    ///
    /// A queue that fails to pause is logged and skipped so the backend is
    /// still closed.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(pause = self.pause_on_shutdown, "Queue manager shutting down");

        if self.pause_on_shutdown {
            for &job_type in &self.queues {
                if let Err(e) = self.backend.pause(job_type).await {
                    tracing::warn!(queue = %job_type, error = %e, "Failed to pause queue on shutdown");
                }
            }
        }
        if let Some(relay) = self.relay.lock().unwrap_or_else(|e| e.into_inner()).take() {
            relay.abort();
        }
        self.backend.close().await
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.lock().unwrap_or_else(|e| e.into_inner()).take() {
            relay.abort();
        }
    }
}

async fn relay_events(
    mut rx: broadcast::Receiver<JobEvent>,
    tx: broadcast::Sender<JobEvent>,
    counters: Arc<Counters>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                match &event {
                    JobEvent::Completed { .. } => {
                        counters.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    JobEvent::Failed { .. } => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                let _ = tx.send(event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Job event relay lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
