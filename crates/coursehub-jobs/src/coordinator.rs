use crate::backend::{JobBackend, EVENT_CHANNEL_CAPACITY};
use crate::error::{JobError, Result};
use crate::job::{
    JobEvent, JobFilter, JobOptions, JobRecord, JobSettings, JobType, QueueMetrics, RepeatSpec,
};
use crate::queue::{QueueManager, QueueManagerConfig};
use crate::schedule::CronSchedule;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

const SECS_PER_DAY: u64 = 86_400;

/// Settings for [`JobCoordinator::initialize`]
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub queues: Vec<JobType>,
    pub defaults: JobSettings,
    /// How often the cleanup sweep runs
    pub maintenance_interval: Duration,
    /// Finished jobs older than this are removed by the sweep
    pub cleanup_retention: Duration,
    /// See [`QueueManagerConfig::pause_on_shutdown`]
    pub pause_on_shutdown: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queues: JobType::ALL.to_vec(),
            defaults: JobSettings::default(),
            maintenance_interval: Duration::from_secs(SECS_PER_DAY),
            cleanup_retention: Duration::from_secs(7 * SECS_PER_DAY),
            pause_on_shutdown: true,
        }
    }
}

struct Initialized {
    manager: Arc<QueueManager>,
    defaults: JobSettings,
    tasks: Vec<JoinHandle<()>>,
}

/// Process-wide entry point for submitting and managing jobs.
///
/// Construct one at startup, call [`initialize`](Self::initialize) once and
/// share it (usually behind an `Arc`). Every operation fails with
/// [`JobError::NotInitialized`] until initialization has succeeded.
pub struct JobCoordinator {
    backend: Arc<dyn JobBackend>,
    inner: RwLock<Option<Initialized>>,
    shutting_down: AtomicBool,
    events: broadcast::Sender<JobEvent>,
    /// Recurring registrations made through this coordinator, by key
    recurring: Mutex<HashMap<String, RepeatSpec>>,
}

impl JobCoordinator {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            inner: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
            events,
            recurring: Mutex::new(HashMap::new()),
        }
    }

    /// Connect the queue manager and start event logging and the
    /// maintenance sweep. A second call is a logged no-op.
    pub async fn initialize(&self, config: CoordinatorConfig) -> Result<()> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }

        let mut inner = self.inner.write().await;
        if inner.is_some() {
            tracing::warn!("Job coordinator already initialized, ignoring");
            return Ok(());
        }

        let manager_config = QueueManagerConfig {
            queues: config.queues.clone(),
            defaults: config.defaults.clone(),
            pause_on_shutdown: config.pause_on_shutdown,
        };
        let manager = match QueueManager::connect(self.backend.clone(), manager_config).await {
            Ok(manager) => Arc::new(manager),
            Err(e) => {
                tracing::error!(error = %e, "Job coordinator initialization failed");
                return Err(e);
            }
        };

        let tasks = vec![
            tokio::spawn(log_events(manager.subscribe(), self.events.clone())),
            tokio::spawn(run_maintenance(
                manager.clone(),
                config.maintenance_interval,
                config.cleanup_retention,
            )),
        ];

        *inner = Some(Initialized {
            manager,
            defaults: config.defaults,
            tasks,
        });
        tracing::info!(
            queues = config.queues.len(),
            maintenance_interval_secs = config.maintenance_interval.as_secs(),
            "Job coordinator initialized"
        );
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.is_some()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn manager(&self) -> Result<Arc<QueueManager>> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|i| i.manager.clone())
            .ok_or(JobError::NotInitialized)
    }

    async fn defaults(&self) -> Result<JobSettings> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|i| i.defaults.clone())
            .ok_or(JobError::NotInitialized)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.backend.now()
    }

    /// Lifecycle events from every queue. Usable before `initialize`.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub async fn create_job(
        &self,
        job_type: JobType,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobRecord> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        self.manager().await?.enqueue(job_type, data, options).await
    }

    /// Create a job that becomes runnable at `at`. Times in the past run
    /// immediately.
    pub async fn schedule_job(
        &self,
        job_type: JobType,
        data: serde_json::Value,
        at: DateTime<Utc>,
        options: JobOptions,
    ) -> Result<JobRecord> {
        let delay = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.create_job(job_type, data, options.delay(delay)).await
    }

    /// Register a job that is enqueued on every tick of a 5-field cron
    /// expression (UTC).
    ///
    /// Registrations are keyed by the explicit job id if one is given,
    /// otherwise by `"{type}:{expression}"`. Registering the same key again
    /// returns the existing registration without touching the backend.
    pub async fn create_recurring_job(
        &self,
        job_type: JobType,
        data: serde_json::Value,
        expression: &str,
        options: JobOptions,
    ) -> Result<RepeatSpec> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        let manager = self.manager().await?;
        let schedule = CronSchedule::parse(expression)?;
        let key = options
            .job_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", job_type, schedule.expression()));

        let mut recurring = self.recurring.lock().await;
        if let Some(existing) = recurring.get(&key) {
            tracing::debug!(repeat_key = %key, "Recurring job already registered");
            return Ok(existing.clone());
        }

        let next_run = schedule.next_after(self.now()).ok_or_else(|| {
            JobError::InvalidSchedule(format!("'{}' has no upcoming occurrence", expression))
        })?;
        let spec = RepeatSpec {
            key: key.clone(),
            job_type,
            payload: data,
            cron: schedule.expression().to_string(),
            settings: options.merge_over(&self.defaults().await?),
            next_run,
        };

        let added = manager.add_repeatable(spec.clone()).await?;
        tracing::info!(
            repeat_key = %key,
            job_type = %job_type,
            cron = %spec.cron,
            next_run = %next_run,
            already_present = !added,
            "Recurring job registered"
        );
        recurring.insert(key, spec.clone());
        Ok(spec)
    }

    /// Drop a recurring registration. Occurrences already enqueued stay.
    pub async fn remove_recurring_job(&self, job_type: JobType, key: &str) -> Result<bool> {
        let manager = self.manager().await?;
        let removed = manager.remove_repeatable(job_type, key).await?;
        self.recurring.lock().await.remove(key);
        Ok(removed)
    }

    pub async fn get_job_status(&self, job_type: JobType, id: &str) -> Result<Option<JobRecord>> {
        self.manager().await?.get_status(job_type, id).await
    }

    /// Look a job up by id without knowing its type
    pub async fn find_job(&self, id: &str) -> Result<Option<JobRecord>> {
        self.manager().await?.find(id).await
    }

    pub async fn search_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.manager().await?.search(filter).await
    }

    pub async fn remove_job(&self, job_type: JobType, id: &str) -> Result<()> {
        self.manager().await?.remove(job_type, id).await
    }

    pub async fn retry_job(&self, job_type: JobType, id: &str) -> Result<()> {
        self.manager().await?.retry(job_type, id).await
    }

    pub async fn pause_queue(&self, job_type: JobType) -> Result<()> {
        self.manager().await?.pause(job_type).await
    }

    pub async fn resume_queue(&self, job_type: JobType) -> Result<()> {
        self.manager().await?.resume(job_type).await
    }

    /// `true` iff the backend answers
    pub async fn health_check(&self) -> Result<bool> {
        let manager = self.manager().await?;
        match manager.backend().ping().await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "Job backend health check failed");
                Ok(false)
            }
        }
    }

    pub async fn metrics(&self) -> Result<QueueMetrics> {
        self.manager().await?.metrics().await
    }

    /// Remove completed and failed jobs that finished more than `days` ago
    pub async fn cleanup_old_jobs(&self, days: u32) -> Result<usize> {
        self.cleanup_older_than(Duration::from_secs(u64::from(days) * SECS_PER_DAY))
            .await
    }

    pub async fn cleanup_older_than(&self, older_than: Duration) -> Result<usize> {
        self.manager().await?.cleanup(older_than).await
    }

    /// Stop accepting jobs and release the backend. Later calls return
    /// immediately.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(initialized) = self.inner.write().await.take() else {
            tracing::debug!("Job coordinator shut down before initialization");
            return Ok(());
        };

        tracing::info!("Job coordinator shutting down");
        for task in &initialized.tasks {
            task.abort();
        }
        initialized.manager.shutdown().await?;
        tracing::info!("Job coordinator shut down");
        Ok(())
    }
}

impl Drop for JobCoordinator {
    fn drop(&mut self) {
        if let Some(initialized) = self.inner.get_mut().take() {
            for task in initialized.tasks {
                task.abort();
            }
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<JobEvent>, tx: broadcast::Sender<JobEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Coordinator event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            JobEvent::Completed { job_type, job_id, .. } => {
                tracing::info!(job_id = %job_id, job_type = %job_type, "Job completed");
            }
            JobEvent::Failed {
                job_type,
                job_id,
                reason,
                will_retry: true,
            } => {
                tracing::warn!(job_id = %job_id, job_type = %job_type, reason = %reason, "Job attempt failed, retrying");
            }
            JobEvent::Failed {
                job_type,
                job_id,
                reason,
                will_retry: false,
            } => {
                tracing::error!(job_id = %job_id, job_type = %job_type, reason = %reason, "Job failed");
            }
            JobEvent::Stalled { job_type, job_id } => {
                tracing::warn!(job_id = %job_id, job_type = %job_type, "Job stalled");
            }
            other => {
                tracing::debug!(job_id = %other.job_id(), job_type = %other.job_type(), event = other.name(), "Job event");
            }
        }
        let _ = tx.send(event);
    }
}

async fn run_maintenance(manager: Arc<QueueManager>, every: Duration, retention: Duration) {
    let mut ticker = tokio::time::interval(every);
    // first tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match manager.cleanup(retention).await {
            Ok(removed) => tracing::debug!(removed, "Maintenance sweep finished"),
            Err(e) => tracing::error!(error = %e, "Maintenance sweep failed"),
        }
    }
}
