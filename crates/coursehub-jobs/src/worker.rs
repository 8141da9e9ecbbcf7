use crate::backend::JobBackend;
use crate::error::{JobError, Result};
use crate::job::{JobRecord, JobStatus, JobType};
use crate::processor::{Job, JobContext, JobHandler, ProcessorRegistry};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

mod metrics;
pub mod scaling;

pub use metrics::WorkerMetrics;
use metrics::MetricsRecorder;

/// Pause after a failed fetch before polling the backend again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job types this pool serves; each needs a registered processor
    pub queues: Vec<JobType>,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Starting concurrency, clamped into `[min, max]`
    pub concurrency: usize,
    /// Sleep between polls when every queue is empty
    pub poll_interval: Duration,
    /// Lock TTL on active jobs; renewed every half TTL while the job runs
    pub lock_duration: Duration,
    pub stalled_check_interval: Duration,
    pub health_check_interval: Duration,
    pub autoscale_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Consecutive failed recoveries before the failure is logged as an alert
    pub recovery_alert_threshold: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: JobType::ALL.to_vec(),
            min_concurrency: 1,
            max_concurrency: 10,
            concurrency: 2,
            poll_interval: Duration::from_millis(100),
            lock_duration: Duration::from_secs(30),
            stalled_check_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            autoscale_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            recovery_alert_threshold: 5,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(JobError::Config("worker serves no queues".to_string()));
        }
        if self.min_concurrency == 0 {
            return Err(JobError::Config("min_concurrency must be at least 1".to_string()));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(JobError::Config(format!(
                "min_concurrency ({}) exceeds max_concurrency ({})",
                self.min_concurrency, self.max_concurrency
            )));
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("lock_duration", self.lock_duration),
            ("stalled_check_interval", self.stalled_check_interval),
            ("health_check_interval", self.health_check_interval),
            ("autoscale_interval", self.autoscale_interval),
        ] {
            if value.is_zero() {
                return Err(JobError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

/// Lifecycle of a worker pool instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Recovering,
    ShuttingDown,
}

/// How a graceful shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight job finished
    Drained,
    /// The timeout hit first; `abandoned` jobs were still running and are
    /// left for the backend to reclaim as stalled
    TimedOut { abandoned: usize },
}

impl ShutdownOutcome {
    pub fn is_drained(&self) -> bool {
        matches!(self, Self::Drained)
    }
}

/// Builder for [`WorkerPool`]
pub struct WorkerPoolBuilder {
    backend: Arc<dyn JobBackend>,
    config: WorkerConfig,
    registry: ProcessorRegistry,
    close_backend: bool,
}

impl WorkerPoolBuilder {
    /// Register the processor for `J::TYPE`
    pub fn register<J: Job>(mut self, job: J) -> Self {
        self.registry.register(job);
        self
    }

    pub fn register_handler(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.registry.register_handler(job_type, handler);
        self
    }

    /// Whether `shutdown` closes the backend (default `true`). Turn off
    /// when the backend is shared with a coordinator in the same process.
    pub fn close_backend_on_shutdown(mut self, close: bool) -> Self {
        self.close_backend = close;
        self
    }

    /// Validate the config and check that every served job type has a
    /// processor, so a missing registration fails at startup rather than
    /// on the first job of that type.
    pub fn build(self) -> Result<WorkerPool> {
        self.config.validate()?;
        self.registry.ensure_covers(&self.config.queues)?;
        Ok(WorkerPool::from_parts(
            self.backend,
            self.config,
            self.registry,
            self.close_backend,
        ))
    }
}

/// Pulls jobs from the backend and runs them on registered processors.
///
/// Concurrency is adjusted by the auto-scaling loop, the health loop
/// restarts the execution engine when it dies or the backend drops out, and
/// the stalled loop hands expired locks back to the queue.
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn builder(backend: Arc<dyn JobBackend>, config: WorkerConfig) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            backend,
            config,
            registry: ProcessorRegistry::new(),
            close_backend: true,
        }
    }

    fn from_parts(
        backend: Arc<dyn JobBackend>,
        config: WorkerConfig,
        registry: ProcessorRegistry,
        close_backend: bool,
    ) -> Self {
        let concurrency = config
            .concurrency
            .clamp(config.min_concurrency, config.max_concurrency);
        let (state, _) = watch::channel(WorkerState::Stopped);
        let (concurrency, _) = watch::channel(concurrency);
        Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                config,
                close_backend,
                concurrency,
                in_flight: Arc::new(AtomicUsize::new(0)),
                next_queue: AtomicUsize::new(0),
                metrics: MetricsRecorder::default(),
                state,
                shutting_down: AtomicBool::new(false),
                engine: tokio::sync::Mutex::new(None),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    /// Start pulling jobs and the health, auto-scaling and stalled loops
    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    /// Replace the execution engine. In-flight jobs of the old engine run
    /// to completion in the background.
    pub async fn recover(&self) -> Result<()> {
        self.inner.recover().await
    }

    /// Backend reachable and execution engine alive
    pub async fn check_health(&self) -> Result<()> {
        self.inner.check_health().await
    }

    /// Run one auto-scaling step now; returns the new concurrency
    pub async fn autoscale(&self) -> Result<usize> {
        self.inner.autoscale().await
    }

    /// Hand jobs with expired locks back to their queues; returns how many
    pub async fn reclaim_stalled(&self) -> Result<usize> {
        self.inner.reclaim_stalled().await
    }

    /// Stop taking jobs and wait up to `timeout` for in-flight ones
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        self.inner.shutdown(timeout).await
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.inner
            .metrics
            .snapshot(self.inner.concurrency(), self.inner.in_flight())
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.inner.state.subscribe()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for task in self.inner.loops.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        if let Ok(mut engine) = self.inner.engine.try_lock() {
            if let Some(engine) = engine.take() {
                engine.stop();
            }
        }
    }
}

struct Inner {
    backend: Arc<dyn JobBackend>,
    registry: ProcessorRegistry,
    config: WorkerConfig,
    close_backend: bool,
    /// Current limit; the dispatcher wakes when it changes
    concurrency: watch::Sender<usize>,
    in_flight: Arc<AtomicUsize>,
    /// Round-robin cursor over `config.queues`
    next_queue: AtomicUsize,
    metrics: MetricsRecorder,
    state: watch::Sender<WorkerState>,
    shutting_down: AtomicBool,
    engine: tokio::sync::Mutex<Option<Engine>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn concurrency(&self) -> usize {
        *self.concurrency.borrow()
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Worker state changed");
        }
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }

        let mut engine = self.engine.lock().await;
        if engine.is_some() {
            tracing::warn!("Worker pool already started");
            return Ok(());
        }

        self.set_state(WorkerState::Starting);
        if let Err(e) = self.backend.ping().await {
            self.set_state(WorkerState::Stopped);
            return Err(e);
        }
        *engine = Some(Engine::start(self.clone()));
        drop(engine);

        {
            let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
            if loops.is_empty() {
                loops.push(self.spawn_loop(self.config.health_check_interval, |inner| async move {
                    inner.health_tick().await;
                }));
                loops.push(self.spawn_loop(self.config.autoscale_interval, |inner| async move {
                    if let Err(e) = inner.autoscale().await {
                        tracing::warn!(error = %e, "Auto-scaling tick failed");
                    }
                }));
                loops.push(self.spawn_loop(self.config.stalled_check_interval, |inner| async move {
                    if let Err(e) = inner.reclaim_stalled().await {
                        tracing::warn!(error = %e, "Stalled job check failed");
                    }
                }));
            }
        }

        self.set_state(WorkerState::Running);
        tracing::info!(
            queues = ?self.config.queues,
            concurrency = self.concurrency(),
            min = self.config.min_concurrency,
            max = self.config.max_concurrency,
            "Worker pool started"
        );
        Ok(())
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, every: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Inner>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tick(inner.clone()).await;
            }
        })
    }

    async fn check_health(&self) -> Result<()> {
        self.backend
            .ping()
            .await
            .map_err(|e| JobError::HealthCheck(e.to_string()))?;
        let running = self
            .engine
            .lock()
            .await
            .as_ref()
            .map_or(false, Engine::is_running);
        if !running {
            return Err(JobError::HealthCheck(
                "execution engine is not running".to_string(),
            ));
        }
        Ok(())
    }

    async fn health_tick(self: &Arc<Self>) {
        let Err(problem) = self.check_health().await else {
            self.metrics.reset_recovery_failures();
            return;
        };

        tracing::warn!(error = %problem, "Worker unhealthy, recovering");
        match self.recover().await {
            Ok(()) => self.metrics.recovery_succeeded(),
            Err(e) => {
                let failures = self.metrics.recovery_failed();
                if failures >= self.config.recovery_alert_threshold {
                    tracing::error!(
                        consecutive_failures = failures,
                        error = %e,
                        "ALERT: worker recovery keeps failing"
                    );
                } else {
                    tracing::warn!(
                        consecutive_failures = failures,
                        error = %e,
                        "Worker recovery failed, retrying next tick"
                    );
                }
            }
        }
    }

    async fn recover(self: &Arc<Self>) -> Result<()> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        self.set_state(WorkerState::Recovering);

        let mut engine = self.engine.lock().await;
        if let Some(old) = engine.take() {
            tokio::spawn(old.drain());
        }
        self.backend.ping().await?;
        *engine = Some(Engine::start(self.clone()));
        drop(engine);

        if !self.is_shutting_down() {
            self.set_state(WorkerState::Running);
        }
        tracing::info!("Worker pool recovered");
        Ok(())
    }

    async fn autoscale(&self) -> Result<usize> {
        let mut waiting = 0;
        let mut active = 0;
        for &job_type in &self.config.queues {
            let counts = self.backend.counts(job_type).await?;
            if !counts.paused {
                waiting += counts.waiting;
            }
            active += counts.active;
        }
        self.metrics.set_queue_depth(waiting);

        let current = self.concurrency();
        let next = scaling::next_concurrency(
            current,
            self.config.min_concurrency,
            self.config.max_concurrency,
            waiting,
            active,
        );
        if next != current {
            self.concurrency.send_replace(next);
            tracing::info!(from = current, to = next, waiting, active, "Worker concurrency adjusted");
        }
        Ok(next)
    }

    async fn reclaim_stalled(&self) -> Result<usize> {
        let mut total = 0;
        for &job_type in &self.config.queues {
            let ids = self.backend.recover_stalled(job_type).await?;
            if !ids.is_empty() {
                tracing::warn!(queue = %job_type, count = ids.len(), "Reclaimed stalled jobs");
            }
            total += ids.len();
        }
        Ok(total)
    }

    async fn fetch_next(&self) -> Result<Option<JobRecord>> {
        let queues = &self.config.queues;
        let start = self.next_queue.fetch_add(1, Ordering::Relaxed);
        for i in 0..queues.len() {
            let job_type = queues[(start + i) % queues.len()];
            if let Some(record) = self
                .backend
                .fetch_next(job_type, self.config.lock_duration)
                .await?
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn run(self: Arc<Self>, record: JobRecord) {
        let span = tracing::info_span!(
            "job",
            job_id = %record.id,
            job_type = %record.job_type,
            attempt = record.attempts_made + 1
        );
        self.process(record, span.clone()).instrument(span).await
    }

    async fn process(&self, record: JobRecord, span: tracing::Span) {
        let started = Instant::now();
        let outcome = self.execute(&record, span).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        match outcome {
            Ok(result) => {
                self.metrics.record_success(elapsed);
                match self
                    .backend
                    .complete(record.job_type, &record.id, lock_token(&record), Some(result))
                    .await
                {
                    Ok(_) => tracing::info!(elapsed_ms, "Job processed"),
                    Err(e @ (JobError::LockMismatch { .. } | JobError::InvalidState { .. })) => {
                        tracing::warn!(error = %e, "Job was reclaimed, discarding its result")
                    }
                    Err(e) => tracing::warn!(error = %e, "Could not record job completion"),
                }
            }
            Err(err) => {
                self.metrics.record_failure(elapsed);
                let reason = err.to_string();
                match self
                    .backend
                    .fail(
                        record.job_type,
                        &record.id,
                        lock_token(&record),
                        &reason,
                        err.is_retryable(),
                    )
                    .await
                {
                    Ok(updated) if updated.status == JobStatus::Failed => tracing::error!(
                        error = %reason,
                        attempts_made = updated.attempts_made,
                        elapsed_ms,
                        "Job failed permanently"
                    ),
                    Ok(updated) => tracing::warn!(
                        error = %reason,
                        attempts_made = updated.attempts_made,
                        retry_at = %updated.run_at,
                        elapsed_ms,
                        "Job failed, retry scheduled"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Could not record job failure"),
                }
            }
        }
    }

    async fn execute(&self, record: &JobRecord, span: tracing::Span) -> Result<serde_json::Value> {
        let handler = self.registry.get(record.job_type)?;
        let ctx = JobContext::new(
            record.id.clone(),
            record.job_type,
            record.attempts_made + 1,
            record.created_at,
            lock_token(record).to_string(),
            span,
            self.backend.clone(),
        );

        let work = async {
            match record.settings.timeout() {
                Some(limit) => {
                    match tokio::time::timeout(limit, handler.handle(ctx, record.payload.clone())).await {
                        Ok(result) => result,
                        Err(_) => Err(JobError::Timeout(limit)),
                    }
                }
                None => handler.handle(ctx, record.payload.clone()).await,
            }
        };

        tokio::select! {
            result = work => result,
            () = self.heartbeat(record) => Err(JobError::processing("lost the lock on the job")),
        }
    }

    /// Keep the job's lock alive; returns only once the lock is lost
    async fn heartbeat(&self, record: &JobRecord) {
        let every = self.config.lock_duration / 2;
        loop {
            tokio::time::sleep(every).await;
            match self
                .backend
                .extend_lock(
                    record.job_type,
                    &record.id,
                    lock_token(record),
                    self.config.lock_duration,
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("Lock on job lost");
                    return;
                }
                Err(e) => tracing::warn!(error = %e, "Could not extend job lock"),
            }
        }
    }

    async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return ShutdownOutcome::Drained;
        }
        self.set_state(WorkerState::ShuttingDown);
        tracing::info!(
            timeout_ms = timeout.as_millis() as u64,
            in_flight = self.in_flight(),
            "Worker pool shutting down"
        );

        for task in self.loops.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }

        let engine = self.engine.lock().await.take();
        let backend = self.backend.clone();
        let close_backend = self.close_backend;
        let drain = async move {
            if let Some(engine) = engine {
                engine.drain().await;
            }
            if close_backend {
                if let Err(e) = backend.close().await {
                    tracing::warn!(error = %e, "Failed to close job backend");
                }
            }
        };
        tokio::pin!(drain);

        let outcome = tokio::select! {
            () = &mut drain => ShutdownOutcome::Drained,
            () = tokio::time::sleep(timeout) => {
                let abandoned = self.in_flight();
                tracing::warn!(
                    abandoned,
                    error = %JobError::ShutdownTimeout(timeout),
                    "Abandoning in-flight jobs"
                );
                if self.close_backend {
                    if let Err(e) = self.backend.close().await {
                        tracing::warn!(error = %e, "Failed to close job backend");
                    }
                }
                ShutdownOutcome::TimedOut { abandoned }
            }
        };

        self.set_state(WorkerState::Stopped);
        tracing::info!(outcome = ?outcome, "Worker pool stopped");
        outcome
    }
}

/// The dispatch loop and the job tasks it spawned
struct Engine {
    stop: watch::Sender<bool>,
    dispatcher: JoinHandle<JoinSet<()>>,
}

impl Engine {
    fn start(inner: Arc<Inner>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch(inner, stop_rx));
        Self { stop, dispatcher }
    }

    fn is_running(&self) -> bool {
        !self.dispatcher.is_finished()
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stop dispatching and wait for every job task to finish
    async fn drain(self) {
        self.stop();
        match self.dispatcher.await {
            Ok(mut tasks) => {
                while let Some(res) = tasks.join_next().await {
                    log_task_exit(res);
                }
            }
            Err(e) => tracing::error!(error = %e, "Job dispatcher exited abnormally"),
        }
    }
}

async fn dispatch(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) -> JoinSet<()> {
    let mut tasks = JoinSet::new();
    let mut limit = inner.concurrency.subscribe();
    loop {
        if *stop.borrow() {
            break;
        }
        while let Some(res) = tasks.try_join_next() {
            log_task_exit(res);
        }

        if tasks.len() >= *limit.borrow_and_update() {
            tokio::select! {
                changed = stop.changed() => if changed.is_err() { break; },
                Some(res) = tasks.join_next() => log_task_exit(res),
                // scaled up while saturated
                Ok(()) = limit.changed() => {}
            }
            continue;
        }

        let pause = match inner.fetch_next().await {
            Ok(Some(record)) => {
                let guard = InFlight::enter(&inner.in_flight);
                let job = inner.clone().run(record);
                tasks.spawn(async move {
                    let _guard = guard;
                    job.await;
                });
                continue;
            }
            Ok(None) => inner.config.poll_interval,
            Err(e) => {
                tracing::error!(error = %e, "Worker failed to fetch job");
                ERROR_BACKOFF
            }
        };

        tokio::select! {
            changed = stop.changed() => if changed.is_err() { break; },
            () = tokio::time::sleep(pause) => {}
        }
    }
    tasks
}

/// Token issued when the job was fetched; backends always set one
fn lock_token(record: &JobRecord) -> &str {
    record.lock_token.as_deref().unwrap_or_default()
}

fn log_task_exit(res: std::result::Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            tracing::error!(error = %e, "Job task panicked");
        }
    }
}

/// Counts a job task as in flight until dropped
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
