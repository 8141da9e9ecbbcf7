use super::{new_lock_token, JobBackend, EVENT_CHANNEL_CAPACITY, STALLED_REASON};
use crate::clock::{Clock, SystemClock};
use crate::error::{JobError, Result};
use crate::job::{
    FailureOutcome, JobEvent, JobFilter, JobRecord, JobStatus, JobType, QueueCounts, RepeatSpec,
};
use crate::schedule::CronSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, JobRecord>,
    /// FIFO position of waiting jobs within a priority
    order: HashMap<String, u64>,
    next_seq: u64,
    /// Lock expiry of active jobs
    locks: HashMap<String, DateTime<Utc>>,
    repeats: BTreeMap<String, RepeatSpec>,
    paused: bool,
}

impl QueueState {
    fn mark_waiting(&mut self, id: &str) {
        self.next_seq += 1;
        self.order.insert(id.to_string(), self.next_seq);
    }

    fn forget(&mut self, id: &str) -> Option<JobRecord> {
        self.order.remove(id);
        self.locks.remove(id);
        self.jobs.remove(id)
    }

    /// The active record held under `token`
    fn held(&mut self, id: &str, token: &str) -> Result<&mut JobRecord> {
        let record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        if record.status != JobStatus::Active {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }
        if record.lock_token.as_deref() != Some(token) {
            return Err(JobError::LockMismatch { id: id.to_string() });
        }
        Ok(record)
    }

    fn promote_due(&mut self, now: DateTime<Utc>, events: &mut Vec<JobEvent>) {
        let due: Vec<String> = self
            .jobs
            .values()
            .filter(|r| r.status == JobStatus::Delayed && r.run_at <= now)
            .map(|r| r.id.clone())
            .collect();
        for id in due {
            if let Some(record) = self.jobs.get_mut(&id) {
                record.status = JobStatus::Waiting;
                events.push(JobEvent::Waiting {
                    job_type: record.job_type,
                    job_id: id.clone(),
                });
            }
            self.mark_waiting(&id);
        }

        let mut spawned = Vec::new();
        let mut exhausted = Vec::new();
        for spec in self.repeats.values_mut() {
            if spec.next_run > now {
                continue;
            }
            let occurrence = spec.occurrence(spec.next_run, now);
            if !self.jobs.contains_key(&occurrence.id) {
                spawned.push(occurrence);
            }
            match CronSchedule::parse(&spec.cron)
                .ok()
                .and_then(|s| s.next_after(now))
            {
                Some(next) => spec.next_run = next,
                None => exhausted.push(spec.key.clone()),
            }
        }
        for key in exhausted {
            tracing::warn!(repeat_key = %key, "Recurring job has no further occurrences, dropping it");
            self.repeats.remove(&key);
        }
        for record in spawned {
            events.push(JobEvent::Waiting {
                job_type: record.job_type,
                job_id: record.id.clone(),
            });
            let id = record.id.clone();
            self.jobs.insert(id.clone(), record);
            self.mark_waiting(&id);
        }
    }

    fn next_waiting(&self) -> Option<String> {
        self.jobs
            .values()
            .filter(|r| r.status == JobStatus::Waiting)
            .min_by_key(|r| {
                (
                    Reverse(r.settings.priority),
                    self.order.get(&r.id).copied().unwrap_or(u64::MAX),
                )
            })
            .map(|r| r.id.clone())
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<JobType, QueueState>,
    closed: bool,
}

impl State {
    fn queue(&mut self, job_type: JobType) -> &mut QueueState {
        self.queues.entry(job_type).or_default()
    }
}

/// In-process job backend (not persistent, for testing/dev)
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<JobEvent>,
    clock: Arc<dyn Clock>,
    reachable: Arc<AtomicBool>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
            clock,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing (or regaining) the connection to the backend
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(JobError::Backend("backend unreachable".to_string()));
        }
        let state = self
            .state
            .lock()
            .map_err(|_| JobError::Backend("Lock poisoned".to_string()))?;
        if state.closed {
            return Err(JobError::Backend("backend closed".to_string()));
        }
        Ok(state)
    }

    fn emit(&self, events: Vec<JobEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn millis(d: Duration) -> chrono::Duration {
        chrono::Duration::milliseconds(d.as_millis() as i64)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBackend for InMemoryBackend {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    async fn add(&self, record: JobRecord) -> Result<JobRecord> {
        let event = {
            let mut state = self.lock()?;
            let q = state.queue(record.job_type);
            if let Some(existing) = q.jobs.get(&record.id) {
                return Ok(existing.clone());
            }
            let event = match record.status {
                JobStatus::Delayed => JobEvent::Delayed {
                    job_type: record.job_type,
                    job_id: record.id.clone(),
                    run_at: record.run_at,
                },
                _ => JobEvent::Waiting {
                    job_type: record.job_type,
                    job_id: record.id.clone(),
                },
            };
            if record.status == JobStatus::Waiting {
                q.mark_waiting(&record.id);
            }
            q.jobs.insert(record.id.clone(), record.clone());
            event
        };
        self.emit(vec![event]);
        Ok(record)
    }

    async fn get(&self, job_type: JobType, id: &str) -> Result<Option<JobRecord>> {
        let mut state = self.lock()?;
        Ok(state.queue(job_type).jobs.get(id).cloned())
    }

    async fn list(&self, job_type: JobType, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let mut state = self.lock()?;
        let mut records: Vec<JobRecord> = state
            .queue(job_type)
            .jobs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn remove(&self, job_type: JobType, id: &str) -> Result<()> {
        {
            let mut state = self.lock()?;
            state
                .queue(job_type)
                .forget(id)
                .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        }
        self.emit(vec![JobEvent::Removed {
            job_type,
            job_id: id.to_string(),
        }]);
        Ok(())
    }

    async fn retry(&self, job_type: JobType, id: &str) -> Result<()> {
        let now = self.now();
        {
            let mut state = self.lock()?;
            let q = state.queue(job_type);
            let record = q
                .jobs
                .get_mut(id)
                .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
            if record.status == JobStatus::Active {
                return Err(JobError::InvalidState {
                    id: id.to_string(),
                    status: record.status,
                });
            }
            record.reset_for_retry(now);
            q.mark_waiting(id);
        }
        self.emit(vec![JobEvent::Waiting {
            job_type,
            job_id: id.to_string(),
        }]);
        Ok(())
    }

    async fn pause(&self, job_type: JobType) -> Result<()> {
        self.lock()?.queue(job_type).paused = true;
        Ok(())
    }

    async fn resume(&self, job_type: JobType) -> Result<()> {
        self.lock()?.queue(job_type).paused = false;
        Ok(())
    }

    async fn is_paused(&self, job_type: JobType) -> Result<bool> {
        Ok(self.lock()?.queue(job_type).paused)
    }

    async fn clean(
        &self,
        job_type: JobType,
        status: JobStatus,
        older_than: Duration,
    ) -> Result<Vec<String>> {
        if !status.is_finished() {
            return Ok(Vec::new());
        }
        let cutoff = self.now() - Self::millis(older_than);
        let mut state = self.lock()?;
        let q = state.queue(job_type);
        let ids: Vec<String> = q
            .jobs
            .values()
            .filter(|r| r.status == status && r.finished_on.map_or(false, |f| f < cutoff))
            .map(|r| r.id.clone())
            .collect();
        for id in &ids {
            q.forget(id);
        }
        Ok(ids)
    }

    async fn counts(&self, job_type: JobType) -> Result<QueueCounts> {
        let mut state = self.lock()?;
        let q = state.queue(job_type);
        let mut counts = QueueCounts {
            paused: q.paused,
            ..QueueCounts::default()
        };
        for record in q.jobs.values() {
            match record.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Delayed => counts.delayed += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Removed => {}
            }
        }
        Ok(counts)
    }

    async fn fetch_next(
        &self,
        job_type: JobType,
        lock_ttl: Duration,
    ) -> Result<Option<JobRecord>> {
        let now = self.now();
        let mut events = Vec::new();
        let taken = {
            let mut state = self.lock()?;
            let q = state.queue(job_type);
            q.promote_due(now, &mut events);

            if q.paused {
                None
            } else if let Some(id) = q.next_waiting() {
                q.order.remove(&id);
                q.locks.insert(id.clone(), now + Self::millis(lock_ttl));
                q.jobs.get_mut(&id).map(|record| {
                    record.activate(now, new_lock_token());
                    record.clone()
                })
            } else {
                None
            }
        };
        if let Some(record) = &taken {
            events.push(JobEvent::Active {
                job_type,
                job_id: record.id.clone(),
                attempt: record.attempts_made + 1,
            });
        }
        self.emit(events);
        Ok(taken)
    }

    async fn extend_lock(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        lock_ttl: Duration,
    ) -> Result<bool> {
        let expiry = self.now() + Self::millis(lock_ttl);
        let mut state = self.lock()?;
        let q = state.queue(job_type);
        let held = q.jobs.get(id).map_or(false, |r| r.is_held_by(token));
        match q.locks.get_mut(id) {
            Some(lock) if held => {
                *lock = expiry;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        progress: u8,
    ) -> Result<()> {
        let progress = progress.min(100);
        {
            let mut state = self.lock()?;
            state.queue(job_type).held(id, token)?.progress = progress;
        }
        self.emit(vec![JobEvent::Progress {
            job_type,
            job_id: id.to_string(),
            progress,
        }]);
        Ok(())
    }

    async fn complete(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        result: Option<serde_json::Value>,
    ) -> Result<JobRecord> {
        let now = self.now();
        let record = {
            let mut state = self.lock()?;
            let q = state.queue(job_type);
            let record = q.held(id, token)?;
            record.settle_success(result.clone(), now);
            let record = record.clone();
            q.locks.remove(id);
            if record.settings.remove_on_complete {
                q.forget(id);
            }
            record
        };
        self.emit(vec![JobEvent::Completed {
            job_type,
            job_id: id.to_string(),
            result,
        }]);
        Ok(record)
    }

    async fn fail(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<JobRecord> {
        let now = self.now();
        let (record, outcome) = {
            let mut state = self.lock()?;
            let q = state.queue(job_type);
            let record = q.held(id, token)?;
            let outcome = record.settle_failure(reason, retryable, now);
            let record = record.clone();
            q.locks.remove(id);
            if outcome == FailureOutcome::Exhausted && record.settings.remove_on_fail {
                q.forget(id);
            }
            (record, outcome)
        };
        self.emit(vec![JobEvent::Failed {
            job_type,
            job_id: id.to_string(),
            reason: reason.to_string(),
            will_retry: matches!(outcome, FailureOutcome::Retry { .. }),
        }]);
        Ok(record)
    }

    async fn recover_stalled(&self, job_type: JobType) -> Result<Vec<String>> {
        let now = self.now();
        let mut events = Vec::new();
        let stalled = {
            let mut state = self.lock()?;
            let q = state.queue(job_type);
            let expired: Vec<String> = q
                .locks
                .iter()
                .filter(|(_, expiry)| **expiry < now)
                .map(|(id, _)| id.clone())
                .collect();

            for id in &expired {
                q.locks.remove(id);
                let Some(record) = q.jobs.get_mut(id) else {
                    continue;
                };
                events.push(JobEvent::Stalled {
                    job_type,
                    job_id: id.clone(),
                });
                if record.settle_stall(STALLED_REASON, now) {
                    q.mark_waiting(id);
                } else {
                    events.push(JobEvent::Failed {
                        job_type,
                        job_id: id.clone(),
                        reason: STALLED_REASON.to_string(),
                        will_retry: false,
                    });
                    if record.settings.remove_on_fail {
                        q.forget(id);
                    }
                }
            }
            expired
        };
        self.emit(events);
        Ok(stalled)
    }

    async fn add_repeatable(&self, spec: RepeatSpec) -> Result<bool> {
        let mut state = self.lock()?;
        let q = state.queue(spec.job_type);
        if q.repeats.contains_key(&spec.key) {
            return Ok(false);
        }
        q.repeats.insert(spec.key.clone(), spec);
        Ok(true)
    }

    async fn list_repeatables(&self, job_type: JobType) -> Result<Vec<RepeatSpec>> {
        let mut state = self.lock()?;
        Ok(state.queue(job_type).repeats.values().cloned().collect())
    }

    async fn remove_repeatable(&self, job_type: JobType, key: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state.queue(job_type).repeats.remove(key).is_some())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| JobError::Backend("Lock poisoned".to_string()))?;
        state.closed = true;
        Ok(())
    }
}
