use crate::backend::JobBackend;
use crate::error::{JobError, Result};
use crate::job::JobType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Context passed to job execution
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_type: JobType,
    /// 1-based number of the attempt being executed
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    lock_token: String,
    span: tracing::Span,
    backend: Arc<dyn JobBackend>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: String,
        job_type: JobType,
        attempt: u32,
        created_at: DateTime<Utc>,
        lock_token: String,
        span: tracing::Span,
        backend: Arc<dyn JobBackend>,
    ) -> Self {
        Self {
            job_id,
            job_type,
            attempt,
            created_at,
            lock_token,
            span,
            backend,
        }
    }

    /// Report progress (0-100) for the job this context belongs to.
    /// Fails with `LockMismatch` once the job was reclaimed from this worker.
    pub async fn update_progress(&self, percent: u8) -> Result<()> {
        self.backend
            .update_progress(self.job_type, &self.job_id, &self.lock_token, percent)
            .await
    }

    /// Span scoped to this job; enter it or use `tracing::Instrument`
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// A job that can be executed
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// The job type this processor handles
    const TYPE: JobType;

    /// The data required by the job
    type Data: Serialize + DeserializeOwned + Send + Sync + Debug;

    /// Execute the job. The returned value is stored as the job result.
    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<serde_json::Value>;
}

/// A type-erased job handler
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, data: serde_json::Value) -> Result<serde_json::Value>;
}

#[async_trait]
impl<J: Job> JobHandler for J {
    async fn handle(&self, ctx: JobContext, data: serde_json::Value) -> Result<serde_json::Value> {
        let data: J::Data = serde_json::from_value(data)?;
        self.execute(ctx, data).await
    }
}

/// Processor lookup table, one handler per job type
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed job processor for `J::TYPE`
    pub fn register<J: Job>(&mut self, job: J) -> &mut Self {
        self.handlers.insert(J::TYPE, Arc::new(job));
        self
    }

    /// Register a type-erased handler
    pub fn register_handler(
        &mut self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(&job_type)
            .cloned()
            .ok_or(JobError::NoProcessor(job_type))
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Fail unless every type in `served` has a handler
    pub fn ensure_covers(&self, served: &[JobType]) -> Result<()> {
        let mut missing: Vec<JobType> = served
            .iter()
            .copied()
            .filter(|t| !self.contains(*t))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        missing.dedup();
        Err(JobError::MissingProcessors(missing))
    }
}

impl Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("ProcessorRegistry")
            .field("types", &types)
            .finish()
    }
}
