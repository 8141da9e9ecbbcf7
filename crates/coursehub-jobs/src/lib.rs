//! Background job processing for CourseHub
//!
//! Typed, prioritized, retryable jobs on a durable queue backend.
//!
//! - [`JobCoordinator`] is the per-process entry point for submitting and
//!   managing jobs; [`JobClient`] layers id-based tracking and listeners on
//!   top of it.
//! - [`WorkerPool`] pulls jobs from the same backend, runs the registered
//!   [`Job`] processor for each one and scales its concurrency with demand.
//! - [`JobBackend`] is the storage seam: [`InMemoryBackend`] for tests and
//!   development, `RedisBackend` behind the `redis` feature.
//!
//! ```ignore
//! use coursehub_jobs::{CoordinatorConfig, InMemoryBackend, JobClient, JobCoordinator, JobType, SubmitOptions};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let coordinator = Arc::new(JobCoordinator::new(backend));
//! coordinator.initialize(CoordinatorConfig::default()).await?;
//!
//! let client = JobClient::new(coordinator);
//! let id = client
//!     .submit(JobType::Email, SubmitOptions::new(serde_json::json!({ "to": "ada@example.com" })))
//!     .await?;
//! ```

pub mod backend;
pub mod client;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod processor;
pub mod queue;
pub mod schedule;
pub mod worker;

pub use backend::memory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;
pub use backend::JobBackend;
pub use client::{JobClient, JobStatusView, SubmitOptions, SubscriptionId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::JobsConfig;
pub use coordinator::{CoordinatorConfig, JobCoordinator};
pub use error::{JobError, Result};
pub use job::{
    Backoff, JobEvent, JobFilter, JobOptions, JobPriority, JobRecord, JobSettings, JobStatus,
    JobType, QueueCounts, QueueMetrics, RepeatSpec,
};
pub use processor::{Job, JobContext, JobHandler, ProcessorRegistry};
pub use queue::{QueueManager, QueueManagerConfig};
pub use schedule::CronSchedule;
pub use worker::{
    ShutdownOutcome, WorkerConfig, WorkerMetrics, WorkerPool, WorkerPoolBuilder, WorkerState,
};
