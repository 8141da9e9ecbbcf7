use super::{new_lock_token, JobBackend, EVENT_CHANNEL_CAPACITY, STALLED_REASON};
use crate::error::{JobError, Result};
use crate::job::{
    FailureOutcome, JobEvent, JobFilter, JobRecord, JobStatus, JobType, QueueCounts, RepeatSpec,
};
use crate::schedule::CronSchedule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Redis-backed job queue.
///
/// Layout per queue (`{prefix}:{queue}:...`):
/// - `jobs`: hash of id -> JSON record
/// - `wait`: zset scored by priority then submission order
/// - `delayed`: zset scored by run-at millis
/// - `active`: zset scored by lock expiry millis
/// - `locks`: hash of id -> lock token of the current holder
/// - `completed` / `failed`: zsets scored by finish millis
/// - `paused`: flag key
/// - `repeat`: hash of key -> JSON recurring registration
///
/// Lifecycle events go through the `{prefix}:events` pub/sub channel so
/// every process sees every transition.
pub struct RedisBackend {
    client: Client,
    conn: MultiplexedConnection,
    prefix: String,
    pop_script: Script,
    extend_script: Script,
    progress_script: Script,
    settle_script: Script,
    events: broadcast::Sender<JobEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Spacing between priority bands in the wait set score
const PRIORITY_BAND: f64 = 1e12;

impl RedisBackend {
    /// Connect and start relaying pub/sub events
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| JobError::Config(e.to_string()))?;
        let conn = client.get_multiplexed_async_connection().await?;

        // Take the head of the wait set and move it into the active set
        // under a new lock token in one step, unless the queue is paused.
        // KEYS: wait, active, paused, locks   ARGV: lock expiry millis, token
        let pop_script = Script::new(
            r#"
            if redis.call('EXISTS', KEYS[3]) == 1 then
                return false
            end
            local ids = redis.call('ZRANGE', KEYS[1], 0, 0)
            if #ids == 0 then
                return false
            end
            redis.call('ZREM', KEYS[1], ids[1])
            redis.call('ZADD', KEYS[2], ARGV[1], ids[1])
            redis.call('HSET', KEYS[4], ids[1], ARGV[2])
            return ids[1]
        "#,
        );

        // KEYS: active, locks   ARGV: id, token, lock expiry millis
        let extend_script = Script::new(
            r#"
            if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
                return 0
            end
            redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
            return 1
        "#,
        );

        // KEYS: locks, jobs   ARGV: id, token, record json
        let progress_script = Script::new(
            r#"
            if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
            return 1
        "#,
        );

        // Release the lock and file the settled record, only if `token`
        // still holds it. An empty record json deletes the job.
        // KEYS: active, locks, jobs, target set
        // ARGV: id, token, record json, target score
        let settle_script = Script::new(
            r#"
            if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('ZREM', KEYS[1], ARGV[1])
            redis.call('HDEL', KEYS[2], ARGV[1])
            if ARGV[3] == '' then
                redis.call('HDEL', KEYS[3], ARGV[1])
            else
                redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
                redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
            end
            return 1
        "#,
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let backend = Self {
            client,
            conn,
            prefix: prefix.to_string(),
            pop_script,
            extend_script,
            progress_script,
            settle_script,
            events,
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        backend.start_listener().await?;
        Ok(backend)
    }

    async fn start_listener(&self) -> Result<()> {
        #[allow(deprecated)]
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(self.events_channel()).await?;

        let sender = self.events.clone();
        let handle = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unreadable job event");
                        continue;
                    }
                };
                match serde_json::from_str::<JobEvent>(&payload) {
                    Ok(event) => {
                        let _ = sender.send(event);
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping malformed job event"),
                }
            }
            tracing::debug!("Job event subscription ended");
        });

        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    fn events_channel(&self) -> String {
        format!("{}:events", self.prefix)
    }

    fn key(&self, job_type: JobType, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, job_type.queue_name(), suffix)
    }

    fn status_key(&self, job_type: JobType, status: JobStatus) -> Option<String> {
        let suffix = match status {
            JobStatus::Waiting => "wait",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Removed => return None,
        };
        Some(self.key(job_type, suffix))
    }

    fn conn(&self) -> Result<MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobError::Backend("backend closed".to_string()));
        }
        Ok(self.conn.clone())
    }

    async fn publish(&self, conn: &mut MultiplexedConnection, event: &JobEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let _: i64 = conn.publish(self.events_channel(), payload).await?;
        Ok(())
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
        id: &str,
    ) -> Result<Option<JobRecord>> {
        let raw: Option<String> = conn.hget(self.key(job_type, "jobs"), id).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(JobError::from))
            .transpose()
    }

    async fn store(&self, conn: &mut MultiplexedConnection, record: &JobRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let _: i64 = conn
            .hset(self.key(record.job_type, "jobs"), &record.id, payload)
            .await?;
        Ok(())
    }

    /// Wait-set score: higher priority first, then submission order
    async fn wait_score(&self, conn: &mut MultiplexedConnection, record: &JobRecord) -> Result<f64> {
        let seq: i64 = conn.incr(self.key(record.job_type, "seq"), 1).await?;
        let band = (3 - record.settings.priority.rank()) as f64;
        Ok(band * PRIORITY_BAND + seq as f64)
    }

    async fn push_waiting(&self, conn: &mut MultiplexedConnection, record: &JobRecord) -> Result<()> {
        let score = self.wait_score(conn, record).await?;
        let _: i64 = conn
            .zadd(self.key(record.job_type, "wait"), &record.id, score)
            .await?;
        Ok(())
    }

    async fn unindex(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
        id: &str,
    ) -> Result<()> {
        for suffix in ["wait", "delayed", "active", "completed", "failed"] {
            let _: i64 = conn.zrem(self.key(job_type, suffix), id).await?;
        }
        let _: i64 = conn.hdel(self.key(job_type, "locks"), id).await?;
        Ok(())
    }

    async fn delete(&self, conn: &mut MultiplexedConnection, job_type: JobType, id: &str) -> Result<bool> {
        self.unindex(conn, job_type, id).await?;
        let removed: i64 = conn.hdel(self.key(job_type, "jobs"), id).await?;
        Ok(removed > 0)
    }

    /// Move due delayed jobs and due recurring occurrences into the wait set
    async fn promote_due(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let delayed_key = self.key(job_type, "delayed");
        let due: Vec<String> = conn
            .zrangebyscore(&delayed_key, "-inf", now.timestamp_millis())
            .await?;
        for id in due {
            // Whoever removes it from the delayed set owns the promotion
            let won: i64 = conn.zrem(&delayed_key, &id).await?;
            if won == 0 {
                continue;
            }
            if let Some(mut record) = self.load(conn, job_type, &id).await? {
                record.status = JobStatus::Waiting;
                self.store(conn, &record).await?;
                self.push_waiting(conn, &record).await?;
                self.publish(
                    conn,
                    &JobEvent::Waiting {
                        job_type,
                        job_id: id.clone(),
                    },
                )
                .await?;
            }
        }

        let repeat_key = self.key(job_type, "repeat");
        let specs: Vec<String> = conn.hvals(&repeat_key).await?;
        for raw in specs {
            let mut spec: RepeatSpec = serde_json::from_str(&raw)?;
            if spec.next_run > now {
                continue;
            }
            let occurrence = spec.occurrence(spec.next_run, now);
            let created: bool = conn
                .hset_nx(
                    self.key(job_type, "jobs"),
                    &occurrence.id,
                    serde_json::to_string(&occurrence)?,
                )
                .await?;
            if created {
                self.push_waiting(conn, &occurrence).await?;
                self.publish(
                    conn,
                    &JobEvent::Waiting {
                        job_type,
                        job_id: occurrence.id.clone(),
                    },
                )
                .await?;
            }

            match CronSchedule::parse(&spec.cron)
                .ok()
                .and_then(|s| s.next_after(now))
            {
                Some(next) => {
                    spec.next_run = next;
                    let _: i64 = conn
                        .hset(&repeat_key, &spec.key, serde_json::to_string(&spec)?)
                        .await?;
                }
                None => {
                    tracing::warn!(repeat_key = %spec.key, "Recurring job has no further occurrences, dropping it");
                    let _: i64 = conn.hdel(&repeat_key, &spec.key).await?;
                }
            }
        }
        Ok(())
    }

    /// Load an active job and check that `token` holds it
    async fn load_held(
        &self,
        conn: &mut MultiplexedConnection,
        job_type: JobType,
        id: &str,
        token: &str,
    ) -> Result<JobRecord> {
        let record = self
            .load(conn, job_type, id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        if record.status != JobStatus::Active {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }
        if !record.is_held_by(token) {
            return Err(JobError::LockMismatch { id: id.to_string() });
        }
        Ok(record)
    }

    /// Atomically release the lock and file `record` into `target` (or
    /// delete it when `target` is `None`). Fails if the lock changed hands
    /// since `load_held`.
    async fn settle(
        &self,
        conn: &mut MultiplexedConnection,
        record: &JobRecord,
        token: &str,
        target: Option<(&str, i64)>,
    ) -> Result<()> {
        let job_type = record.job_type;
        let (payload, set, score) = match target {
            Some((suffix, score)) => (
                serde_json::to_string(record)?,
                self.key(job_type, suffix),
                score,
            ),
            None => (String::new(), self.key(job_type, "completed"), 0),
        };
        let settled: i64 = self
            .settle_script
            .key(self.key(job_type, "active"))
            .key(self.key(job_type, "locks"))
            .key(self.key(job_type, "jobs"))
            .key(set)
            .arg(&record.id)
            .arg(token)
            .arg(payload)
            .arg(score)
            .invoke_async(conn)
            .await?;
        if settled == 0 {
            return Err(JobError::LockMismatch {
                id: record.id.clone(),
            });
        }
        Ok(())
    }

    fn millis(d: Duration) -> i64 {
        d.as_millis() as i64
    }
}

#[async_trait]
impl JobBackend for RedisBackend {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn add(&self, record: JobRecord) -> Result<JobRecord> {
        let mut conn = self.conn()?;
        let created: bool = conn
            .hset_nx(
                self.key(record.job_type, "jobs"),
                &record.id,
                serde_json::to_string(&record)?,
            )
            .await?;
        if !created {
            return self
                .load(&mut conn, record.job_type, &record.id)
                .await?
                .ok_or_else(|| JobError::JobNotFound(record.id.clone()));
        }

        let event = if record.status == JobStatus::Delayed {
            let _: i64 = conn
                .zadd(
                    self.key(record.job_type, "delayed"),
                    &record.id,
                    record.run_at.timestamp_millis(),
                )
                .await?;
            JobEvent::Delayed {
                job_type: record.job_type,
                job_id: record.id.clone(),
                run_at: record.run_at,
            }
        } else {
            self.push_waiting(&mut conn, &record).await?;
            JobEvent::Waiting {
                job_type: record.job_type,
                job_id: record.id.clone(),
            }
        };
        self.publish(&mut conn, &event).await?;
        Ok(record)
    }

    async fn get(&self, job_type: JobType, id: &str) -> Result<Option<JobRecord>> {
        let mut conn = self.conn()?;
        self.load(&mut conn, job_type, id).await
    }

    async fn list(&self, job_type: JobType, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = conn.hvals(self.key(job_type, "jobs")).await?;
        let mut records = Vec::with_capacity(raw.len());
        for s in raw {
            let record: JobRecord = serde_json::from_str(&s)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn remove(&self, job_type: JobType, id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        if !self.delete(&mut conn, job_type, id).await? {
            return Err(JobError::JobNotFound(id.to_string()));
        }
        self.publish(
            &mut conn,
            &JobEvent::Removed {
                job_type,
                job_id: id.to_string(),
            },
        )
        .await
    }

    async fn retry(&self, job_type: JobType, id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let mut record = self
            .load(&mut conn, job_type, id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(id.to_string()))?;
        if record.status == JobStatus::Active {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                status: record.status,
            });
        }
        self.unindex(&mut conn, job_type, id).await?;
        record.reset_for_retry(Utc::now());
        self.store(&mut conn, &record).await?;
        self.push_waiting(&mut conn, &record).await?;
        self.publish(
            &mut conn,
            &JobEvent::Waiting {
                job_type,
                job_id: id.to_string(),
            },
        )
        .await
    }

    async fn pause(&self, job_type: JobType) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = conn.set(self.key(job_type, "paused"), 1).await?;
        Ok(())
    }

    async fn resume(&self, job_type: JobType) -> Result<()> {
        let mut conn = self.conn()?;
        let _: i64 = conn.del(self.key(job_type, "paused")).await?;
        Ok(())
    }

    async fn is_paused(&self, job_type: JobType) -> Result<bool> {
        let mut conn = self.conn()?;
        Ok(conn.exists(self.key(job_type, "paused")).await?)
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
        let Some(set) = self.status_key(job_type, status) else {
            return Ok(Vec::new());
        };
        let mut conn = self.conn()?;
        let cutoff = Utc::now().timestamp_millis() - Self::millis(older_than);
        let ids: Vec<String> = conn
            .zrangebyscore(&set, "-inf", format!("({}", cutoff))
            .await?;
        for id in &ids {
            let _: i64 = conn.zrem(&set, id).await?;
            let _: i64 = conn.hdel(self.key(job_type, "jobs"), id).await?;
        }
        Ok(ids)
    }

    async fn counts(&self, job_type: JobType) -> Result<QueueCounts> {
        let mut conn = self.conn()?;
        let (waiting, delayed, active, completed, failed, paused): (u64, u64, u64, u64, u64, bool) =
            redis::pipe()
                .zcard(self.key(job_type, "wait"))
                .zcard(self.key(job_type, "delayed"))
                .zcard(self.key(job_type, "active"))
                .zcard(self.key(job_type, "completed"))
                .zcard(self.key(job_type, "failed"))
                .exists(self.key(job_type, "paused"))
                .query_async(&mut conn)
                .await?;
        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
            paused,
        })
    }

    async fn fetch_next(
        &self,
        job_type: JobType,
        lock_ttl: Duration,
    ) -> Result<Option<JobRecord>> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        self.promote_due(&mut conn, job_type, now).await?;

        let expiry = now.timestamp_millis() + Self::millis(lock_ttl);
        let token = new_lock_token();
        let id: Option<String> = self
            .pop_script
            .key(self.key(job_type, "wait"))
            .key(self.key(job_type, "active"))
            .key(self.key(job_type, "paused"))
            .key(self.key(job_type, "locks"))
            .arg(expiry)
            .arg(&token)
            .invoke_async(&mut conn)
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };

        let Some(mut record) = self.load(&mut conn, job_type, &id).await? else {
            // Removed between scheduling and pickup
            self.unindex(&mut conn, job_type, &id).await?;
            return Ok(None);
        };
        record.activate(now, token);
        self.store(&mut conn, &record).await?;
        self.publish(
            &mut conn,
            &JobEvent::Active {
                job_type,
                job_id: id,
                attempt: record.attempts_made + 1,
            },
        )
        .await?;
        Ok(Some(record))
    }

    async fn extend_lock(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        lock_ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let expiry = Utc::now().timestamp_millis() + Self::millis(lock_ttl);
        let extended: i64 = self
            .extend_script
            .key(self.key(job_type, "active"))
            .key(self.key(job_type, "locks"))
            .arg(id)
            .arg(token)
            .arg(expiry)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn update_progress(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        progress: u8,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let progress = progress.min(100);
        let mut record = self.load_held(&mut conn, job_type, id, token).await?;
        record.progress = progress;
        let stored: i64 = self
            .progress_script
            .key(self.key(job_type, "locks"))
            .key(self.key(job_type, "jobs"))
            .arg(id)
            .arg(token)
            .arg(serde_json::to_string(&record)?)
            .invoke_async(&mut conn)
            .await?;
        if stored == 0 {
            return Err(JobError::LockMismatch { id: id.to_string() });
        }
        self.publish(
            &mut conn,
            &JobEvent::Progress {
                job_type,
                job_id: id.to_string(),
                progress,
            },
        )
        .await
    }

    async fn complete(
        &self,
        job_type: JobType,
        id: &str,
        token: &str,
        result: Option<serde_json::Value>,
    ) -> Result<JobRecord> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        let mut record = self.load_held(&mut conn, job_type, id, token).await?;
        record.settle_success(result.clone(), now);
        let target = if record.settings.remove_on_complete {
            None
        } else {
            Some(("completed", now.timestamp_millis()))
        };
        self.settle(&mut conn, &record, token, target).await?;
        self.publish(
            &mut conn,
            &JobEvent::Completed {
                job_type,
                job_id: id.to_string(),
                result,
            },
        )
        .await?;
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
        let mut conn = self.conn()?;
        let now = Utc::now();
        let mut record = self.load_held(&mut conn, job_type, id, token).await?;
        let outcome = record.settle_failure(reason, retryable, now);
        let target = match outcome {
            FailureOutcome::Retry { run_at } => Some(("delayed", run_at.timestamp_millis())),
            FailureOutcome::Exhausted if record.settings.remove_on_fail => None,
            FailureOutcome::Exhausted => Some(("failed", now.timestamp_millis())),
        };
        self.settle(&mut conn, &record, token, target).await?;
        self.publish(
            &mut conn,
            &JobEvent::Failed {
                job_type,
                job_id: id.to_string(),
                reason: reason.to_string(),
                will_retry: matches!(outcome, FailureOutcome::Retry { .. }),
            },
        )
        .await?;
        Ok(record)
    }

    async fn recover_stalled(&self, job_type: JobType) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        let active = self.key(job_type, "active");
        let expired: Vec<String> = conn
            .zrangebyscore(&active, "-inf", format!("({}", now.timestamp_millis()))
            .await?;

        let mut reclaimed = Vec::new();
        for id in expired {
            let won: i64 = conn.zrem(&active, &id).await?;
            if won == 0 {
                continue;
            }
            // Revoke the holder's token before the job can be fetched again
            let _: i64 = conn.hdel(self.key(job_type, "locks"), &id).await?;
            let Some(mut record) = self.load(&mut conn, job_type, &id).await? else {
                continue;
            };
            self.publish(
                &mut conn,
                &JobEvent::Stalled {
                    job_type,
                    job_id: id.clone(),
                },
            )
            .await?;

            if record.settle_stall(STALLED_REASON, now) {
                self.store(&mut conn, &record).await?;
                self.push_waiting(&mut conn, &record).await?;
            } else {
                if record.settings.remove_on_fail {
                    self.delete(&mut conn, job_type, &id).await?;
                } else {
                    self.store(&mut conn, &record).await?;
                    let _: i64 = conn
                        .zadd(self.key(job_type, "failed"), &id, now.timestamp_millis())
                        .await?;
                }
                self.publish(
                    &mut conn,
                    &JobEvent::Failed {
                        job_type,
                        job_id: id.clone(),
                        reason: STALLED_REASON.to_string(),
                        will_retry: false,
                    },
                )
                .await?;
            }
            reclaimed.push(id);
        }
        Ok(reclaimed)
    }

    async fn add_repeatable(&self, spec: RepeatSpec) -> Result<bool> {
        let mut conn = self.conn()?;
        let created: bool = conn
            .hset_nx(
                self.key(spec.job_type, "repeat"),
                &spec.key,
                serde_json::to_string(&spec)?,
            )
            .await?;
        Ok(created)
    }

    async fn list_repeatables(&self, job_type: JobType) -> Result<Vec<RepeatSpec>> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = conn.hvals(self.key(job_type, "repeat")).await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(JobError::from))
            .collect()
    }

    async fn remove_repeatable(&self, job_type: JobType, key: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.hdel(self.key(job_type, "repeat"), key).await?;
        Ok(removed > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
        Ok(())
    }
}
