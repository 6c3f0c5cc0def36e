//! Durable job queue backed by the shared coordination store.
//!
//! Jobs are rows in `sync_jobs`; every state transition is one SQL statement,
//! so the queue survives process crashes and is shared by every worker in the
//! fleet.
//!
//! # Delivery semantics
//!
//! **At-least-once.** A claimed job carries a lease (`lease_expires_at`); a
//! worker that dies before acking leaves the lease to expire, after which
//! [`JobQueue::reclaim_stalled`] returns the job to the waiting state for
//! redelivery. Duplicates are tolerated because the inventory upsert is
//! idempotent.
//!
//! # Claim ordering
//!
//! Dequeue claims atomically with `FOR UPDATE SKIP LOCKED` so concurrent
//! workers never double-claim: highest priority first, then oldest
//! `created_at`. Delayed jobs become eligible once their `next_run_at`
//! passes.
//!
//! # Retry policy
//!
//! Retriable failures re-enqueue the job as `delayed` with exponential
//! backoff (see [`backoff::BackoffSchedule`]); non-retriable failures and
//! exhausted attempts mark it `failed`. Terminal jobs are kept for a
//! retention window (completed: 24 h or the last 1 000, whichever larger;
//! failed: 7 days) and then swept.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::types::{CanonicalRecord, JobId};

pub mod backoff;
pub mod rate;

pub use backoff::BackoffSchedule;
pub use rate::FleetRateLimiter;

/// The lifecycle state of a job. A job is in exactly one state at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for claim.
    Waiting,
    /// Claimed by a worker, lease running.
    Active,
    /// Waiting out a retry backoff; eligible once `next_run_at` passes.
    Delayed,
    /// Finished successfully.
    Completed,
    /// Finished terminally without success.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Errors from queue operations. All of them mean the coordination store is
/// misbehaving; callers surface them as `QueueUnavailable`.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("job payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration for queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum attempts before a retriable failure becomes terminal.
    pub max_attempts: u32,

    /// Retry backoff schedule.
    pub backoff: BackoffSchedule,

    /// Lease duration for an active job; a worker crash makes the job
    /// eligible again after this long.
    pub stall_timeout: std::time::Duration,

    /// Completed jobs older than this are sweep candidates.
    pub completed_retention: chrono::Duration,

    /// Completed jobs among the newest N survive the sweep regardless of age.
    pub completed_keep_last: i64,

    /// Failed jobs are kept this long.
    pub failed_retention: chrono::Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_attempts: 5,
            backoff: BackoffSchedule::DEFAULT,
            stall_timeout: std::time::Duration::from_secs(60),
            completed_retention: chrono::Duration::hours(24),
            completed_keep_last: 1_000,
            failed_retention: chrono::Duration::days(7),
        }
    }
}

/// A job claimed by a worker. `attempts_made` already includes this attempt.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub id: i64,
    pub job_id: JobId,
    pub payload: Value,
    pub priority: i32,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl ActiveJob {
    /// Deserializes the payload back into a canonical record.
    ///
    /// Failure here means the stored payload is corrupt; the worker treats
    /// that as a permanent failure, not a retry.
    pub fn record(&self) -> Result<CanonicalRecord, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// True if another retriable failure would still leave attempts.
    pub fn attempts_remaining(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-enqueued as delayed; eligible again after the given backoff.
    Retrying { delay: std::time::Duration },
    /// Terminally failed; kept for the failed-retention window.
    Terminal,
}

/// Queue depth counters, surfaced through `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Debug, FromRow)]
struct DbJobRow {
    id: i64,
    job_id: String,
    payload: Value,
    priority: i32,
    attempts_made: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
}

impl DbJobRow {
    fn into_active(self) -> ActiveJob {
        ActiveJob {
            id: self.id,
            job_id: JobId::new(self.job_id),
            payload: self.payload,
            priority: self.priority,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
        }
    }
}

/// The durable job queue.
///
/// Cheap to clone; all clones share one pool and configuration.
#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        JobQueue { pool, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns a dispatch rate limiter backed by this queue's coordination
    /// store. The budget it enforces is shared by the whole fleet, not by
    /// this process alone.
    pub fn rate_limiter(&self, per_sec: u32) -> FleetRateLimiter {
        FleetRateLimiter::new(self.pool.clone(), per_sec)
    }

    /// Enqueues one record and returns its job id.
    #[instrument(skip(self, record), fields(product_id = %record.product_id, source = %record.source))]
    pub async fn enqueue(&self, record: &CanonicalRecord, priority: i32) -> Result<JobId, QueueError> {
        let nanos = created_nanos();
        let job_id = JobId::generate(record.source, &record.product_id, nanos, None);
        let payload = serde_json::to_value(record)?;

        sqlx::query(
            r#"
            INSERT INTO sync_jobs (job_id, product_id, source, payload, priority, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job_id.as_str())
        .bind(record.product_id.as_str())
        .bind(record.source.as_str())
        .bind(&payload)
        .bind(priority)
        .bind(self.config.max_attempts as i32)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job_id, "Job enqueued");
        Ok(job_id)
    }

    /// Enqueues many records atomically (all or none).
    ///
    /// Batch entries share the same creation nanos; the per-entry sequence
    /// number keeps their job ids unique.
    pub async fn add_batch(
        &self,
        records: &[CanonicalRecord],
        priority: i32,
    ) -> Result<Vec<JobId>, QueueError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let nanos = created_nanos();
        let mut tx = self.pool.begin().await?;
        let mut job_ids = Vec::with_capacity(records.len());

        for (seq, record) in records.iter().enumerate() {
            let job_id = JobId::generate(record.source, &record.product_id, nanos, Some(seq as u32));
            let payload = serde_json::to_value(record)?;

            sqlx::query(
                r#"
                INSERT INTO sync_jobs (job_id, product_id, source, payload, priority, max_attempts)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(job_id.as_str())
            .bind(record.product_id.as_str())
            .bind(record.source.as_str())
            .bind(&payload)
            .bind(priority)
            .bind(self.config.max_attempts as i32)
            .execute(&mut *tx)
            .await?;

            job_ids.push(job_id);
        }

        tx.commit().await?;

        info!(count = job_ids.len(), "Batch enqueued");
        Ok(job_ids)
    }

    /// Claims the next eligible job, if any.
    ///
    /// The claim is atomic across the fleet: `FOR UPDATE SKIP LOCKED` means
    /// two concurrent dequeues never observe the same row. The claimed job's
    /// attempt counter is incremented here, and its lease starts now.
    pub async fn dequeue(&self) -> Result<Option<ActiveJob>, QueueError> {
        let row = sqlx::query_as::<_, DbJobRow>(
            r#"
            UPDATE sync_jobs
            SET state = 'active',
                attempts_made = attempts_made + 1,
                lease_expires_at = now() + ($1::bigint * interval '1 millisecond')
            WHERE id = (
                SELECT id FROM sync_jobs
                WHERE state IN ('waiting', 'delayed')
                  AND next_run_at <= now()
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, job_id, payload, priority, attempts_made, max_attempts, created_at
            "#,
        )
        .bind(self.config.stall_timeout.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DbJobRow::into_active))
    }

    /// Acknowledges a job as completed.
    pub async fn complete(&self, job: &ActiveJob) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = 'completed', finished_at = now(), lease_expires_at = NULL, last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.job_id, attempts = job.attempts_made, "Job completed");
        Ok(())
    }

    /// Records a failure.
    ///
    /// Retriable failures with attempts remaining re-enqueue the job as
    /// `delayed` with exponential backoff; everything else is terminal.
    pub async fn fail(
        &self,
        job: &ActiveJob,
        error: &str,
        retriable: bool,
    ) -> Result<FailOutcome, QueueError> {
        if retriable && job.attempts_remaining() {
            let delay = self.config.backoff.delay_after_attempt(job.attempts_made.max(0) as u32);

            sqlx::query(
                r#"
                UPDATE sync_jobs
                SET state = 'delayed',
                    next_run_at = now() + ($2::bigint * interval '1 millisecond'),
                    lease_expires_at = NULL,
                    last_error = $3
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(delay.as_millis() as i64)
            .bind(error)
            .execute(&self.pool)
            .await?;

            debug!(
                job_id = %job.job_id,
                attempt = job.attempts_made,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job scheduled for retry"
            );
            Ok(FailOutcome::Retrying { delay })
        } else {
            sqlx::query(
                r#"
                UPDATE sync_jobs
                SET state = 'failed', finished_at = now(), lease_expires_at = NULL, last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(error)
            .execute(&self.pool)
            .await?;

            warn!(
                job_id = %job.job_id,
                attempts = job.attempts_made,
                error = %error,
                "Job failed terminally"
            );
            Ok(FailOutcome::Terminal)
        }
    }

    /// Returns active jobs with expired leases to the waiting state.
    ///
    /// This is the at-least-once half of the delivery guarantee: a worker
    /// crash between claim and ack costs one stall timeout, never the job.
    pub async fn reclaim_stalled(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = 'waiting', lease_expires_at = NULL
            WHERE state = 'active' AND lease_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            info!(count = reclaimed, "Reclaimed stalled jobs");
        }
        Ok(reclaimed)
    }

    /// Deletes terminal jobs past their retention window.
    ///
    /// Completed jobs survive while they are younger than the retention
    /// window *or* among the newest `completed_keep_last`. Failed jobs are
    /// kept for the full failed-retention window.
    pub async fn sweep_retention(&self) -> Result<u64, QueueError> {
        let completed = sqlx::query(
            r#"
            DELETE FROM sync_jobs
            WHERE state = 'completed'
              AND finished_at < now() - ($1::bigint * interval '1 second')
              AND id NOT IN (
                  SELECT id FROM sync_jobs
                  WHERE state = 'completed'
                  ORDER BY finished_at DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(self.config.completed_retention.num_seconds())
        .bind(self.config.completed_keep_last)
        .execute(&self.pool)
        .await?;

        let failed = sqlx::query(
            r#"
            DELETE FROM sync_jobs
            WHERE state = 'failed'
              AND finished_at < now() - ($1::bigint * interval '1 second')
            "#,
        )
        .bind(self.config.failed_retention.num_seconds())
        .execute(&self.pool)
        .await?;

        let swept = completed.rows_affected() + failed.rows_affected();
        if swept > 0 {
            debug!(count = swept, "Swept expired terminal jobs");
        }
        Ok(swept)
    }

    /// Returns queue depth counters.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM sync_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            match state.as_str() {
                "waiting" => stats.waiting = count,
                "active" => stats.active = count,
                "delayed" => stats.delayed = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                other => warn!(state = %other, "Unknown job state in queue table"),
            }
            stats.total += count;
        }
        Ok(stats)
    }
}

/// Runs the queue's periodic maintenance (stall reclaim + retention sweep)
/// until cancelled. Failures are logged and retried next tick.
pub async fn maintenance_loop(
    queue: JobQueue,
    interval: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Queue maintenance stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = queue.reclaim_stalled().await {
                    warn!(error = %e, "Stall reclaim failed");
                }
                if let Err(e) = queue.sweep_retention().await {
                    warn!(error = %e, "Retention sweep failed");
                }
            }
        }
    }
}

fn created_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_else(|| {
        // Past the year 2262 the nanosecond timestamp overflows; fall back to
        // millisecond precision rather than panicking.
        Utc::now().timestamp_millis()
    })
}
