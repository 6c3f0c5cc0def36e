//! Job workers: the consumer side of the pipeline.
//!
//! A [`WorkerPool`] runs a fixed number of concurrent worker tasks. Each task
//! loops: claim a job from the queue, validate its payload, take the
//! per-product lock, run the repository upsert inside the lock, then ack or
//! fail the job.
//!
//! # Failure routing
//!
//! | Failure | Handling |
//! |---|---|
//! | Corrupt/invalid payload | permanent fail, no retry |
//! | Lock unavailable | retriable, back to the queue with backoff |
//! | Transient storage error | retriable, back to the queue with backoff |
//! | Permanent storage error | permanent fail |
//!
//! # Locking discipline
//!
//! The distributed lock is acquired *before* the upsert transaction opens and
//! released *after* it commits. Workers never nest locks: one job, one
//! product, one lock.
//!
//! # Rate limiting
//!
//! The dispatch cap is fleet-wide, and worker processes share no memory, so
//! each claim first takes a token from the shared budget in the coordination
//! store (see [`crate::queue::FleetRateLimiter`]). Running more processes
//! does not raise the cap.
//!
//! # Shutdown
//!
//! On cancellation, workers stop claiming new jobs and let in-flight jobs run
//! to completion. A job interrupted by a hard kill is redelivered after its
//! lease expires - at-least-once, by construction.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::lock::{LockError, LockManager};
use crate::queue::{ActiveJob, FailOutcome, FleetRateLimiter, JobQueue, QueueError};
use crate::repo::Repository;
use crate::types::CanonicalRecord;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs processed in parallel by this process.
    pub concurrency: usize,

    /// Sleep between dequeue attempts when the queue is empty.
    pub idle_sleep: Duration,

    /// Maximum dispatches per second across the whole fleet, enforced
    /// through the coordination store.
    pub rate_limit_per_sec: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            concurrency: 5,
            idle_sleep: Duration::from_millis(500),
            rate_limit_per_sec: 100,
        }
    }
}

/// What a worker did with one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Upsert committed; job acked.
    Completed { product_id: String, quantity: i64 },
    /// Retriable failure; job re-enqueued with backoff.
    RetryScheduled,
    /// Non-retriable failure; job terminally failed.
    FailedPermanently,
}

/// A pool of concurrent job workers sharing one queue, repository, and lock
/// manager.
pub struct WorkerPool {
    queue: JobQueue,
    repository: Repository,
    locks: LockManager,
    config: WorkerConfig,
    limiter: FleetRateLimiter,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        repository: Repository,
        locks: LockManager,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(WorkerPool {
            limiter: queue.rate_limiter(config.rate_limit_per_sec),
            queue,
            repository,
            locks,
            config,
        })
    }

    /// Runs the pool until cancelled, then drains in-flight jobs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "Worker pool started");

        let mut tasks = JoinSet::new();
        for worker_index in 0..self.config.concurrency {
            let pool = Arc::clone(&self);
            let token = shutdown.clone();
            tasks.spawn(async move {
                pool.worker_loop(worker_index, token).await;
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }

        info!("Worker pool stopped");
    }

    /// One worker task: claim, process, repeat.
    async fn worker_loop(&self, worker_index: usize, shutdown: CancellationToken) {
        debug!(worker = worker_index, "Worker started");

        loop {
            // Take a fleet dispatch token before claiming. Stop as soon as
            // shutdown is requested; in-flight work below is never
            // interrupted mid-job.
            tokio::select! {
                _ = shutdown.cancelled() => break,
                granted = self.limiter.acquire() => {
                    if let Err(e) = granted {
                        warn!(worker = worker_index, error = %e, "Rate limiter unavailable");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.config.idle_sleep) => {}
                        }
                        continue;
                    }
                }
            }

            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process_job(&job).await {
                        // Queue bookkeeping failed; the lease will expire and
                        // the job will be redelivered.
                        error!(job_id = %job.job_id, error = %e, "Failed to record job outcome");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_sleep) => {}
                    }
                }
                Err(e) => {
                    warn!(worker = worker_index, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_sleep) => {}
                    }
                }
            }
        }

        debug!(worker = worker_index, "Worker stopped");
    }

    /// Processes one claimed job end to end.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, attempt = job.attempts_made))]
    pub async fn process_job(&self, job: &ActiveJob) -> Result<ProcessOutcome, QueueError> {
        // Step 1: validate the payload against the canonical schema. A
        // corrupt payload can never succeed, so it fails permanently.
        let record = match decode_and_validate(job) {
            Ok(record) => record,
            Err(reason) => {
                warn!(error = %reason, "Invalid job payload, failing permanently");
                self.queue.fail(job, &reason, false).await?;
                return Ok(ProcessOutcome::FailedPermanently);
            }
        };

        // Step 2: take the per-product lock and upsert inside it.
        let locked = self
            .locks
            .with_lock(&record.product_id, || self.repository.upsert(&record))
            .await;

        match locked {
            Ok(Ok(row)) => {
                self.queue.complete(job).await?;
                info!(
                    product_id = %row.product_id,
                    quantity = row.quantity,
                    source = %row.source,
                    "Inventory updated"
                );
                Ok(ProcessOutcome::Completed {
                    product_id: row.product_id,
                    quantity: row.quantity,
                })
            }
            Ok(Err(storage_err)) => {
                let retriable = storage_err.is_retriable();
                let outcome = self
                    .queue
                    .fail(job, &storage_err.to_string(), retriable)
                    .await?;
                Ok(map_fail_outcome(outcome))
            }
            Err(lock_err) => {
                // Both lock variants are retriable: contention resolves, and
                // a flaky coordination store deserves another attempt.
                let retriable = matches!(
                    lock_err,
                    LockError::Unavailable { .. } | LockError::Store(_)
                );
                let outcome = self.queue.fail(job, &lock_err.to_string(), retriable).await?;
                Ok(map_fail_outcome(outcome))
            }
        }
    }
}

fn decode_and_validate(job: &ActiveJob) -> Result<CanonicalRecord, String> {
    let record = job
        .record()
        .map_err(|e| format!("payload does not deserialize: {e}"))?;
    record
        .validate()
        .map_err(|e| format!("payload fails canonical validation: {e}"))?;
    Ok(record)
}

fn map_fail_outcome(outcome: FailOutcome) -> ProcessOutcome {
    match outcome {
        FailOutcome::Retrying { .. } => ProcessOutcome::RetryScheduled,
        FailOutcome::Terminal => ProcessOutcome::FailedPermanently,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;
    use chrono::Utc;
    use serde_json::json;

    fn job_with_payload(payload: serde_json::Value) -> ActiveJob {
        ActiveJob {
            id: 1,
            job_id: JobId::new("marketplace_a-P1-1"),
            payload,
            priority: 0,
            attempts_made: 1,
            max_attempts: 5,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn valid_payload_decodes() {
        let job = job_with_payload(json!({
            "product_id": "P1",
            "quantity": 9,
            "source": "marketplace_a",
            "updated_at": "2026-01-01T10:00:00Z"
        }));

        let record = decode_and_validate(&job).unwrap();
        assert_eq!(record.quantity, 9);
    }

    #[test]
    fn missing_fields_rejected() {
        let job = job_with_payload(json!({"quantity": 9}));
        assert!(decode_and_validate(&job).is_err());
    }

    #[test]
    fn negative_quantity_rejected() {
        // Deserialization alone would accept -1; the schema validation step
        // is what catches it.
        let job = job_with_payload(json!({
            "product_id": "P1",
            "quantity": -1,
            "source": "marketplace_a",
            "updated_at": "2026-01-01T10:00:00Z"
        }));
        let err = decode_and_validate(&job).unwrap_err();
        assert!(err.contains("canonical validation"));
    }

    #[test]
    fn fail_outcomes_map_to_process_outcomes() {
        assert_eq!(
            map_fail_outcome(FailOutcome::Retrying {
                delay: Duration::from_secs(2)
            }),
            ProcessOutcome::RetryScheduled
        );
        assert_eq!(
            map_fail_outcome(FailOutcome::Terminal),
            ProcessOutcome::FailedPermanently
        );
    }
}
