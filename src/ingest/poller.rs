//! Incremental poller for Marketplace B.
//!
//! Marketplace B has no webhooks; updates are pulled from its REST API on a
//! fixed schedule (every 5 minutes, plus once at startup). Each cycle fetches
//! only the delta since the persisted cursor, normalizes the items through
//! the Marketplace B adapter, and bulk-enqueues them.
//!
//! # Cursor discipline
//!
//! The cursor (`marketplace_b:last_timestamp`, Unix seconds) advances to the
//! *cycle start* instant, and only *after* the batch is enqueued. A crash
//! between enqueue and cursor write re-ingests the same window on the next
//! cycle - acceptable, because the downstream upsert is idempotent. The
//! at-least-once guarantee is never traded away for cursor tidiness.
//!
//! # Circuit breaker
//!
//! Three consecutive failed cycles open the circuit: subsequent cycles skip
//! the HTTP request entirely. A one-shot timer closes the circuit 15 minutes
//! after it opened by zeroing the failure counter.
//!
//! # Single flight
//!
//! A cycle that is still running when the next tick fires (or when an
//! operator triggers one manually) causes the new cycle to skip, not stack.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{MarketplaceBAdapter, transform_batch};
use crate::queue::{JobQueue, QueueError};

/// Coordination-store key holding the last successful cycle-start instant.
const CURSOR_KEY: &str = "marketplace_b:last_timestamp";

/// Configuration for the Marketplace B poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Base URL of the Marketplace B API.
    pub api_base: String,

    /// Bearer token for the API.
    pub api_key: String,

    /// Interval between polling cycles.
    pub interval: Duration,

    /// Hard timeout on the outbound HTTP request.
    pub request_timeout: Duration,

    /// Page size requested per cycle.
    pub page_limit: u32,

    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// How long the circuit stays open before auto-reset.
    pub circuit_reset_after: Duration,

    /// Window to look back when no cursor exists yet.
    pub default_lookback: Duration,
}

impl PollerConfig {
    /// Standard cadence: 5 min cycles, 10 s request timeout, 100-item pages,
    /// circuit opens at 3 failures and closes after 15 min.
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        PollerConfig {
            api_base: api_base.into(),
            api_key: api_key.into(),
            interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            page_limit: 100,
            failure_threshold: 3,
            circuit_reset_after: Duration::from_secs(900),
            default_lookback: Duration::from_secs(3_600),
        }
    }
}

/// Errors from one polling cycle.
#[derive(Debug, Error)]
pub enum PollError {
    /// The circuit is open; no request was issued.
    #[error("circuit open, skipping poll cycle")]
    CircuitOpen,

    /// Another cycle is already in flight.
    #[error("poll cycle already in progress")]
    AlreadyRunning,

    /// The upstream API failed (network error, timeout, or error status).
    /// Counted toward the circuit breaker; retried next cycle.
    #[error("upstream unavailable: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    /// Enqueueing the batch failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Reading or writing the cursor failed.
    #[error("cursor store error: {0}")]
    Cursor(#[from] sqlx::Error),
}

/// Result of a successful polling cycle.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PollOutcome {
    /// Items returned by the upstream API.
    pub fetched: usize,
    /// Jobs enqueued after adapter validation (bad items are dropped).
    pub enqueued: usize,
    /// The cursor value written (cycle-start Unix seconds).
    pub cursor: i64,
}

/// Tracks consecutive failures and the open/closed state of the circuit.
///
/// Kept separate from the poller so the threshold arithmetic is testable
/// without HTTP or a database.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    failures: AtomicU32,
    threshold: u32,
    reset_scheduled: AtomicBool,
}

impl CircuitBreaker {
    pub(crate) fn new(threshold: u32) -> Self {
        CircuitBreaker {
            failures: AtomicU32::new(0),
            threshold,
            reset_scheduled: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.failures.load(Ordering::SeqCst) >= self.threshold
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Claims the right to schedule the reset timer. Only the first caller
    /// after the circuit opens gets `true`.
    pub(crate) fn try_claim_reset(&self) -> bool {
        !self.reset_scheduled.swap(true, Ordering::SeqCst)
    }

    /// Closes the circuit: zeroes the counter and re-arms the reset claim.
    pub(crate) fn close(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.reset_scheduled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    items: Vec<Value>,
}

/// The Marketplace B polling task.
pub struct Poller {
    config: PollerConfig,
    http: reqwest::Client,
    queue: JobQueue,
    cursor_pool: PgPool,
    adapter: MarketplaceBAdapter,
    running: AtomicBool,
    /// Shared with the one-shot reset timer task.
    circuit: Arc<CircuitBreaker>,
}

impl Poller {
    pub fn new(config: PollerConfig, queue: JobQueue, cursor_pool: PgPool) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Arc::new(Poller {
            circuit: Arc::new(CircuitBreaker::new(config.failure_threshold)),
            config,
            http,
            queue,
            cursor_pool,
            adapter: MarketplaceBAdapter,
            running: AtomicBool::new(false),
        })
    }

    /// Runs the polling schedule until cancelled: one cycle at startup, then
    /// one per interval.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            "Poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Poller stopped");
                    return;
                }
                // The first tick completes immediately, giving the
                // once-on-startup cycle.
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(outcome) => {
                            debug!(
                                fetched = outcome.fetched,
                                enqueued = outcome.enqueued,
                                cursor = outcome.cursor,
                                "Poll cycle complete"
                            );
                        }
                        Err(PollError::CircuitOpen) => {
                            info!("Poll cycle skipped: circuit open");
                        }
                        Err(PollError::AlreadyRunning) => {
                            debug!("Poll cycle skipped: previous cycle still running");
                        }
                        Err(e) => {
                            warn!(error = %e, "Poll cycle failed");
                        }
                    }
                }
            }
        }
    }

    /// Runs one polling cycle.
    ///
    /// Also invoked synchronously by the diagnostics endpoint.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<PollOutcome, PollError> {
        // Single-flight guard.
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PollError::AlreadyRunning);
        }
        let result = self.cycle_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn cycle_inner(&self) -> Result<PollOutcome, PollError> {
        // Circuit check comes first: an open circuit issues no request at
        // all. The failure counter stays where it is until the reset timer
        // fires and zeroes it.
        if self.circuit.is_open() {
            if self.circuit.try_claim_reset() {
                let circuit = Arc::clone(&self.circuit);
                let reset_after = self.config.circuit_reset_after;
                warn!(
                    reset_secs = reset_after.as_secs(),
                    "Circuit opened, scheduling reset"
                );
                tokio::spawn(async move {
                    tokio::time::sleep(reset_after).await;
                    circuit.close();
                    info!("Circuit closed, polling resumes next cycle");
                });
            }
            return Err(PollError::CircuitOpen);
        }

        let cycle_start = chrono::Utc::now().timestamp();
        let since = match self.load_cursor().await? {
            Some(cursor) => cursor,
            None => cycle_start - self.config.default_lookback.as_secs() as i64,
        };

        let items = match self.fetch_updates(since).await {
            Ok(items) => items,
            Err(e) => {
                let failures = self.circuit.record_failure();
                warn!(
                    consecutive_failures = failures,
                    error = %e,
                    "Upstream fetch failed"
                );
                return Err(e);
            }
        };

        let fetched = items.len();
        let records = transform_batch(&self.adapter, &items);
        let enqueued = records.len();

        if !records.is_empty() {
            self.queue.add_batch(&records, 0).await?;
        }

        // Cursor advances only after the batch is safely enqueued.
        self.store_cursor(cycle_start).await?;
        self.circuit.record_success();

        Ok(PollOutcome {
            fetched,
            enqueued,
            cursor: cycle_start,
        })
    }

    async fn fetch_updates(&self, since: i64) -> Result<Vec<Value>, PollError> {
        let url = format!(
            "{}/inventory/updates?since={}&limit={}",
            self.config.api_base.trim_end_matches('/'),
            since,
            self.config.page_limit
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| PollError::Upstream {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Upstream {
                status: Some(status.as_u16()),
                message: format!("upstream returned {status}"),
            });
        }

        let body: UpdatesResponse = response.json().await.map_err(|e| PollError::Upstream {
            status: Some(status.as_u16()),
            message: format!("unparseable response body: {e}"),
        })?;

        Ok(body.items)
    }

    async fn load_cursor(&self) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT value FROM sync_cursor WHERE key = $1")
            .bind(CURSOR_KEY)
            .fetch_optional(&self.cursor_pool)
            .await
    }

    async fn store_cursor(&self, value: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursor (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(CURSOR_KEY)
        .bind(value)
        .execute(&self.cursor_pool)
        .await?;
        Ok(())
    }
}
