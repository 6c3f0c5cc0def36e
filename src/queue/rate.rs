//! Fleet-wide dispatch rate limiting.
//!
//! The dispatch cap (default 100 jobs/s) applies across every worker process
//! in the fleet, and worker processes share no memory. The budget therefore
//! lives in the coordination store: one `sync_rate_limit` row holding the
//! current one-second window and a token count, consumed with the same
//! compare-and-set style as the lock table.
//!
//! A single atomic statement either takes a token from the current window,
//! rolls the row over into a fresh window, or matches no row because the
//! window's budget is spent. A worker that finds the window spent sleeps out
//! the remainder of the second and tries again.

use std::time::Duration;

use sqlx::PgPool;
use tracing::trace;

/// Coordination-store key for the job dispatch budget.
const DISPATCH_KEY: &str = "dispatch:jobs";

/// Safety margin added when sleeping out a spent window, absorbing small
/// clock differences between workers and the store.
const WINDOW_SLEEP_MARGIN: Duration = Duration::from_millis(5);

/// A handle on the shared dispatch budget.
///
/// Every instance in the fleet pointing at the same store consumes from the
/// same window row; the cap holds regardless of how many processes run.
pub struct FleetRateLimiter {
    pool: PgPool,
    per_sec: i64,
}

impl FleetRateLimiter {
    pub(crate) fn new(pool: PgPool, per_sec: u32) -> Self {
        FleetRateLimiter {
            pool,
            per_sec: per_sec.max(1) as i64,
        }
    }

    /// Takes one dispatch token if the current one-second window has budget
    /// left. Returns `false` when the fleet has spent this window.
    ///
    /// The statement is a compare-and-set: `SET` expressions evaluate
    /// against the stored row, so a stale window rolls over to a fresh count
    /// of 1 and a current window increments, but only while under the cap.
    pub async fn try_acquire(&self) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_rate_limit (key, window_start, count)
            VALUES ($1, date_trunc('second', now()), 1)
            ON CONFLICT (key) DO UPDATE SET
                count = CASE
                    WHEN sync_rate_limit.window_start = date_trunc('second', now())
                        THEN sync_rate_limit.count + 1
                    ELSE 1
                END,
                window_start = date_trunc('second', now())
            WHERE sync_rate_limit.window_start <> date_trunc('second', now())
               OR sync_rate_limit.count < $2
            "#,
        )
        .bind(DISPATCH_KEY)
        .bind(self.per_sec)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Takes a dispatch token, sleeping out spent windows until one is
    /// granted.
    pub async fn acquire(&self) -> Result<(), sqlx::Error> {
        loop {
            if self.try_acquire().await? {
                return Ok(());
            }

            let wait = time_to_next_window();
            trace!(
                wait_ms = wait.as_millis() as u64,
                "Dispatch budget spent, waiting for next window"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

/// Time until the next local one-second boundary, plus the skew margin.
fn time_to_next_window() -> Duration {
    let subsec_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    sleep_for_subsec(subsec_nanos)
}

fn sleep_for_subsec(subsec_nanos: u32) -> Duration {
    let to_boundary = 1_000_000_000u64.saturating_sub(subsec_nanos as u64);
    Duration::from_nanos(to_boundary) + WINDOW_SLEEP_MARGIN
}
