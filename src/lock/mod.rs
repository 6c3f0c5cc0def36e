//! Per-product distributed lock manager.
//!
//! A fleet-wide mutual-exclusion primitive keyed by product id, backed by the
//! shared coordination store (`sync_locks` table). The only contract callers
//! rely on is [`LockManager::with_lock`]: acquire, run the work, release on
//! every exit path.
//!
//! # Protocol
//!
//! - **Acquire**: generate a random nonce, then attempt an atomic
//!   compare-and-set - insert the key, or steal it only if the existing
//!   holder's TTL has expired. On contention, sleep `retry_delay` plus up to
//!   100 ms of jitter and retry, up to `retries` times.
//! - **Release**: delete the key *iff* its value equals our nonce. A blind
//!   delete could release a successor's lock after a TTL-expiry handoff.
//! - **Extension**: while the work runs, the manager re-arms the TTL (same
//!   nonce, compare-and-set) whenever the drift-adjusted remaining lifetime
//!   drops below `extension_threshold`, so work longer than one TTL keeps its
//!   exclusion.
//!
//! # Failure modes
//!
//! Exhausted acquisition retries surface as [`LockError::Unavailable`], which
//! the queue layer retries with backoff. A dead holder's key simply expires;
//! the next acquirer steals it. A live holder whose extension CAS fails has
//! lost the lock to a steal - this is logged and accepted (the window is
//! bounded by the TTL and the repository's row-level reservation still
//! serializes the writes).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::types::ProductId;

/// Key prefix for inventory locks. Keyed on product only: both sources for a
/// product serialize through one lock, preserving per-product audit order.
const LOCK_KEY_PREFIX: &str = "lock:inventory:";

/// Upper bound of the random jitter added to each acquisition retry.
const ACQUIRE_JITTER_MAX: Duration = Duration::from_millis(100);

/// Configuration for lock acquisition and lifetime.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Time-to-live for a held lock.
    pub ttl: Duration,

    /// Number of acquisition retries after the initial attempt.
    pub retries: u32,

    /// Base delay between acquisition attempts (jitter is added on top).
    pub retry_delay: Duration,

    /// Clock-drift allowance: the nominal TTL is reduced by
    /// `ttl * drift_factor + 2ms` before extension decisions.
    pub drift_factor: f64,

    /// Extend when this close to the (drift-adjusted) expiry.
    pub extension_threshold: Duration,
}

impl LockConfig {
    /// Default lock parameters: 10 s TTL, 5 retries at 200 ms.
    pub const DEFAULT: Self = Self {
        ttl: Duration::from_millis(10_000),
        retries: 5,
        retry_delay: Duration::from_millis(200),
        drift_factor: 0.01,
        extension_threshold: Duration::from_millis(500),
    };

    /// The usable lifetime of one TTL grant after drift adjustment.
    pub fn effective_ttl(&self) -> Duration {
        let drift = self.ttl.mul_f64(self.drift_factor) + Duration::from_millis(2);
        self.ttl.saturating_sub(drift)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Acquisition failed after all retries; another holder kept the lock.
    /// Retriable at the queue layer.
    #[error("lock unavailable for key `{key}` after {attempts} attempts")]
    Unavailable { key: String, attempts: u32 },

    /// The coordination store failed mid-operation. Also retriable.
    #[error("lock store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Proof of lock ownership, held while work runs.
///
/// Release is explicit (nonce compare-and-delete) rather than `Drop`-based:
/// async release cannot run in a destructor. If the process dies while
/// holding a guard, the TTL reaps the key.
#[derive(Debug)]
struct LockGuard {
    key: String,
    nonce: String,
    /// Local estimate of when the current grant expires.
    expires_at: Instant,
}

/// The per-product lock manager.
///
/// Cheap to clone; all clones share one pool and configuration.
#[derive(Clone)]
pub struct LockManager {
    pool: PgPool,
    config: LockConfig,
}

impl LockManager {
    pub fn new(pool: PgPool, config: LockConfig) -> Self {
        LockManager { pool, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Returns the coordination-store key for a product.
    pub fn key_for(product_id: &ProductId) -> String {
        format!("{LOCK_KEY_PREFIX}{product_id}")
    }

    /// Acquires the lock for `product_id`, runs `work`, releases on every
    /// exit path, and returns the work's output.
    ///
    /// While `work` is in flight the manager watches the grant's remaining
    /// lifetime and re-arms the TTL when it gets within
    /// `extension_threshold` of the drift-adjusted expiry.
    pub async fn with_lock<F, Fut>(
        &self,
        product_id: &ProductId,
        work: F,
    ) -> Result<Fut::Output, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let guard = self.acquire(product_id).await?;

        let output = self.run_with_extension(guard.clone_state(), work()).await;

        // Release regardless of how the work went. A failed release means the
        // TTL already expired and someone may have stolen the key; the nonce
        // comparison makes that safe.
        if let Err(e) = self.release(&guard).await {
            warn!(key = %guard.key, error = %e, "Lock release failed");
        }

        Ok(output)
    }

    /// Drives `work` to completion, extending the lock as needed.
    async fn run_with_extension<Fut>(&self, mut guard: LockGuard, work: Fut) -> Fut::Output
    where
        Fut: Future,
    {
        tokio::pin!(work);

        loop {
            // Wake up when the grant is one threshold away from its
            // drift-adjusted expiry.
            let effective_expiry = guard.expires_at
                - (self.config.ttl - self.config.effective_ttl());
            let extend_at = effective_expiry
                .checked_sub(self.config.extension_threshold)
                .unwrap_or_else(Instant::now);

            tokio::select! {
                output = &mut work => return output,
                _ = tokio::time::sleep_until(extend_at) => {
                    match self.extend(&guard).await {
                        Ok(true) => {
                            guard.expires_at = Instant::now() + self.config.ttl;
                            trace!(key = %guard.key, "Lock extended");
                        }
                        Ok(false) => {
                            // TTL expired and another worker took the key.
                            // Accepted liveness gap, bounded by the TTL; the
                            // repository's row reservation still serializes.
                            warn!(key = %guard.key, "Lock lost before extension; continuing unprotected");
                            return work.await;
                        }
                        Err(e) => {
                            warn!(key = %guard.key, error = %e, "Lock extension failed");
                            return work.await;
                        }
                    }
                }
            }
        }
    }

    /// Acquires the lock, retrying with jitter.
    async fn acquire(&self, product_id: &ProductId) -> Result<LockGuard, LockError> {
        let key = Self::key_for(product_id);
        let nonce = generate_nonce();
        let max_attempts = self.config.retries + 1;

        for attempt in 1..=max_attempts {
            if self.try_acquire(&key, &nonce).await? {
                debug!(key = %key, attempt = attempt, "Lock acquired");
                return Ok(LockGuard {
                    key,
                    nonce,
                    expires_at: Instant::now() + self.config.ttl,
                });
            }

            if attempt < max_attempts {
                let jitter = rand::thread_rng().gen_range(Duration::ZERO..ACQUIRE_JITTER_MAX);
                tokio::time::sleep(self.config.retry_delay + jitter).await;
            }
        }

        Err(LockError::Unavailable {
            key,
            attempts: max_attempts,
        })
    }

    /// One atomic acquisition attempt: insert the key, or steal an expired one.
    async fn try_acquire(&self, key: &str, nonce: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_locks (key, nonce, expires_at)
            VALUES ($1, $2, now() + ($3::bigint * interval '1 millisecond'))
            ON CONFLICT (key) DO UPDATE SET
                nonce = EXCLUDED.nonce,
                expires_at = EXCLUDED.expires_at
            WHERE sync_locks.expires_at <= now()
            "#,
        )
        .bind(key)
        .bind(nonce)
        .bind(self.config.ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-delete release. Returns whether our grant was still live.
    async fn release(&self, guard: &LockGuard) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sync_locks WHERE key = $1 AND nonce = $2")
            .bind(&guard.key)
            .bind(&guard.nonce)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-set TTL extension. Returns whether our grant was still live.
    async fn extend(&self, guard: &LockGuard) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sync_locks
            SET expires_at = now() + ($3::bigint * interval '1 millisecond')
            WHERE key = $1 AND nonce = $2
            "#,
        )
        .bind(&guard.key)
        .bind(&guard.nonce)
        .bind(self.config.ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

impl LockGuard {
    fn clone_state(&self) -> LockGuard {
        LockGuard {
            key: self.key.clone(),
            nonce: self.nonce.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Generates a random 128-bit hex nonce proving lock ownership at release.
fn generate_nonce() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = LockConfig::DEFAULT;
        assert_eq!(config.ttl, Duration::from_millis(10_000));
        assert_eq!(config.retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(200));
        assert_eq!(config.extension_threshold, Duration::from_millis(500));
    }

    #[test]
    fn effective_ttl_subtracts_drift() {
        let config = LockConfig::DEFAULT;
        // 10_000ms - (10_000 * 0.01 + 2)ms = 9_898ms
        assert_eq!(config.effective_ttl(), Duration::from_millis(9_898));
    }

    #[test]
    fn effective_ttl_never_underflows() {
        let config = LockConfig {
            ttl: Duration::from_millis(1),
            drift_factor: 1.0,
            ..LockConfig::DEFAULT
        };
        assert_eq!(config.effective_ttl(), Duration::ZERO);
    }

    #[test]
    fn key_format() {
        let product = ProductId::parse("PROD-X").unwrap();
        assert_eq!(LockManager::key_for(&product), "lock:inventory:PROD-X");
    }

    #[test]
    fn nonces_are_unique_hex() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
