//! Postgres-backed inventory repository.
//!
//! # What this module is
//!
//! The durable store for normalized inventory state, in two complementary
//! forms:
//!
//! 1. **Authoritative table** (`inventory`) - the current quantity per
//!    `(product_id, source)`, unique on that pair.
//! 2. **Append-only audit table** (`inventory_audit`) - one row per
//!    successful upsert, recording the quantity transition
//!    (`old_quantity` → `new_quantity`).
//!
//! Both writes happen in a single transaction, so the audit trail can never
//! disagree with the authoritative state: every inventory row has at least
//! one audit row whose `new_quantity` matches the row's current quantity.
//!
//! # Ordering
//!
//! The upsert is unconditional - no timestamp comparison on conflict.
//! Serialization of writers for the same product is the lock manager's job;
//! inside the transaction a row-level `FOR UPDATE` reservation additionally
//! serializes any writer that slipped past the distributed lock.
//!
//! # Error classification
//!
//! Failures are classified into [`StorageError::Transient`] (connection,
//! pool, serialization, deadlock - the queue retries these with backoff) and
//! [`StorageError::Permanent`] (constraint violations - the job fails
//! terminally). The classification drives the worker's retry decision.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgDatabaseError;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::types::{CanonicalRecord, ProductId, Source};

pub mod schema;

/// A persisted inventory row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryRow {
    pub id: i64,
    pub product_id: String,
    pub quantity: i64,
    pub source: Source,
    pub warehouse_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

/// A persisted audit row: one quantity transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub product_id: String,
    /// `None` on the first insert for a `(product_id, source)` pair.
    pub old_quantity: Option<i64>,
    pub new_quantity: i64,
    pub source: Source,
    pub changed_at: DateTime<Utc>,
    pub metadata: Value,
}

/// Row shape for the `inventory` table.
///
/// DB-facing structs are kept separate from the domain types so schema
/// details (column names, string enums) stay localized here.
#[derive(Debug, Clone, FromRow)]
struct DbInventoryRow {
    id: i64,
    product_id: String,
    quantity: i64,
    source: String,
    warehouse_id: Option<String>,
    updated_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    metadata: Option<Value>,
}

/// Row shape for the `inventory_audit` table.
#[derive(Debug, Clone, FromRow)]
struct DbAuditRow {
    id: i64,
    product_id: String,
    old_quantity: Option<i64>,
    new_quantity: i64,
    source: String,
    changed_at: DateTime<Utc>,
    metadata: Value,
}

/// Errors from repository operations, classified for retry decisions.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient failure - safe to retry with backoff.
    ///
    /// Connection drops, pool acquire timeouts, serialization failures
    /// (SQLSTATE 40001) and deadlocks (40P01) land here.
    #[error("transient storage error: {message}")]
    Transient {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    /// Permanent failure - retrying the same record cannot succeed.
    ///
    /// Constraint violations (SQLSTATE class 23) and other non-recoverable
    /// database rejections land here.
    #[error("permanent storage error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: sqlx::Error,
    },
}

impl StorageError {
    /// Returns true if the error is retriable by the queue.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }

    /// Classifies a raw sqlx error into transient or permanent.
    pub fn classify(err: sqlx::Error) -> Self {
        let message = err.to_string();
        if is_transient(&err) {
            StorageError::Transient { message, source: err }
        } else {
            StorageError::Permanent { message, source: err }
        }
    }
}

/// SQLSTATE codes that indicate a retriable conflict rather than a bad write.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            let code = db.code();
            matches!(
                code.as_deref(),
                Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED)
            )
        }
        _ => false,
    }
}

/// Returns true if the error is a Postgres constraint violation (class 23).
pub(crate) fn is_constraint_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        if let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() {
            return pg.code().starts_with("23");
        }
    }
    false
}

/// The inventory repository.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Repository { pool }
    }

    /// Upserts a canonical record and appends the matching audit row, in one
    /// transaction.
    ///
    /// # Transaction steps
    ///
    /// 1. Row-level `FOR UPDATE` reservation on the existing
    ///    `(product_id, source)` row, if any.
    /// 2. Read `old_quantity` from that row (`None` on first insert).
    /// 3. Insert-or-update the inventory row; on conflict, quantity,
    ///    warehouse, timestamp and metadata are replaced unconditionally.
    /// 4. Insert the audit row with the old/new quantities and metadata
    ///    merged with `warehouse_id`.
    /// 5. Commit. Any error rolls the whole set back.
    ///
    /// Replaying an identical record is safe: it produces the same inventory
    /// row and one more audit row whose `old_quantity == new_quantity`.
    #[instrument(skip(self, record), fields(product_id = %record.product_id, source = %record.source))]
    pub async fn upsert(&self, record: &CanonicalRecord) -> Result<InventoryRow, StorageError> {
        let mut tx = self.pool.begin().await.map_err(StorageError::classify)?;

        // Steps 1 + 2: reserve the existing row and read the prior quantity.
        let old_quantity: Option<i64> = sqlx::query_scalar(
            "SELECT quantity FROM inventory WHERE product_id = $1 AND source = $2 FOR UPDATE",
        )
        .bind(record.product_id.as_str())
        .bind(record.source.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::classify)?;

        // Step 3: unconditional insert-or-update.
        let row = sqlx::query_as::<_, DbInventoryRow>(
            r#"
            INSERT INTO inventory (product_id, quantity, source, warehouse_id, updated_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (product_id, source) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                warehouse_id = EXCLUDED.warehouse_id,
                updated_at = EXCLUDED.updated_at,
                metadata = EXCLUDED.metadata
            RETURNING id, product_id, quantity, source, warehouse_id, updated_at, created_at, metadata
            "#,
        )
        .bind(record.product_id.as_str())
        .bind(record.quantity)
        .bind(record.source.as_str())
        .bind(record.warehouse_id.as_deref())
        .bind(record.updated_at)
        .bind(record.metadata.as_ref().map(|m| Value::Object(m.clone())))
        .fetch_one(&mut *tx)
        .await
        .map_err(classify_write_error)?;

        // Step 4: append the audit transition.
        sqlx::query(
            r#"
            INSERT INTO inventory_audit (product_id, old_quantity, new_quantity, source, changed_at, metadata)
            VALUES ($1, $2, $3, $4, now(), $5)
            "#,
        )
        .bind(record.product_id.as_str())
        .bind(old_quantity)
        .bind(record.quantity)
        .bind(record.source.as_str())
        .bind(Value::Object(record.audit_metadata()))
        .execute(&mut *tx)
        .await
        .map_err(classify_write_error)?;

        tx.commit().await.map_err(StorageError::classify)?;

        debug!(
            old_quantity = ?old_quantity,
            new_quantity = record.quantity,
            "Upsert committed"
        );

        map_inventory_row(row)
    }

    /// Returns all inventory rows for a product, ordered by source.
    pub async fn get_by_product(&self, product_id: &ProductId) -> Result<Vec<InventoryRow>, StorageError> {
        let rows = sqlx::query_as::<_, DbInventoryRow>(
            r#"
            SELECT id, product_id, quantity, source, warehouse_id, updated_at, created_at, metadata
            FROM inventory WHERE product_id = $1 ORDER BY source
            "#,
        )
        .bind(product_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::classify)?;

        rows.into_iter().map(map_inventory_row).collect()
    }

    /// Returns the most recent audit rows for a product, newest first.
    pub async fn get_audit(
        &self,
        product_id: &ProductId,
        limit: i64,
    ) -> Result<Vec<AuditRow>, StorageError> {
        let rows = sqlx::query_as::<_, DbAuditRow>(
            r#"
            SELECT id, product_id, old_quantity, new_quantity, source, changed_at, metadata
            FROM inventory_audit WHERE product_id = $1
            ORDER BY changed_at DESC, id DESC LIMIT $2
            "#,
        )
        .bind(product_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::classify)?;

        rows.into_iter().map(map_audit_row).collect()
    }

    /// Cheap liveness probe against the database.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StorageError::classify)?;
        Ok(())
    }
}

/// Write-path classification: constraint violations are permanent even though
/// generic `Database` errors would otherwise fall through the transient check.
fn classify_write_error(err: sqlx::Error) -> StorageError {
    if is_constraint_violation(&err) {
        return StorageError::Permanent {
            message: err.to_string(),
            source: err,
        };
    }
    StorageError::classify(err)
}

fn map_inventory_row(row: DbInventoryRow) -> Result<InventoryRow, StorageError> {
    let source = parse_source_column(&row.source)?;
    Ok(InventoryRow {
        id: row.id,
        product_id: row.product_id,
        quantity: row.quantity,
        source,
        warehouse_id: row.warehouse_id,
        updated_at: row.updated_at,
        created_at: row.created_at,
        metadata: row.metadata,
    })
}

fn map_audit_row(row: DbAuditRow) -> Result<AuditRow, StorageError> {
    let source = parse_source_column(&row.source)?;
    Ok(AuditRow {
        id: row.id,
        product_id: row.product_id,
        old_quantity: row.old_quantity,
        new_quantity: row.new_quantity,
        source,
        changed_at: row.changed_at,
        metadata: row.metadata,
    })
}

fn parse_source_column(raw: &str) -> Result<Source, StorageError> {
    Source::parse_str(raw).ok_or_else(|| StorageError::Permanent {
        message: format!("unknown source in database: {raw}"),
        source: sqlx::Error::ColumnDecode {
            index: "source".to_string(),
            source: format!("unknown source: {raw}").into(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(StorageError::classify(err).is_retriable());
    }

    #[test]
    fn pool_timeout_is_transient() {
        assert!(StorageError::classify(sqlx::Error::PoolTimedOut).is_retriable());
    }

    #[test]
    fn row_not_found_is_permanent() {
        assert!(!StorageError::classify(sqlx::Error::RowNotFound).is_retriable());
    }

    #[test]
    fn unknown_source_fails_decoding() {
        assert!(parse_source_column("marketplace_z").is_err());
        assert_eq!(
            parse_source_column("marketplace_a").unwrap(),
            Source::MarketplaceA
        );
    }
}
