//! Embedded schema bootstrap.
//!
//! The full schema - inventory, audit, queue, lock, and cursor tables - is
//! applied at startup with `CREATE ... IF NOT EXISTS`, before any component
//! starts serving. Every statement is idempotent, so concurrent instances
//! racing through startup converge on the same schema.

use sqlx::PgPool;

/// DDL for all tables and indexes the service owns.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS inventory (
    id            BIGSERIAL PRIMARY KEY,
    product_id    TEXT NOT NULL,
    quantity      BIGINT NOT NULL CHECK (quantity >= 0),
    source        TEXT NOT NULL,
    warehouse_id  TEXT,
    updated_at    TIMESTAMPTZ NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    metadata      JSONB,
    UNIQUE (product_id, source)
);

CREATE INDEX IF NOT EXISTS idx_inventory_product_id ON inventory (product_id);
CREATE INDEX IF NOT EXISTS idx_inventory_source ON inventory (source);
CREATE INDEX IF NOT EXISTS idx_inventory_updated_at ON inventory (updated_at);

CREATE TABLE IF NOT EXISTS inventory_audit (
    id            BIGSERIAL PRIMARY KEY,
    product_id    TEXT NOT NULL,
    old_quantity  BIGINT,
    new_quantity  BIGINT NOT NULL,
    source        TEXT NOT NULL,
    changed_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    metadata      JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE INDEX IF NOT EXISTS idx_audit_product_id ON inventory_audit (product_id);
CREATE INDEX IF NOT EXISTS idx_audit_changed_at ON inventory_audit (changed_at);

CREATE TABLE IF NOT EXISTS sync_jobs (
    id               BIGSERIAL PRIMARY KEY,
    job_id           TEXT NOT NULL UNIQUE,
    product_id       TEXT NOT NULL,
    source           TEXT NOT NULL,
    payload          JSONB NOT NULL,
    priority         INT NOT NULL DEFAULT 0,
    state            TEXT NOT NULL DEFAULT 'waiting',
    attempts_made    INT NOT NULL DEFAULT 0,
    max_attempts     INT NOT NULL DEFAULT 5,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    next_run_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    lease_expires_at TIMESTAMPTZ,
    last_error       TEXT,
    finished_at      TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON sync_jobs (state, next_run_at, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_lease ON sync_jobs (lease_expires_at)
    WHERE state = 'active';
CREATE INDEX IF NOT EXISTS idx_jobs_finished ON sync_jobs (finished_at)
    WHERE state IN ('completed', 'failed');

CREATE TABLE IF NOT EXISTS sync_locks (
    key        TEXT PRIMARY KEY,
    nonce      TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_cursor (
    key   TEXT PRIMARY KEY,
    value BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_rate_limit (
    key          TEXT PRIMARY KEY,
    window_start TIMESTAMPTZ NOT NULL,
    count        BIGINT NOT NULL
);
"#;

/// Applies the embedded schema. Must run before serving traffic.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}
