//! The canonical inventory record.
//!
//! Every source payload is normalized into a [`CanonicalRecord`] by its
//! adapter before entering the queue. The record is the only shape the
//! repository, lock manager, and worker ever see; source-specific field names
//! stop existing at the adapter boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::ids::{ProductId, Source};

/// Error returned when a record fails canonical-schema validation.
///
/// Validation runs twice by design: once in the adapter (rejecting bad
/// payloads synchronously) and once in the worker before the upsert, so a
/// corrupted queue payload fails permanently instead of being retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordValidationError {
    /// Quantity was negative.
    #[error("quantity must be non-negative, got {0}")]
    NegativeQuantity(i64),

    /// Product id was empty.
    #[error("product id must be non-empty")]
    EmptyProductId,
}

/// The normalized inventory update used throughout the core.
///
/// `updated_at` is the *source's* timestamp, not ingestion time; it is carried
/// through unchanged from the adapter to the database row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub product_id: ProductId,
    pub quantity: i64,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl CanonicalRecord {
    /// Validates the record against the canonical schema.
    ///
    /// The `ProductId` type already guarantees non-emptiness at construction,
    /// but records can also arrive by deserializing a stored queue payload, so
    /// the check is repeated here rather than trusted.
    pub fn validate(&self) -> Result<(), RecordValidationError> {
        if self.product_id.as_str().trim().is_empty() {
            return Err(RecordValidationError::EmptyProductId);
        }
        if self.quantity < 0 {
            return Err(RecordValidationError::NegativeQuantity(self.quantity));
        }
        Ok(())
    }

    /// Returns the record's metadata merged with `warehouse_id`, as stored on
    /// audit rows.
    pub fn audit_metadata(&self) -> Map<String, Value> {
        let mut merged = self.metadata.clone().unwrap_or_default();
        if let Some(warehouse) = &self.warehouse_id {
            merged.insert("warehouse_id".to_string(), Value::String(warehouse.clone()));
        }
        merged
    }
}
