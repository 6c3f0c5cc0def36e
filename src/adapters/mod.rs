//! Source adapters: per-marketplace payload normalization.
//!
//! Each marketplace reports inventory in its own JSON dialect. An adapter is a
//! pure function from that dialect to [`CanonicalRecord`]; it owns all
//! knowledge of source field names and unit conventions, and it is the
//! validation boundary where malformed payloads are rejected.
//!
//! Adapters are stateless and perform no I/O, which keeps them trivially
//! testable and safe to call from any context.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::types::{CanonicalRecord, Source};

pub mod marketplace_a;
pub mod marketplace_b;

pub use marketplace_a::MarketplaceAAdapter;
pub use marketplace_b::MarketplaceBAdapter;

/// Error returned when a source payload cannot be normalized.
///
/// Every variant is a "bad payload" from the pipeline's point of view:
/// non-retriable, reported synchronously (HTTP 400) on the webhook path and
/// skipped with a warning on the batch path.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// A required field was absent.
    #[error("bad payload: missing field `{0}`")]
    MissingField(&'static str),

    /// A field was present but had the wrong type or an invalid value.
    #[error("bad payload: field `{field}` {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl AdapterError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        AdapterError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// The capability set every source adapter provides.
pub trait SourceAdapter: Send + Sync {
    /// The source this adapter normalizes for.
    fn source(&self) -> Source;

    /// Normalizes one raw payload into a canonical record.
    fn transform(&self, raw: &Value) -> Result<CanonicalRecord, AdapterError>;
}

/// Normalizes a batch of payloads, dropping individual failures.
///
/// The batch never fails as a whole: a malformed item is logged and skipped
/// so one bad upstream row cannot block a polling cycle.
pub fn transform_batch(adapter: &dyn SourceAdapter, raw_items: &[Value]) -> Vec<CanonicalRecord> {
    let mut records = Vec::with_capacity(raw_items.len());
    for (index, raw) in raw_items.iter().enumerate() {
        match adapter.transform(raw) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    source = %adapter.source(),
                    index = index,
                    error = %e,
                    "Dropping unparseable item from batch"
                );
            }
        }
    }
    records
}

/// Extracts a required string field from a JSON object.
pub(crate) fn require_str<'a>(raw: &'a Value, field: &'static str) -> Result<&'a str, AdapterError> {
    match raw.get(field) {
        None | Some(Value::Null) => Err(AdapterError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(AdapterError::invalid(
            field,
            format!("expected string, got {}", json_type_name(other)),
        )),
    }
}

/// Extracts a required integer field, rejecting negatives when `non_negative`.
pub(crate) fn require_i64(
    raw: &Value,
    field: &'static str,
    non_negative: bool,
) -> Result<i64, AdapterError> {
    let value = match raw.get(field) {
        None | Some(Value::Null) => return Err(AdapterError::MissingField(field)),
        Some(v) => v,
    };
    let n = value
        .as_i64()
        .ok_or_else(|| AdapterError::invalid(field, format!("expected integer, got {}", json_type_name(value))))?;
    if non_negative && n < 0 {
        return Err(AdapterError::invalid(field, format!("must be non-negative, got {n}")));
    }
    Ok(n)
}

/// Extracts an optional string field (absent and `null` both map to `None`).
pub(crate) fn optional_str(raw: &Value, field: &'static str) -> Result<Option<String>, AdapterError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(AdapterError::invalid(
            field,
            format!("expected string, got {}", json_type_name(other)),
        )),
    }
}

/// Extracts an optional object field.
pub(crate) fn optional_object(
    raw: &Value,
    field: &'static str,
) -> Result<Option<serde_json::Map<String, Value>>, AdapterError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(AdapterError::invalid(
            field,
            format!("expected object, got {}", json_type_name(other)),
        )),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transform_batch_skips_bad_items() {
        let adapter = MarketplaceBAdapter;
        let items = vec![
            json!({"sku": "SKU1", "qty": 7, "location_id": "L", "last_modified": 1735689600}),
            json!({"qty": 3, "last_modified": 1735689600}),
            json!({"sku": "SKU2", "qty": 1, "last_modified": 1735689601}),
        ];

        let records = transform_batch(&adapter, &items);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].product_id.as_str(), "SKU1");
        assert_eq!(records[1].product_id.as_str(), "SKU2");
    }

    #[test]
    fn transform_batch_empty_input() {
        let adapter = MarketplaceAAdapter;
        assert!(transform_batch(&adapter, &[]).is_empty());
    }

    #[test]
    fn require_i64_rejects_float() {
        let raw = json!({"qty": 1.5});
        assert!(matches!(
            require_i64(&raw, "qty", true),
            Err(AdapterError::InvalidField { field: "qty", .. })
        ));
    }
}
