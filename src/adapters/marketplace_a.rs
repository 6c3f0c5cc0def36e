//! Adapter for Marketplace A (webhook source).
//!
//! Field mapping:
//!
//! | Source            | Canonical      |
//! |-------------------|----------------|
//! | `product_code`    | `product_id`   |
//! | `available_stock` | `quantity`     |
//! | `warehouse`       | `warehouse_id` |
//! | `timestamp`       | `updated_at` (RFC3339, passed through) |
//! | `metadata`        | `metadata`     |

use chrono::DateTime;
use serde_json::Value;

use crate::types::{CanonicalRecord, ProductId, Source};

use super::{AdapterError, SourceAdapter, optional_object, optional_str, require_i64, require_str};

/// Normalizes Marketplace A webhook payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketplaceAAdapter;

impl SourceAdapter for MarketplaceAAdapter {
    fn source(&self) -> Source {
        Source::MarketplaceA
    }

    fn transform(&self, raw: &Value) -> Result<CanonicalRecord, AdapterError> {
        let product_id = ProductId::parse(require_str(raw, "product_code")?)
            .map_err(|e| AdapterError::invalid("product_code", e.to_string()))?;

        let quantity = require_i64(raw, "available_stock", true)?;

        let timestamp = require_str(raw, "timestamp")?;
        let updated_at = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| AdapterError::invalid("timestamp", format!("not RFC3339: {e}")))?
            .to_utc();

        Ok(CanonicalRecord {
            product_id,
            quantity,
            source: Source::MarketplaceA,
            warehouse_id: optional_str(raw, "warehouse")?,
            updated_at,
            metadata: optional_object(raw, "metadata")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn valid_payload() -> Value {
        json!({
            "product_code": "PROD-ABC-123",
            "available_stock": 50,
            "timestamp": "2026-01-01T10:00:00Z",
            "warehouse": "WH-NY-01"
        })
    }

    #[test]
    fn transforms_valid_payload() {
        let record = MarketplaceAAdapter.transform(&valid_payload()).unwrap();

        assert_eq!(record.product_id.as_str(), "PROD-ABC-123");
        assert_eq!(record.quantity, 50);
        assert_eq!(record.source, Source::MarketplaceA);
        assert_eq!(record.warehouse_id.as_deref(), Some("WH-NY-01"));
        assert_eq!(record.updated_at, "2026-01-01T10:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap());
        assert!(record.metadata.is_none());
        assert!(record.validate().is_ok());
    }

    #[test]
    fn missing_product_code_rejected() {
        let mut payload = valid_payload();
        payload.as_object_mut().unwrap().remove("product_code");

        assert!(matches!(
            MarketplaceAAdapter.transform(&payload),
            Err(AdapterError::MissingField("product_code"))
        ));
    }

    #[test]
    fn empty_product_code_rejected() {
        let mut payload = valid_payload();
        payload["product_code"] = json!("");

        assert!(matches!(
            MarketplaceAAdapter.transform(&payload),
            Err(AdapterError::InvalidField { field: "product_code", .. })
        ));
    }

    #[test]
    fn negative_stock_rejected() {
        let mut payload = valid_payload();
        payload["available_stock"] = json!(-5);

        assert!(matches!(
            MarketplaceAAdapter.transform(&payload),
            Err(AdapterError::InvalidField { field: "available_stock", .. })
        ));
    }

    #[test]
    fn wrong_type_stock_rejected() {
        let mut payload = valid_payload();
        payload["available_stock"] = json!("50");

        assert!(MarketplaceAAdapter.transform(&payload).is_err());
    }

    #[test]
    fn bad_timestamp_rejected() {
        let mut payload = valid_payload();
        payload["timestamp"] = json!("yesterday");

        assert!(matches!(
            MarketplaceAAdapter.transform(&payload),
            Err(AdapterError::InvalidField { field: "timestamp", .. })
        ));
    }

    #[test]
    fn timestamp_with_offset_normalized_to_utc() {
        let mut payload = valid_payload();
        payload["timestamp"] = json!("2026-01-01T12:00:00+02:00");

        let record = MarketplaceAAdapter.transform(&payload).unwrap();
        assert_eq!(
            record.updated_at,
            "2026-01-01T10:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
        );
    }

    #[test]
    fn warehouse_is_optional() {
        let mut payload = valid_payload();
        payload.as_object_mut().unwrap().remove("warehouse");

        let record = MarketplaceAAdapter.transform(&payload).unwrap();
        assert!(record.warehouse_id.is_none());
    }

    #[test]
    fn metadata_is_carried_through() {
        let mut payload = valid_payload();
        payload["metadata"] = json!({"shipment": "S-19"});

        let record = MarketplaceAAdapter.transform(&payload).unwrap();
        assert_eq!(
            record.metadata.unwrap().get("shipment"),
            Some(&json!("S-19"))
        );
    }

    proptest! {
        /// Any valid payload transforms into a record that passes canonical
        /// validation and preserves the mapped fields.
        #[test]
        fn prop_valid_payloads_round_trip(
            code in "[A-Z]{2,6}-[0-9]{1,6}",
            stock in 0i64..1_000_000,
            warehouse in proptest::option::of("[A-Z]{2}-[0-9]{2}"),
        ) {
            let mut payload = json!({
                "product_code": code,
                "available_stock": stock,
                "timestamp": "2026-01-01T10:00:00Z",
            });
            if let Some(w) = &warehouse {
                payload["warehouse"] = json!(w);
            }

            let record = MarketplaceAAdapter.transform(&payload).unwrap();
            prop_assert!(record.validate().is_ok());
            prop_assert_eq!(record.product_id.as_str(), code.as_str());
            prop_assert_eq!(record.quantity, stock);
            prop_assert_eq!(record.warehouse_id, warehouse);
        }

        /// Negative stock never survives the adapter.
        #[test]
        fn prop_negative_stock_always_rejected(stock in i64::MIN..0) {
            let payload = json!({
                "product_code": "P-1",
                "available_stock": stock,
                "timestamp": "2026-01-01T10:00:00Z",
            });
            prop_assert!(MarketplaceAAdapter.transform(&payload).is_err());
        }
    }
}
