//! Adapter for Marketplace B (polled source).
//!
//! Field mapping:
//!
//! | Source            | Canonical      |
//! |-------------------|----------------|
//! | `sku`             | `product_id`   |
//! | `qty`             | `quantity`     |
//! | `location_id`     | `warehouse_id` |
//! | `last_modified`   | `updated_at` (Unix seconds, converted to UTC) |
//! | `additional_info` | `metadata`     |
//!
//! `last_modified` arrives as Unix seconds; the conversion goes through
//! milliseconds (`last_modified * 1000`) so fractional-second precision is
//! uniform with the rest of the pipeline.

use chrono::DateTime;
use serde_json::Value;

use crate::types::{CanonicalRecord, ProductId, Source};

use super::{AdapterError, SourceAdapter, optional_object, optional_str, require_i64, require_str};

/// Normalizes Marketplace B polling-API items.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketplaceBAdapter;

impl SourceAdapter for MarketplaceBAdapter {
    fn source(&self) -> Source {
        Source::MarketplaceB
    }

    fn transform(&self, raw: &Value) -> Result<CanonicalRecord, AdapterError> {
        let product_id = ProductId::parse(require_str(raw, "sku")?)
            .map_err(|e| AdapterError::invalid("sku", e.to_string()))?;

        let quantity = require_i64(raw, "qty", true)?;

        let last_modified = require_i64(raw, "last_modified", false)?;
        let epoch_millis = last_modified
            .checked_mul(1000)
            .ok_or_else(|| AdapterError::invalid("last_modified", "out of range"))?;
        let updated_at = DateTime::from_timestamp_millis(epoch_millis)
            .ok_or_else(|| AdapterError::invalid("last_modified", "out of range"))?;

        Ok(CanonicalRecord {
            product_id,
            quantity,
            source: Source::MarketplaceB,
            warehouse_id: optional_str(raw, "location_id")?,
            updated_at,
            metadata: optional_object(raw, "additional_info")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn valid_item() -> Value {
        json!({
            "sku": "SKU1",
            "qty": 7,
            "location_id": "L",
            "last_modified": 1735689600
        })
    }

    #[test]
    fn transforms_valid_item() {
        let record = MarketplaceBAdapter.transform(&valid_item()).unwrap();

        assert_eq!(record.product_id.as_str(), "SKU1");
        assert_eq!(record.quantity, 7);
        assert_eq!(record.source, Source::MarketplaceB);
        assert_eq!(record.warehouse_id.as_deref(), Some("L"));
        // 1735689600 s = 2025-01-01T00:00:00Z
        assert_eq!(
            record.updated_at,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(record.validate().is_ok());
    }

    #[test]
    fn missing_sku_rejected() {
        let mut item = valid_item();
        item.as_object_mut().unwrap().remove("sku");

        assert!(matches!(
            MarketplaceBAdapter.transform(&item),
            Err(AdapterError::MissingField("sku"))
        ));
    }

    #[test]
    fn negative_qty_rejected() {
        let mut item = valid_item();
        item["qty"] = json!(-1);

        assert!(matches!(
            MarketplaceBAdapter.transform(&item),
            Err(AdapterError::InvalidField { field: "qty", .. })
        ));
    }

    #[test]
    fn string_last_modified_rejected() {
        let mut item = valid_item();
        item["last_modified"] = json!("1735689600");

        assert!(MarketplaceBAdapter.transform(&item).is_err());
    }

    #[test]
    fn location_is_optional() {
        let mut item = valid_item();
        item.as_object_mut().unwrap().remove("location_id");

        let record = MarketplaceBAdapter.transform(&item).unwrap();
        assert!(record.warehouse_id.is_none());
    }

    #[test]
    fn additional_info_becomes_metadata() {
        let mut item = valid_item();
        item["additional_info"] = json!({"lot": 42});

        let record = MarketplaceBAdapter.transform(&item).unwrap();
        assert_eq!(record.metadata.unwrap().get("lot"), Some(&json!(42)));
    }

    #[test]
    fn pre_epoch_timestamps_accepted() {
        let mut item = valid_item();
        item["last_modified"] = json!(-86400);

        let record = MarketplaceBAdapter.transform(&item).unwrap();
        assert_eq!(
            record.updated_at,
            Utc.with_ymd_and_hms(1969, 12, 31, 0, 0, 0).unwrap()
        );
    }

    proptest! {
        /// Unit conversion is exact: seconds in, the same instant out.
        #[test]
        fn prop_last_modified_conversion_exact(secs in -1_000_000_000i64..4_000_000_000i64) {
            let item = json!({
                "sku": "SKU1",
                "qty": 1,
                "last_modified": secs,
            });
            let record = MarketplaceBAdapter.transform(&item).unwrap();
            prop_assert_eq!(record.updated_at.timestamp(), secs);
        }

        /// Valid items always pass canonical validation.
        #[test]
        fn prop_valid_items_validate(
            sku in "[A-Z0-9]{1,12}",
            qty in 0i64..10_000_000,
        ) {
            let item = json!({
                "sku": sku,
                "qty": qty,
                "last_modified": 1735689600,
            });
            let record = MarketplaceBAdapter.transform(&item).unwrap();
            prop_assert!(record.validate().is_ok());
            prop_assert_eq!(record.quantity, qty);
        }
    }
}
