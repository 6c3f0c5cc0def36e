//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! `JobId` where a `ProductId` is expected) and centralize the validation
//! rules each identifier carries.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when parsing an invalid product identifier.
#[derive(Debug, Clone, Error)]
#[error("invalid product id: {reason}")]
pub struct InvalidProductId {
    reason: &'static str,
}

/// An external product identifier as reported by a marketplace.
///
/// Guaranteed non-empty. Construction is only possible via [`ProductId::parse`],
/// which validates the input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Parses a string as a product id, rejecting empty or whitespace-only input.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidProductId> {
        let s = s.into();
        if s.trim().is_empty() {
            return Err(InvalidProductId {
                reason: "must be non-empty",
            });
        }
        Ok(ProductId(s))
    }

    /// Returns the product id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ProductId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ProductId::parse(s).map_err(serde::de::Error::custom)
    }
}

/// The marketplace a record originated from.
///
/// Serialized as `snake_case` strings; the same strings are the database
/// representation, so `as_str`/`parse_str` must stay in sync with the serde
/// renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    MarketplaceA,
    MarketplaceB,
}

impl Source {
    /// Returns the wire/database representation of this source.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::MarketplaceA => "marketplace_a",
            Source::MarketplaceB => "marketplace_b",
        }
    }

    /// Parses the wire/database representation back into a source.
    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "marketplace_a" => Some(Source::MarketplaceA),
            "marketplace_b" => Some(Source::MarketplaceB),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queue job identifier.
///
/// The scheme is `{source}-{product_id}-{created_nanos}[-{seq}]`, which lets
/// operators correlate a job with its product and enqueue time at a glance.
/// It is deliberately NOT a deduplication key: replays of the same update get
/// distinct job ids and the idempotent upsert absorbs them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps an existing job id string (e.g., read back from the queue).
    pub fn new(s: impl Into<String>) -> Self {
        JobId(s.into())
    }

    /// Generates a job id for a record enqueued at `created_nanos`.
    ///
    /// `seq` disambiguates jobs created in the same batch, where the nanosecond
    /// timestamp is shared across entries.
    pub fn generate(source: Source, product_id: &ProductId, created_nanos: i64, seq: Option<u32>) -> Self {
        match seq {
            Some(n) => JobId(format!("{}-{}-{}-{}", source, product_id, created_nanos, n)),
            None => JobId(format!("{}-{}-{}", source, product_id, created_nanos)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_id_rejects_empty() {
        assert!(ProductId::parse("").is_err());
        assert!(ProductId::parse("   ").is_err());
    }

    #[test]
    fn product_id_accepts_normal_skus() {
        let id = ProductId::parse("PROD-ABC-123").unwrap();
        assert_eq!(id.as_str(), "PROD-ABC-123");
    }

    #[test]
    fn product_id_deserialize_validates() {
        let ok: Result<ProductId, _> = serde_json::from_str("\"SKU1\"");
        assert!(ok.is_ok());

        let empty: Result<ProductId, _> = serde_json::from_str("\"\"");
        assert!(empty.is_err());
    }

    #[test]
    fn source_round_trips_through_str() {
        for source in [Source::MarketplaceA, Source::MarketplaceB] {
            assert_eq!(Source::parse_str(source.as_str()), Some(source));
        }
        assert_eq!(Source::parse_str("marketplace_c"), None);
    }

    #[test]
    fn source_serde_matches_as_str() {
        let json = serde_json::to_string(&Source::MarketplaceA).unwrap();
        assert_eq!(json, "\"marketplace_a\"");

        let parsed: Source = serde_json::from_str("\"marketplace_b\"").unwrap();
        assert_eq!(parsed, Source::MarketplaceB);
    }

    #[test]
    fn job_id_format_without_seq() {
        let product = ProductId::parse("SKU1").unwrap();
        let id = JobId::generate(Source::MarketplaceB, &product, 1_700_000_000_000_000_000, None);
        assert_eq!(id.as_str(), "marketplace_b-SKU1-1700000000000000000");
    }

    #[test]
    fn job_id_format_with_seq() {
        let product = ProductId::parse("SKU1").unwrap();
        let id = JobId::generate(Source::MarketplaceA, &product, 42, Some(3));
        assert_eq!(id.as_str(), "marketplace_a-SKU1-42-3");
    }
}
