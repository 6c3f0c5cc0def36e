//! Core domain types for the inventory synchronizer.
//!
//! The central type is [`CanonicalRecord`], the normalized form every source
//! payload is adapted into before it enters the queue. Identifier newtypes
//! prevent accidental mixing (a `JobId` is not a `ProductId`) and make
//! signatures self-documenting.

pub mod ids;
pub mod record;

pub use ids::{InvalidProductId, JobId, ProductId, Source};
pub use record::{CanonicalRecord, RecordValidationError};
