//! Unified Inventory Synchronizer - core library.
//!
//! Ingests inventory updates from heterogeneous marketplace sources (signed
//! webhooks and polled APIs), normalizes them to one canonical schema, and
//! commits them to durable storage with per-product serialization,
//! at-least-once delivery, and bounded retry.

pub mod adapters;
pub mod config;
pub mod ingest;
pub mod lock;
pub mod queue;
pub mod repo;
pub mod server;
pub mod types;
pub mod worker;
