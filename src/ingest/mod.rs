//! Ingestion paths: webhook signature verification and the polling client.
//!
//! Two ways updates enter the system:
//!
//! - **Push** (Marketplace A): HMAC-signed webhooks, verified in
//!   [`signature`] and handled by the HTTP server, which enqueues directly.
//! - **Pull** (Marketplace B): the [`poller`] fetches deltas since a stored
//!   cursor on a fixed interval, guarded by a circuit breaker.

pub mod poller;
pub mod signature;

pub use poller::{PollError, PollOutcome, Poller, PollerConfig};
pub use signature::{compute_signature, format_signature_header, verify_signature};
