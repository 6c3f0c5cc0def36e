//! HTTP server for the inventory synchronizer.
//!
//! This is a thin wrapper around the core: handlers verify, adapt, and
//! enqueue - all processing happens asynchronously in the workers.
//!
//! # Endpoints
//!
//! - `POST /webhooks/marketplace-a` - HMAC-verified webhook ingestion (202)
//! - `GET /inventory/{product_id}` - current rows per source
//! - `GET /inventory/{product_id}/audit` - recent quantity transitions
//! - `GET /health` - queue stats; 503 when the database is unreachable
//! - `POST /trigger-poll` - run one Marketplace B polling cycle now

use std::sync::Arc;

use serde::Serialize;

use crate::ingest::Poller;
use crate::queue::JobQueue;
use crate::repo::Repository;

pub mod health;
pub mod inventory;
pub mod webhook;

pub use health::health_handler;
pub use inventory::{audit_handler, inventory_handler};
pub use webhook::webhook_handler;

/// Shared application state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Secret for Marketplace A webhook signature verification.
    webhook_secret: Vec<u8>,

    /// The durable job queue.
    queue: JobQueue,

    /// The inventory repository.
    repository: Repository,

    /// The Marketplace B poller (for the diagnostics endpoint).
    poller: Arc<Poller>,
}

impl AppState {
    pub fn new(
        webhook_secret: impl Into<Vec<u8>>,
        queue: JobQueue,
        repository: Repository,
        poller: Arc<Poller>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                webhook_secret: webhook_secret.into(),
                queue,
                repository,
                poller,
            }),
        }
    }

    pub fn webhook_secret(&self) -> &[u8] {
        &self.inner.webhook_secret
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn repository(&self) -> &Repository {
        &self.inner.repository
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.inner.poller
    }
}

/// The uniform response envelope every endpoint returns.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn ok_with_message(message: impl Into<String>, data: T) -> Self {
        ApiResponse {
            success: true,
            message: Some(message.into()),
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> ApiResponse<T> {
        ApiResponse {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhooks/marketplace-a", post(webhook_handler))
        .route("/inventory/{product_id}", get(inventory_handler))
        .route("/inventory/{product_id}/audit", get(audit_handler))
        .route("/health", get(health_handler))
        .route("/trigger-poll", post(trigger_poll_handler))
        .with_state(app_state)
}

/// Diagnostics: runs one polling cycle synchronously and reports the outcome.
async fn trigger_poll_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::response::Response {
    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use crate::ingest::{PollError, PollOutcome};

    match state.poller().run_cycle().await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(ApiResponse::ok_with_message("poll cycle complete", outcome)),
        )
            .into_response(),
        Err(e @ (PollError::CircuitOpen | PollError::AlreadyRunning)) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::<PollOutcome>::error(e.to_string())),
        )
            .into_response(),
        Err(e @ PollError::Upstream { .. }) => (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::<PollOutcome>::error(e.to_string())),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<PollOutcome>::error(e.to_string())),
        )
            .into_response(),
    }
}
