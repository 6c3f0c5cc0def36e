//! Health check endpoint.
//!
//! Reports queue depth counters when the dependencies are reachable. Intended
//! for load balancers and orchestration probes: a 503 here means the service
//! cannot currently do useful work.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::{ApiResponse, AppState};
use crate::queue::QueueStats;

/// `GET /health`.
///
/// - 200 with queue stats when the database answers.
/// - 503 when the ping or the stats query fails.
pub async fn health_handler(State(app_state): State<AppState>) -> Response {
    if let Err(e) = app_state.repository().ping().await {
        warn!(error = %e, "Health check: database unreachable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<QueueStats>::error("database unreachable")),
        )
            .into_response();
    }

    match app_state.queue().stats().await {
        Ok(stats) => (StatusCode::OK, Json(ApiResponse::ok(stats))).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check: queue stats failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::<QueueStats>::error("queue unavailable")),
            )
                .into_response()
        }
    }
}
