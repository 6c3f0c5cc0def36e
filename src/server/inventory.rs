//! Read-only inventory query endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;

use super::{ApiResponse, AppState};
use crate::repo::{AuditRow, InventoryRow};
use crate::types::ProductId;

/// Default and maximum audit page sizes.
const DEFAULT_AUDIT_LIMIT: i64 = 50;
const MAX_AUDIT_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    limit: Option<i64>,
}

/// `GET /inventory/{product_id}` - all rows for a product, ordered by source.
pub async fn inventory_handler(
    State(app_state): State<AppState>,
    Path(product_id): Path<String>,
) -> Response {
    let product_id = match ProductId::parse(product_id) {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<Vec<InventoryRow>>::error(e.to_string())),
            )
                .into_response();
        }
    };

    match app_state.repository().get_by_product(&product_id).await {
        Ok(rows) => (StatusCode::OK, Json(ApiResponse::ok(rows))).into_response(),
        Err(e) => {
            warn!(product_id = %product_id, error = %e, "Inventory query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<Vec<InventoryRow>>::error("query failed")),
            )
                .into_response()
        }
    }
}

/// `GET /inventory/{product_id}/audit?limit=N` - recent transitions, newest
/// first.
pub async fn audit_handler(
    State(app_state): State<AppState>,
    Path(product_id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Response {
    let product_id = match ProductId::parse(product_id) {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<Vec<AuditRow>>::error(e.to_string())),
            )
                .into_response();
        }
    };

    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);

    match app_state.repository().get_audit(&product_id, limit).await {
        Ok(rows) => (StatusCode::OK, Json(ApiResponse::ok(rows))).into_response(),
        Err(e) => {
            warn!(product_id = %product_id, error = %e, "Audit query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<Vec<AuditRow>>::error("query failed")),
            )
                .into_response()
        }
    }
}
