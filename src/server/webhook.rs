//! Marketplace A webhook endpoint.
//!
//! Accepts signed inventory updates, verifies the HMAC over the raw body,
//! normalizes the payload, and enqueues a job. The 202 response acknowledges
//! receipt only; persistence happens asynchronously in the workers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ApiResponse, AppState};
use crate::adapters::{AdapterError, MarketplaceAAdapter, SourceAdapter};
use crate::ingest::verify_signature;
use crate::queue::QueueError;

/// Header carrying the lowercase-hex HMAC-SHA256 of the body.
const HEADER_SIGNATURE: &str = "x-marketplace-signature";

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Signature missing or mismatched. The payload is untrusted and is
    /// dropped without further inspection.
    #[error("invalid signature")]
    BadSignature,

    /// The body was not valid JSON.
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The payload failed Marketplace A schema validation.
    #[error(transparent)]
    BadPayload(#[from] AdapterError),

    /// The job could not be enqueued. The caller is expected to retry the
    /// delivery.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::BadSignature => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidJson(_) | WebhookError::BadPayload(_) => StatusCode::BAD_REQUEST,
            WebhookError::QueueUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiResponse::<()>::error(self.to_string()));
        (status, body).into_response()
    }
}

/// Acknowledgment payload for an accepted webhook.
///
/// Field names are camelCase on the wire; this is the shape Marketplace A's
/// delivery tooling already expects.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAccepted {
    pub job_id: String,
    pub product_id: String,
}

/// Webhook handler.
///
/// # Request
///
/// - Method: POST
/// - Header `x-marketplace-signature`: HMAC-SHA256 of the body, lowercase hex
/// - Body: Marketplace A inventory payload (JSON)
///
/// # Responses
///
/// - 202 Accepted: job enqueued; body carries `job_id` and `product_id`
/// - 400 Bad Request: unparseable or invalid payload
/// - 401 Unauthorized: missing or wrong signature
/// - 500 Internal Server Error: enqueue failed (caller should redeliver)
///
/// The signature is verified against the exact bytes received, before any
/// JSON parsing - re-serializing would normalize whitespace and break
/// verification.
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<WebhookAccepted>>), WebhookError> {
    // Signature check comes before everything else; an unsigned body is
    // never parsed.
    let signature = headers
        .get(HEADER_SIGNATURE)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::BadSignature)?;

    if !verify_signature(&body, signature, app_state.webhook_secret()) {
        warn!("Rejected webhook with invalid signature");
        return Err(WebhookError::BadSignature);
    }

    let raw: serde_json::Value = serde_json::from_slice(&body)?;

    let record = MarketplaceAAdapter.transform(&raw)?;
    debug!(
        product_id = %record.product_id,
        quantity = record.quantity,
        "Webhook payload normalized"
    );

    let job_id = app_state.queue().enqueue(&record, 0).await?;

    info!(
        job_id = %job_id,
        product_id = %record.product_id,
        "Webhook accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok_with_message(
            "update accepted",
            WebhookAccepted {
                job_id: job_id.as_str().to_string(),
                product_id: record.product_id.to_string(),
            },
        )),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        let cases: Vec<(WebhookError, StatusCode)> = vec![
            (WebhookError::BadSignature, StatusCode::UNAUTHORIZED),
            (
                WebhookError::BadPayload(AdapterError::MissingField("product_code")),
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (error, expected) in cases {
            let response = error.into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
