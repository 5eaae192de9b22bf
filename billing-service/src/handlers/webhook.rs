//! Payment gateway webhook endpoint.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::services::WebhookError;
use crate::startup::AppState;

/// Headers the signature may arrive in, in order of preference.
pub const SIGNATURE_HEADERS: [&str; 2] = ["stripe-signature", "signature"];

/// Receive a gateway event.
///
/// The raw body is verified before anything else. Every verified delivery is
/// acknowledged with `{"received": true}`, including events for unknown
/// invoices and unhandled types; only store failures answer 500 so the
/// gateway retries.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let signature = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok());

    match state.reconciler.handle(&body, signature).await {
        Ok(outcome) => {
            tracing::debug!(outcome = ?outcome, "Webhook processed");
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(WebhookError::InvalidSignature(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid signature" })),
        )
            .into_response(),
        Err(WebhookError::InvalidPayload(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid payload" })),
        )
            .into_response(),
        Err(WebhookError::Store(e)) => {
            tracing::error!(error = %e, "Webhook processing failed");
            e.into_response()
        }
    }
}
