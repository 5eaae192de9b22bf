//! Admin billing endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

use crate::services::{
    BillingPeriod, ClientInvoiceOutcome, DeliveryResult, DeliveryStatus, GenerationResult,
    GenerationSummary,
};
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct PeriodsResponse {
    pub timezone: String,
    pub current: BillingPeriod,
    pub previous: BillingPeriod,
}

/// Current and previous billing windows, for display.
pub async fn periods(State(state): State<AppState>) -> Json<PeriodsResponse> {
    let calculator = state.generator.calculator();
    let now = Utc::now();
    Json(PeriodsResponse {
        timezone: calculator.timezone().name().to_string(),
        current: calculator.current_period(now),
        previous: calculator.previous_period(now),
    })
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub summary: GenerationSummary,
    pub results: Vec<GenerationResult>,
}

/// Run weekly generation for the period that just closed.
pub async fn generate_weekly(
    State(state): State<AppState>,
) -> Result<Json<GenerateResponse>, AppError> {
    let results = state.generator.generate_weekly_invoices().await?;
    Ok(Json(GenerateResponse {
        summary: GenerationSummary::from_results(&results),
        results,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateClientRequest {
    /// Create a correction invoice even if the period is already invoiced.
    #[serde(default)]
    pub force: bool,
}

/// Generate the previous period's invoice for one client.
pub async fn generate_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    payload: Option<Json<GenerateClientRequest>>,
) -> Result<Response, AppError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();

    let client = state
        .store
        .get_user(client_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Client {} not found", client_id)))?;

    let now = Utc::now();
    let period = state.generator.calculator().previous_period(now);

    tracing::info!(
        client_id = %client_id,
        force = request.force,
        period_start = %period.start,
        "Generating client invoice"
    );

    let response = match state
        .generator
        .generate_client_invoice(&client, &period, request.force, now)
        .await?
    {
        ClientInvoiceOutcome::Created(created) => {
            (StatusCode::CREATED, Json(json!(created))).into_response()
        }
        ClientInvoiceOutcome::NothingToBill => (
            StatusCode::OK,
            Json(json!({ "outcome": "nothing_to_bill", "period": period })),
        )
            .into_response(),
        ClientInvoiceOutcome::AlreadyInvoiced(existing) => (
            StatusCode::OK,
            Json(json!({
                "outcome": "already_invoiced",
                "invoice_id": existing.invoice_id,
                "invoice_number": existing.invoice_number,
            })),
        )
            .into_response(),
    };

    Ok(response)
}

/// Send one invoice through the gateway and notify.
pub async fn send_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state
        .dispatcher
        .send_invoice_with_notification(invoice_id)
        .await?
    {
        Ok(Json(json!({ "invoice_id": invoice_id, "sent": true })))
    } else {
        Err(AppError::BadGateway(
            "the payment gateway did not accept the invoice; see logs".to_string(),
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct SendPendingResponse {
    pub sent: usize,
    pub failed: usize,
    pub results: Vec<DeliveryResult>,
}

/// Send every pending draft.
pub async fn send_pending(
    State(state): State<AppState>,
) -> Result<Json<SendPendingResponse>, AppError> {
    let results = state
        .dispatcher
        .send_all_pending_invoices_with_notifications()
        .await?;
    let sent = results
        .iter()
        .filter(|r| r.status == DeliveryStatus::Sent)
        .count();

    Ok(Json(SendPendingResponse {
        sent,
        failed: results.len() - sent,
        results,
    }))
}
