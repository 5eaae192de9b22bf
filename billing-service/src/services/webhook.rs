//! Inbound gateway webhooks.
//!
//! Every request is signature checked before its body is even parsed. Known
//! invoice events move the matching local invoice through the lifecycle;
//! events for invoices we do not know and event types we do not handle are
//! acknowledged without doing anything, so the gateway stops redelivering.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use service_core::error::AppError;
use service_core::utils::signature::{verify_webhook_signature, SignatureError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::models::{InvoiceEvent, InvoiceStatus};
use crate::services::metrics;
use crate::services::store::BillingStore;

/// Gateway events the reconciler understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    PaymentSucceeded { gateway_invoice_id: String },
    PaymentFailed { gateway_invoice_id: String },
    Sent { gateway_invoice_id: String },
    Finalized { gateway_invoice_id: String },
    Unhandled { event_type: String },
}

impl GatewayEvent {
    /// Parse a raw event body.
    pub fn parse(payload: &str) -> Result<Self, WebhookError> {
        let body: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        let event_type = body
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WebhookError::InvalidPayload("missing event type".to_string()))?;

        let invoice_id = || {
            body.pointer("/data/object/id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    WebhookError::InvalidPayload(format!("{} without invoice id", event_type))
                })
        };

        Ok(match event_type {
            "invoice.payment_succeeded" => GatewayEvent::PaymentSucceeded {
                gateway_invoice_id: invoice_id()?,
            },
            "invoice.payment_failed" => GatewayEvent::PaymentFailed {
                gateway_invoice_id: invoice_id()?,
            },
            "invoice.sent" => GatewayEvent::Sent {
                gateway_invoice_id: invoice_id()?,
            },
            "invoice.finalized" => GatewayEvent::Finalized {
                gateway_invoice_id: invoice_id()?,
            },
            other => GatewayEvent::Unhandled {
                event_type: other.to_string(),
            },
        })
    }

    /// Metric label; unknown types collapse into one value.
    pub fn label(&self) -> &'static str {
        match self {
            GatewayEvent::PaymentSucceeded { .. } => "invoice.payment_succeeded",
            GatewayEvent::PaymentFailed { .. } => "invoice.payment_failed",
            GatewayEvent::Sent { .. } => "invoice.sent",
            GatewayEvent::Finalized { .. } => "invoice.finalized",
            GatewayEvent::Unhandled { .. } => "unhandled",
        }
    }

    /// The lifecycle event this gateway event drives, with its invoice id.
    fn transition(&self) -> Option<(&str, InvoiceEvent)> {
        match self {
            GatewayEvent::PaymentSucceeded { gateway_invoice_id } => {
                Some((gateway_invoice_id, InvoiceEvent::PaymentSucceeded))
            }
            GatewayEvent::PaymentFailed { gateway_invoice_id } => {
                Some((gateway_invoice_id, InvoiceEvent::PaymentFailed))
            }
            GatewayEvent::Sent { gateway_invoice_id } => {
                Some((gateway_invoice_id, InvoiceEvent::GatewaySent))
            }
            GatewayEvent::Finalized { .. } | GatewayEvent::Unhandled { .. } => None,
        }
    }
}

/// What handling an event did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        invoice_number: String,
        status: InvoiceStatus,
    },
    /// The invoice exists but its status does not accept the event.
    Ignored {
        invoice_number: String,
        status: InvoiceStatus,
    },
    UnknownInvoice,
    /// Logged only.
    Informational,
    Unhandled,
}

impl WebhookOutcome {
    fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied { .. } => "applied",
            WebhookOutcome::Ignored { .. } => "ignored",
            WebhookOutcome::UnknownInvoice => "unknown_invoice",
            WebhookOutcome::Informational => "informational",
            WebhookOutcome::Unhandled => "unhandled",
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn BillingStore>,
    secret: Secret<String>,
    tolerance_secs: i64,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn BillingStore>, secret: Secret<String>, tolerance_secs: i64) -> Self {
        Self {
            store,
            secret,
            tolerance_secs,
        }
    }

    /// Verify, parse and apply one delivery.
    pub async fn handle(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, WebhookError> {
        self.handle_at(payload, signature, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        payload: &str,
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        if let Err(e) = self.verify(payload, signature, now) {
            warn!(error = %e, "Rejected webhook with invalid signature");
            metrics::record_webhook_event("unverified", "rejected");
            return Err(e);
        }

        let event = match GatewayEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Rejected webhook with invalid payload");
                metrics::record_webhook_event("unparsed", "rejected");
                return Err(e);
            }
        };

        let outcome = self.apply(&event, now).await?;
        metrics::record_webhook_event(event.label(), outcome.label());
        Ok(outcome)
    }

    fn verify(
        &self,
        payload: &str,
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let header = signature.ok_or(SignatureError::MalformedHeader)?;
        verify_webhook_signature(
            self.secret.expose_secret(),
            payload,
            header,
            now.timestamp(),
            self.tolerance_secs,
        )?;
        Ok(())
    }

    /// Apply an already verified event.
    #[instrument(skip(self), fields(event_type = event.label()))]
    pub async fn apply(
        &self,
        event: &GatewayEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let (gateway_invoice_id, lifecycle_event) = match (event, event.transition()) {
            (_, Some(transition)) => transition,
            (GatewayEvent::Finalized { gateway_invoice_id }, None) => {
                info!(gateway_invoice_id = %gateway_invoice_id, "Gateway invoice finalized");
                return Ok(WebhookOutcome::Informational);
            }
            (GatewayEvent::Unhandled { event_type }, None) => {
                info!(event_type = %event_type, "Unhandled webhook event");
                return Ok(WebhookOutcome::Unhandled);
            }
            (_, None) => return Ok(WebhookOutcome::Unhandled),
        };

        let Some(invoice) = self
            .store
            .find_invoice_by_gateway_id(gateway_invoice_id)
            .await?
        else {
            info!(
                gateway_invoice_id = %gateway_invoice_id,
                "No local invoice for webhook event"
            );
            return Ok(WebhookOutcome::UnknownInvoice);
        };

        match self
            .store
            .apply_invoice_event(invoice.invoice_id, lifecycle_event, now)
            .await?
        {
            Some(updated) => {
                info!(
                    invoice_id = %updated.invoice_id,
                    invoice_number = %updated.invoice_number,
                    gateway_invoice_id = %gateway_invoice_id,
                    from = invoice.status.as_str(),
                    to = updated.status.as_str(),
                    "Invoice status updated from webhook"
                );
                Ok(WebhookOutcome::Applied {
                    invoice_number: updated.invoice_number,
                    status: updated.status,
                })
            }
            None => {
                // Re-read: the status may have moved since the lookup.
                let current = self
                    .store
                    .get_invoice(invoice.invoice_id)
                    .await?
                    .map(|i| i.status)
                    .unwrap_or(invoice.status);
                info!(
                    invoice_number = %invoice.invoice_number,
                    status = current.as_str(),
                    "Webhook event does not apply to invoice status"
                );
                Ok(WebhookOutcome::Ignored {
                    invoice_number: invoice.invoice_number,
                    status: current,
                })
            }
        }
    }
}
