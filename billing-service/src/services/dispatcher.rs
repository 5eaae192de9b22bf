//! Gateway delivery followed by client and admin emails.
//!
//! The gateway send is what counts: once it succeeds the invoice is sent, and
//! email failures are only logged and recorded in the invoice metadata.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::services::metrics;
use crate::services::notifier::{InvoiceNotice, NotificationKind, Notifier};
use crate::services::sender::InvoiceSender;
use crate::services::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// Per-invoice outcome of a batch send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub client_name: String,
    pub amount: Decimal,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn BillingStore>,
    sender: InvoiceSender,
    notifier: Arc<dyn Notifier>,
    admin_emails: Vec<String>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn BillingStore>,
        sender: InvoiceSender,
        notifier: Arc<dyn Notifier>,
        admin_emails: Vec<String>,
    ) -> Self {
        Self {
            store,
            sender,
            notifier,
            admin_emails,
        }
    }

    /// Send through the gateway, then notify the client and the admins.
    ///
    /// `Ok(false)` means the gateway send failed and nobody was notified.
    /// Once the gateway has sent the invoice this returns `Ok(true)`, even if
    /// the notice cannot be built or delivered.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn send_invoice_with_notification(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        if !self.sender.send_invoice_via_gateway(invoice_id).await? {
            return Ok(false);
        }

        let (client_notified, admins_notified) = match self.load_notice(invoice_id).await {
            Ok((client_email, notice)) => {
                let client_notified = self
                    .notify(&client_email, NotificationKind::InvoiceReady, &notice)
                    .await;

                let mut admins_notified = !self.admin_emails.is_empty();
                for admin in &self.admin_emails {
                    admins_notified &= self
                        .notify(admin, NotificationKind::InvoiceAdminCopy, &notice)
                        .await;
                }
                (client_notified, admins_notified)
            }
            Err(e) => {
                metrics::record_notification(NotificationKind::InvoiceReady.as_str(), "failed");
                error!(error = %e, "Invoice sent but its notice could not be prepared");
                (false, false)
            }
        };

        let stamp = json!({
            "notification_sent": client_notified,
            "admin_notification_sent": admins_notified,
            "notification_sent_at": Utc::now(),
        });
        if let Err(e) = self.store.merge_invoice_metadata(invoice_id, stamp).await {
            warn!(error = %e, "Failed to record notification status");
        }

        info!(
            client_notified = client_notified,
            admins_notified = admins_notified,
            "Invoice delivered"
        );

        Ok(true)
    }

    /// The sent invoice as a notice, with the client's address.
    async fn load_notice(&self, invoice_id: Uuid) -> Result<(String, InvoiceNotice), AppError> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;
        let client = self.store.get_user(invoice.client_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Client {} not found", invoice.client_id))
        })?;
        let items = self.store.get_invoice_items(invoice_id).await?;

        if invoice.hosted_invoice_url().is_none() {
            warn!(
                invoice_number = %invoice.invoice_number,
                "Gateway returned no payment URL; notifying without a link"
            );
        }

        Ok((client.email, InvoiceNotice::new(&invoice, &items, &client.name)))
    }

    async fn notify(&self, recipient: &str, kind: NotificationKind, notice: &InvoiceNotice) -> bool {
        match self.notifier.send(recipient, kind, notice).await {
            Ok(()) => {
                metrics::record_notification(kind.as_str(), "sent");
                true
            }
            Err(e) => {
                metrics::record_notification(kind.as_str(), "failed");
                error!(
                    recipient = %recipient,
                    kind = kind.as_str(),
                    invoice_number = %notice.invoice_number,
                    error = %e,
                    "Invoice notification failed"
                );
                false
            }
        }
    }

    /// Send every pending draft, one at a time, collecting each outcome.
    #[instrument(skip(self))]
    pub async fn send_all_pending_invoices_with_notifications(
        &self,
    ) -> Result<Vec<DeliveryResult>, AppError> {
        let pending = self.store.list_pending_invoices().await?;
        info!(count = pending.len(), "Sending pending invoices");

        let mut results = Vec::with_capacity(pending.len());
        for invoice in pending {
            let client_name = match self.store.get_user(invoice.client_id).await {
                Ok(Some(client)) => client.name,
                _ => "unknown".to_string(),
            };

            let (status, error) = match self
                .send_invoice_with_notification(invoice.invoice_id)
                .await
            {
                Ok(true) => (DeliveryStatus::Sent, None),
                Ok(false) => (
                    DeliveryStatus::Failed,
                    Some("gateway send failed".to_string()),
                ),
                Err(e) => {
                    error!(
                        invoice_number = %invoice.invoice_number,
                        error = %e,
                        "Pending invoice send failed"
                    );
                    (DeliveryStatus::Failed, Some(e.to_string()))
                }
            };

            results.push(DeliveryResult {
                invoice_id: invoice.invoice_id,
                invoice_number: invoice.invoice_number,
                client_name,
                amount: invoice.total,
                status,
                error,
            });
        }

        let sent = results
            .iter()
            .filter(|r| r.status == DeliveryStatus::Sent)
            .count();
        info!(
            sent = sent,
            failed = results.len() - sent,
            "Pending invoice run finished"
        );

        Ok(results)
    }
}
