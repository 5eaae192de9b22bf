//! Pushes draft invoices to the payment gateway.
//!
//! A send creates the gateway invoice, attaches one line per local item,
//! finalizes it and asks the gateway to deliver it. Only after all of that
//! succeeds is the local invoice marked sent. Gateway failures are logged by
//! category and reported as `Ok(false)`; gateway calls are not retried here.
//!
//! The gateway invoice id is noted in the local metadata as soon as it
//! exists. If a later step dies, the next send picks that invoice up again
//! instead of billing the client twice.

use chrono::Utc;
use serde_json::json;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{Invoice, InvoiceItem, InvoiceStatus, User, PENDING_GATEWAY_INVOICE_KEY};
use crate::services::gateway::{
    CreateInvoiceItemParams, CreateInvoiceParams, GatewayError, GatewayInvoice, NewCustomer,
    PaymentGateway,
};
use crate::services::rates::to_minor_units;
use crate::services::store::BillingStore;

/// Local writes after a gateway send get this many tries.
const RECORD_ATTEMPTS: u64 = 3;

#[derive(Clone)]
pub struct InvoiceSender {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    days_until_due: u32,
}

impl InvoiceSender {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        days_until_due: u32,
    ) -> Self {
        Self {
            store,
            gateway,
            days_until_due,
        }
    }

    /// Send one draft invoice through the gateway.
    ///
    /// Returns `Ok(true)` once the gateway has sent the invoice and the local
    /// record is updated, `Ok(false)` on any gateway failure. A missing
    /// invoice is `NotFound`; an invoice that is not a draft is `BadRequest`.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn send_invoice_via_gateway(&self, invoice_id: Uuid) -> Result<bool, AppError> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        if invoice.status != InvoiceStatus::Draft {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Invoice {} is {} and cannot be sent",
                invoice.invoice_number,
                invoice.status.as_str()
            )));
        }

        let client = self.store.get_user(invoice.client_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Client {} not found", invoice.client_id))
        })?;
        let items = self.store.get_invoice_items(invoice_id).await?;

        let pushed = match self.resume(&invoice).await {
            Ok(Some(resumed)) => Ok(resumed),
            Ok(None) => self.push(&invoice, &client, &items).await,
            Err(e) => Err(e),
        };
        let sent = match pushed {
            Ok(sent) => sent,
            Err(e) => {
                log_gateway_error(&invoice, &e);
                return Ok(false);
            }
        };

        self.record_sent(&invoice, &sent).await?;
        Ok(true)
    }

    /// Pick up a gateway invoice an earlier attempt left behind.
    ///
    /// An open invoice is sent again and a paid one is taken as is. Anything
    /// else, including a lookup failure, starts over with a fresh invoice.
    async fn resume(&self, invoice: &Invoice) -> Result<Option<GatewayInvoice>, GatewayError> {
        let Some(gateway_id) = invoice.pending_gateway_invoice_id() else {
            return Ok(None);
        };

        let existing = match self.gateway.retrieve_invoice(gateway_id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(
                    invoice_number = %invoice.invoice_number,
                    gateway_invoice_id = %gateway_id,
                    error = %e,
                    "Earlier gateway invoice unreadable, starting over"
                );
                return Ok(None);
            }
        };

        match existing.status.as_deref() {
            Some("open") => {
                info!(
                    invoice_number = %invoice.invoice_number,
                    gateway_invoice_id = %existing.id,
                    "Resuming earlier gateway invoice"
                );
                let sent = self.gateway.send_invoice(&existing.id).await?;
                Ok(Some(GatewayInvoice {
                    hosted_invoice_url: sent.hosted_invoice_url.or(existing.hosted_invoice_url),
                    invoice_pdf: sent.invoice_pdf.or(existing.invoice_pdf),
                    ..sent
                }))
            }
            Some("paid") => Ok(Some(existing)),
            status => {
                warn!(
                    invoice_number = %invoice.invoice_number,
                    gateway_invoice_id = %existing.id,
                    status = ?status,
                    "Abandoning earlier gateway invoice"
                );
                Ok(None)
            }
        }
    }

    /// Mark the local invoice sent, retrying the write a few times.
    async fn record_sent(&self, invoice: &Invoice, sent: &GatewayInvoice) -> Result<(), AppError> {
        let metadata = json!({
            "hosted_invoice_url": sent.hosted_invoice_url,
            "invoice_pdf": sent.invoice_pdf,
            "gateway_status": sent.status,
        });

        let mut attempt = 1;
        let marked = loop {
            match self
                .store
                .mark_invoice_sent(invoice.invoice_id, &sent.id, Utc::now(), metadata.clone())
                .await
            {
                Ok(marked) => break marked,
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    warn!(
                        invoice_number = %invoice.invoice_number,
                        attempt = attempt,
                        error = %e,
                        "Failed to record gateway send, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        invoice_number = %invoice.invoice_number,
                        gateway_invoice_id = %sent.id,
                        error = %e,
                        "Invoice sent at the gateway but not recorded; the next send resumes it"
                    );
                    return Err(e);
                }
            }
        };

        match marked {
            Some(_) => {
                info!(
                    invoice_number = %invoice.invoice_number,
                    gateway_invoice_id = %sent.id,
                    "Invoice sent via gateway"
                );
            }
            None => {
                // Sent by a concurrent caller; keep the gateway links anyway.
                warn!(
                    invoice_number = %invoice.invoice_number,
                    gateway_invoice_id = %sent.id,
                    "Invoice left draft while sending"
                );
                self.store.merge_invoice_metadata(invoice.invoice_id, metadata).await?;
            }
        }

        Ok(())
    }

    async fn push(
        &self,
        invoice: &Invoice,
        client: &User,
        items: &[InvoiceItem],
    ) -> Result<GatewayInvoice, GatewayError> {
        let customer_id = self.resolve_customer(client).await?;

        let gateway_invoice = self
            .gateway
            .create_invoice(&CreateInvoiceParams {
                customer_id: customer_id.clone(),
                currency: invoice.currency.clone(),
                days_until_due: self.days_until_due,
                description: Some(format!(
                    "Invoice {} for {} to {}",
                    invoice.invoice_number,
                    invoice.billing_period_start.date_naive(),
                    invoice.billing_period_end.date_naive()
                )),
                metadata: BTreeMap::from([
                    ("invoice_id".to_string(), invoice.invoice_id.to_string()),
                    ("invoice_number".to_string(), invoice.invoice_number.clone()),
                ]),
            })
            .await?;
        self.note_pending(invoice, &gateway_invoice.id).await;

        for (index, item) in items.iter().enumerate() {
            let params = CreateInvoiceItemParams {
                customer_id: customer_id.clone(),
                invoice_id: gateway_invoice.id.clone(),
                amount: to_minor_units(item.amount),
                currency: invoice.currency.clone(),
                description: item.description.clone(),
                metadata: item_metadata(item),
            };
            if let Err(e) = self.gateway.create_invoice_item(&params).await {
                error!(
                    invoice_number = %invoice.invoice_number,
                    item_index = index,
                    item_id = %item.item_id,
                    contract_id = %item.contract_id,
                    amount = params.amount,
                    error = %e,
                    "Gateway rejected invoice item"
                );
                return Err(e);
            }
        }

        let finalized = self.gateway.finalize_invoice(&gateway_invoice.id).await?;
        let sent = self.gateway.send_invoice(&finalized.id).await?;

        Ok(GatewayInvoice {
            hosted_invoice_url: sent.hosted_invoice_url.or(finalized.hosted_invoice_url),
            invoice_pdf: sent.invoice_pdf.or(finalized.invoice_pdf),
            ..sent
        })
    }

    async fn note_pending(&self, invoice: &Invoice, gateway_invoice_id: &str) {
        let mut marker = serde_json::Map::new();
        marker.insert(
            PENDING_GATEWAY_INVOICE_KEY.to_string(),
            json!(gateway_invoice_id),
        );
        if let Err(e) = self
            .store
            .merge_invoice_metadata(invoice.invoice_id, serde_json::Value::Object(marker))
            .await
        {
            warn!(
                invoice_number = %invoice.invoice_number,
                gateway_invoice_id = %gateway_invoice_id,
                error = %e,
                "Failed to note gateway invoice id"
            );
        }
    }

    /// Cached gateway customer, or a fresh one when the lookup fails.
    async fn resolve_customer(&self, client: &User) -> Result<String, GatewayError> {
        if let Some(cached) = &client.gateway_customer_id {
            match self.gateway.retrieve_customer(cached).await {
                Ok(customer) => return Ok(customer.id),
                Err(e) => warn!(
                    client_id = %client.user_id,
                    gateway_customer_id = %cached,
                    error = %e,
                    "Cached gateway customer unusable, creating a new one"
                ),
            }
        }

        let customer = self
            .gateway
            .create_customer(&NewCustomer {
                email: client.email.clone(),
                name: client.name.clone(),
                metadata: BTreeMap::from([("user_id".to_string(), client.user_id.to_string())]),
            })
            .await?;

        if let Err(e) = self
            .store
            .set_gateway_customer_id(client.user_id, &customer.id)
            .await
        {
            warn!(
                client_id = %client.user_id,
                error = %e,
                "Failed to store gateway customer id"
            );
        }

        Ok(customer.id)
    }
}

fn item_metadata(item: &InvoiceItem) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::from([
        ("item_id".to_string(), item.item_id.to_string()),
        ("contract_id".to_string(), item.contract_id.to_string()),
        ("quantity".to_string(), item.quantity.to_string()),
        ("rate".to_string(), item.rate.to_string()),
    ]);
    for key in ["work_id", "freelancer_id"] {
        if let Some(value) = item.metadata.get(key).and_then(|v| v.as_str()) {
            metadata.insert(key.to_string(), value.to_string());
        }
    }
    metadata
}

fn log_gateway_error(invoice: &Invoice, e: &GatewayError) {
    match e {
        GatewayError::InvalidRequest { message, param } => error!(
            invoice_number = %invoice.invoice_number,
            total = %invoice.total,
            param = ?param,
            message = %message,
            "Gateway rejected invoice request"
        ),
        GatewayError::Authentication(message) => error!(
            invoice_number = %invoice.invoice_number,
            message = %message,
            "Gateway authentication failed; check the secret key"
        ),
        GatewayError::Connection(message) => error!(
            invoice_number = %invoice.invoice_number,
            message = %message,
            "Could not reach the gateway"
        ),
        GatewayError::Api { status, message } => error!(
            invoice_number = %invoice.invoice_number,
            status = ?status,
            message = %message,
            "Gateway error while sending invoice"
        ),
    }
}
