//! Invoice model and lifecycle for billing-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Overdue,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Void => "void",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sent" => InvoiceStatus::Sent,
            "paid" => InvoiceStatus::Paid,
            "overdue" => InvoiceStatus::Overdue,
            "void" => InvoiceStatus::Void,
            _ => InvoiceStatus::Draft,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Void)
    }

    /// Next status for `event`, or `None` when the event does not apply.
    pub fn transition(self, event: InvoiceEvent) -> Option<InvoiceStatus> {
        if event.sources().contains(&self) {
            Some(event.target())
        } else {
            None
        }
    }
}

/// Things that move an invoice through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceEvent {
    /// Pushed, finalized and sent through the gateway by us.
    Delivered,
    /// The gateway reports it sent the invoice itself.
    GatewaySent,
    PaymentSucceeded,
    PaymentFailed,
    Voided,
}

impl InvoiceEvent {
    /// Statuses the event may be applied to.
    pub fn sources(&self) -> &'static [InvoiceStatus] {
        match self {
            InvoiceEvent::Delivered | InvoiceEvent::GatewaySent => &[InvoiceStatus::Draft],
            InvoiceEvent::PaymentSucceeded => &[InvoiceStatus::Sent, InvoiceStatus::Overdue],
            InvoiceEvent::PaymentFailed => &[InvoiceStatus::Sent],
            InvoiceEvent::Voided => &[
                InvoiceStatus::Draft,
                InvoiceStatus::Sent,
                InvoiceStatus::Overdue,
            ],
        }
    }

    pub fn target(&self) -> InvoiceStatus {
        match self {
            InvoiceEvent::Delivered | InvoiceEvent::GatewaySent => InvoiceStatus::Sent,
            InvoiceEvent::PaymentSucceeded => InvoiceStatus::Paid,
            InvoiceEvent::PaymentFailed => InvoiceStatus::Overdue,
            InvoiceEvent::Voided => InvoiceStatus::Void,
        }
    }
}

/// Weekly invoice for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    /// `INV-YYYYMM-NNNN`
    pub invoice_number: String,
    pub client_id: Uuid,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub subtotal: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub status: InvoiceStatus,
    pub gateway_invoice_id: Option<String>,
    pub due_date: NaiveDate,
    pub sent_utc: Option<DateTime<Utc>>,
    pub paid_utc: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

/// Metadata key holding the gateway invoice id while a send is in flight.
pub const PENDING_GATEWAY_INVOICE_KEY: &str = "pending_gateway_invoice_id";

impl Invoice {
    /// Hosted payment page recorded after a gateway send.
    pub fn hosted_invoice_url(&self) -> Option<&str> {
        self.metadata
            .get("hosted_invoice_url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Gateway invoice created by an earlier send attempt that never got
    /// recorded as sent.
    pub fn pending_gateway_invoice_id(&self) -> Option<&str> {
        self.metadata
            .get(PENDING_GATEWAY_INVOICE_KEY)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn invoice_pdf_url(&self) -> Option<&str> {
        self.metadata
            .get("invoice_pdf")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Pending invoices are drafts the gateway has never seen.
    pub fn is_pending(&self) -> bool {
        self.status == InvoiceStatus::Draft && self.gateway_invoice_id.is_none()
    }
}

/// One line per contract on an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub item_id: Uuid,
    pub invoice_id: Uuid,
    pub contract_id: Uuid,
    pub description: String,
    /// Hours for hourly work, 1 for fixed monthly work.
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
    pub metadata: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceWithItems {
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
}

/// Input for creating a draft invoice with its items in one write.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub client_id: Uuid,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub currency: String,
    pub due_date: NaiveDate,
    pub metadata: serde_json::Value,
    pub items: Vec<NewInvoiceItem>,
}

impl NewInvoice {
    /// Exact sum of item amounts.
    pub fn total(&self) -> Decimal {
        self.items.iter().map(|item| item.amount).sum()
    }
}

#[derive(Debug, Clone)]
pub struct NewInvoiceItem {
    pub contract_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
    pub metadata: serde_json::Value,
}

/// Shallow merge of `patch` into `target`; non-object targets are replaced.
pub fn merge_metadata(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target.as_object_mut(), patch) {
        (Some(existing), serde_json::Value::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key, value);
            }
        }
        (_, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_delivery_moves_a_draft_to_sent() {
        assert_eq!(
            InvoiceStatus::Draft.transition(InvoiceEvent::Delivered),
            Some(InvoiceStatus::Sent)
        );
        assert_eq!(InvoiceStatus::Draft.transition(InvoiceEvent::PaymentSucceeded), None);
        assert_eq!(InvoiceStatus::Draft.transition(InvoiceEvent::PaymentFailed), None);
    }

    #[test]
    fn payment_events_resolve_sent_invoices() {
        assert_eq!(
            InvoiceStatus::Sent.transition(InvoiceEvent::PaymentSucceeded),
            Some(InvoiceStatus::Paid)
        );
        assert_eq!(
            InvoiceStatus::Sent.transition(InvoiceEvent::PaymentFailed),
            Some(InvoiceStatus::Overdue)
        );
        assert_eq!(
            InvoiceStatus::Overdue.transition(InvoiceEvent::PaymentSucceeded),
            Some(InvoiceStatus::Paid)
        );
    }

    #[test]
    fn terminal_states_do_not_move() {
        for event in [
            InvoiceEvent::Delivered,
            InvoiceEvent::GatewaySent,
            InvoiceEvent::PaymentSucceeded,
            InvoiceEvent::PaymentFailed,
            InvoiceEvent::Voided,
        ] {
            assert_eq!(InvoiceStatus::Paid.transition(event), None);
            assert_eq!(InvoiceStatus::Void.transition(event), None);
        }
    }

    #[test]
    fn stale_gateway_sent_does_not_rewind() {
        assert_eq!(InvoiceStatus::Paid.transition(InvoiceEvent::GatewaySent), None);
        assert_eq!(InvoiceStatus::Sent.transition(InvoiceEvent::GatewaySent), None);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            InvoiceStatus::Draft,
            InvoiceStatus::Sent,
            InvoiceStatus::Paid,
            InvoiceStatus::Overdue,
            InvoiceStatus::Void,
        ] {
            assert_eq!(InvoiceStatus::from_string(status.as_str()), status);
        }
    }

    #[test]
    fn merge_metadata_keeps_existing_keys() {
        let mut metadata = json!({ "hosted_invoice_url": "https://pay/1" });
        merge_metadata(&mut metadata, json!({ "notification_sent": true }));
        assert_eq!(
            metadata,
            json!({ "hosted_invoice_url": "https://pay/1", "notification_sent": true })
        );

        let mut empty = serde_json::Value::Null;
        merge_metadata(&mut empty, json!({ "a": 1 }));
        assert_eq!(empty, json!({ "a": 1 }));
    }
}
