//! Data access for the billing core.
//!
//! [`BillingStore`] hands out fully resolved value objects: a contract comes
//! with its work, freelancer and period tasks, or the call fails with an
//! explicit error. Status changes are compare-and-set on the current status,
//! so two writers racing on one invoice cannot both win.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{
    Contract, ContractBilling, Invoice, InvoiceEvent, InvoiceItem, InvoiceWithItems, NewContract,
    NewInvoice, User,
};
use crate::services::period::BillingPeriod;

pub use memory::InMemoryStore;
pub use postgres::Database;

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Clients owning at least one work with a billable task that started in `period`.
    async fn clients_with_billable_tasks(
        &self,
        period: &BillingPeriod,
    ) -> Result<Vec<User>, AppError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError>;

    /// Contracts on the client's works that have billable tasks in `period`,
    /// each carrying only those tasks.
    async fn contracts_for_client(
        &self,
        client_id: Uuid,
        period: &BillingPeriod,
    ) -> Result<Vec<ContractBilling>, AppError>;

    /// Highest numeric suffix among invoice numbers starting with `prefix`
    /// (e.g. `INV-202403-`), or 0 when the month has none.
    async fn max_invoice_sequence(&self, prefix: &str) -> Result<i64, AppError>;

    /// A non-void invoice already covering exactly this client and period.
    async fn find_invoice_for_period(
        &self,
        client_id: Uuid,
        period: &BillingPeriod,
    ) -> Result<Option<Invoice>, AppError>;

    /// Insert a draft invoice and all of its items atomically.
    async fn create_invoice(
        &self,
        invoice_number: &str,
        input: &NewInvoice,
    ) -> Result<InvoiceWithItems, AppError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    async fn get_invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError>;

    async fn find_invoice_by_gateway_id(
        &self,
        gateway_invoice_id: &str,
    ) -> Result<Option<Invoice>, AppError>;

    /// Drafts never pushed to the gateway, oldest first.
    async fn list_pending_invoices(&self) -> Result<Vec<Invoice>, AppError>;

    /// Record a successful gateway delivery. Applies only to drafts; returns
    /// `None` if the invoice is missing or has already moved on.
    async fn mark_invoice_sent(
        &self,
        invoice_id: Uuid,
        gateway_invoice_id: &str,
        sent_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<Option<Invoice>, AppError>;

    /// Apply `event` if the invoice's current status allows it. Returns the
    /// updated invoice, or `None` when nothing changed.
    async fn apply_invoice_event(
        &self,
        invoice_id: Uuid,
        event: InvoiceEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError>;

    async fn merge_invoice_metadata(
        &self,
        invoice_id: Uuid,
        patch: serde_json::Value,
    ) -> Result<Option<Invoice>, AppError>;

    async fn set_gateway_customer_id(
        &self,
        user_id: Uuid,
        gateway_customer_id: &str,
    ) -> Result<(), AppError>;

    /// Assign a freelancer to a work. A work holds at most one contract.
    async fn create_contract(&self, input: &NewContract) -> Result<Contract, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}
