//! In-memory store used by tests and local runs without PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::BillingStore;
use crate::models::{
    merge_metadata, Contract, ContractBilling, Invoice, InvoiceEvent, InvoiceItem, InvoiceStatus,
    InvoiceWithItems, NewContract, NewInvoice, Task, User, Work,
};
use crate::services::period::BillingPeriod;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    works: HashMap<Uuid, Work>,
    contracts: Vec<Contract>,
    tasks: Vec<Task>,
    invoices: Vec<Invoice>,
    items: Vec<InvoiceItem>,
}

impl State {
    fn billable_tasks<'a>(
        &'a self,
        contract_id: Uuid,
        period: &'a BillingPeriod,
    ) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks.iter().filter(move |t| {
            t.is_billable && t.contract_id == Some(contract_id) && period.contains(t.start_time)
        })
    }

    fn invoice_mut(&mut self, invoice_id: Uuid) -> Option<&mut Invoice> {
        self.invoices.iter_mut().find(|i| i.invoice_id == invoice_id)
    }
}

/// Thread-safe store keeping everything in process memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.user_id, user);
    }

    pub async fn insert_work(&self, work: Work) {
        self.state.write().await.works.insert(work.work_id, work);
    }

    /// Inserts without checking references, so tests can seed broken data.
    pub async fn insert_contract(&self, contract: Contract) {
        self.state.write().await.contracts.push(contract);
    }

    pub async fn insert_task(&self, task: Task) {
        self.state.write().await.tasks.push(task);
    }

    pub async fn invoices(&self) -> Vec<Invoice> {
        self.state.read().await.invoices.clone()
    }

    pub async fn user(&self, user_id: Uuid) -> Option<User> {
        self.state.read().await.users.get(&user_id).cloned()
    }

    /// Overwrite an invoice's status directly, bypassing the lifecycle.
    pub async fn force_status(&self, invoice_id: Uuid, status: InvoiceStatus) {
        if let Some(invoice) = self.state.write().await.invoice_mut(invoice_id) {
            invoice.status = status;
        }
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn clients_with_billable_tasks(
        &self,
        period: &BillingPeriod,
    ) -> Result<Vec<User>, AppError> {
        let state = self.state.read().await;

        let mut client_ids: Vec<Uuid> = Vec::new();
        for contract in &state.contracts {
            if state.billable_tasks(contract.contract_id, period).next().is_none() {
                continue;
            }
            if let Some(work) = state.works.get(&contract.work_id) {
                if !client_ids.contains(&work.client_id) {
                    client_ids.push(work.client_id);
                }
            }
        }

        let mut clients: Vec<User> = client_ids
            .iter()
            .filter_map(|id| state.users.get(id).cloned())
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name).then(a.user_id.cmp(&b.user_id)));
        Ok(clients)
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn contracts_for_client(
        &self,
        client_id: Uuid,
        period: &BillingPeriod,
    ) -> Result<Vec<ContractBilling>, AppError> {
        let state = self.state.read().await;
        let mut result = Vec::new();

        for contract in &state.contracts {
            let tasks: Vec<Task> = state
                .billable_tasks(contract.contract_id, period)
                .cloned()
                .collect();
            if tasks.is_empty() {
                continue;
            }

            // A contract whose work is gone belongs to no client.
            let Some(work) = state.works.get(&contract.work_id) else {
                continue;
            };
            if work.client_id != client_id {
                continue;
            }

            let freelancer = state.users.get(&contract.freelancer_id).ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Freelancer {} for contract {} not found",
                    contract.freelancer_id,
                    contract.contract_id
                ))
            })?;

            result.push(ContractBilling {
                contract: contract.clone(),
                work: work.clone(),
                freelancer: freelancer.clone(),
                tasks,
            });
        }

        Ok(result)
    }

    async fn max_invoice_sequence(&self, prefix: &str) -> Result<i64, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .iter()
            .filter_map(|i| i.invoice_number.strip_prefix(prefix))
            .filter_map(|suffix| suffix.parse::<i64>().ok())
            .max()
            .unwrap_or(0))
    }

    async fn find_invoice_for_period(
        &self,
        client_id: Uuid,
        period: &BillingPeriod,
    ) -> Result<Option<Invoice>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .iter()
            .find(|i| {
                i.client_id == client_id
                    && i.billing_period_start == period.start
                    && i.billing_period_end == period.end
                    && i.status != InvoiceStatus::Void
            })
            .cloned())
    }

    async fn create_invoice(
        &self,
        invoice_number: &str,
        input: &NewInvoice,
    ) -> Result<InvoiceWithItems, AppError> {
        let mut state = self.state.write().await;

        if state
            .invoices
            .iter()
            .any(|i| i.invoice_number == invoice_number)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice number {} already exists",
                invoice_number
            )));
        }

        let now = Utc::now();
        let total = input.total();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            invoice_number: invoice_number.to_string(),
            client_id: input.client_id,
            billing_period_start: input.billing_period_start,
            billing_period_end: input.billing_period_end,
            subtotal: total,
            total,
            currency: input.currency.clone(),
            status: InvoiceStatus::Draft,
            gateway_invoice_id: None,
            due_date: input.due_date,
            sent_utc: None,
            paid_utc: None,
            metadata: input.metadata.clone(),
            created_utc: now,
        };

        let items: Vec<InvoiceItem> = input
            .items
            .iter()
            .map(|item| InvoiceItem {
                item_id: Uuid::new_v4(),
                invoice_id: invoice.invoice_id,
                contract_id: item.contract_id,
                description: item.description.clone(),
                quantity: item.quantity,
                rate: item.rate,
                amount: item.amount,
                metadata: item.metadata.clone(),
                created_utc: now,
            })
            .collect();

        state.invoices.push(invoice.clone());
        state.items.extend(items.iter().cloned());

        Ok(InvoiceWithItems { invoice, items })
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .iter()
            .find(|i| i.invoice_id == invoice_id)
            .cloned())
    }

    async fn get_invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .items
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn find_invoice_by_gateway_id(
        &self,
        gateway_invoice_id: &str,
    ) -> Result<Option<Invoice>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .iter()
            .find(|i| i.gateway_invoice_id.as_deref() == Some(gateway_invoice_id))
            .cloned())
    }

    async fn list_pending_invoices(&self) -> Result<Vec<Invoice>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .iter()
            .filter(|i| i.is_pending())
            .cloned()
            .collect())
    }

    async fn mark_invoice_sent(
        &self,
        invoice_id: Uuid,
        gateway_invoice_id: &str,
        sent_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<Option<Invoice>, AppError> {
        let mut state = self.state.write().await;
        match state.invoice_mut(invoice_id) {
            Some(invoice) if invoice.status == InvoiceStatus::Draft => {
                invoice.status = InvoiceStatus::Sent;
                invoice.gateway_invoice_id = Some(gateway_invoice_id.to_string());
                invoice.sent_utc = Some(sent_at);
                merge_metadata(&mut invoice.metadata, metadata);
                Ok(Some(invoice.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn apply_invoice_event(
        &self,
        invoice_id: Uuid,
        event: InvoiceEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let mut state = self.state.write().await;
        let Some(invoice) = state.invoice_mut(invoice_id) else {
            return Ok(None);
        };
        let Some(next) = invoice.status.transition(event) else {
            return Ok(None);
        };

        invoice.status = next;
        match next {
            InvoiceStatus::Sent => invoice.sent_utc = Some(at),
            InvoiceStatus::Paid => invoice.paid_utc = Some(at),
            _ => {}
        }
        Ok(Some(invoice.clone()))
    }

    async fn merge_invoice_metadata(
        &self,
        invoice_id: Uuid,
        patch: serde_json::Value,
    ) -> Result<Option<Invoice>, AppError> {
        let mut state = self.state.write().await;
        Ok(state.invoice_mut(invoice_id).map(|invoice| {
            merge_metadata(&mut invoice.metadata, patch);
            invoice.clone()
        }))
    }

    async fn set_gateway_customer_id(
        &self,
        user_id: Uuid,
        gateway_customer_id: &str,
    ) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("User {} not found", user_id)))?;
        user.gateway_customer_id = Some(gateway_customer_id.to_string());
        Ok(())
    }

    async fn create_contract(&self, input: &NewContract) -> Result<Contract, AppError> {
        input
            .validate()
            .map_err(|msg| AppError::BadRequest(anyhow::anyhow!(msg)))?;

        let mut state = self.state.write().await;
        if !state.works.contains_key(&input.work_id) || !state.users.contains_key(&input.freelancer_id)
        {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Work or freelancer not found"
            )));
        }
        if state.contracts.iter().any(|c| c.work_id == input.work_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Work {} already has a contract",
                input.work_id
            )));
        }

        let contract = Contract {
            contract_id: Uuid::new_v4(),
            work_id: input.work_id,
            freelancer_id: input.freelancer_id,
            agency_rate: input.agency_rate,
            created_utc: Utc::now(),
        };
        state.contracts.push(contract.clone());
        Ok(contract)
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
