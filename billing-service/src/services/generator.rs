//! Weekly invoice generation.
//!
//! One draft invoice per client per billing period, one item per contract
//! that has something to charge. Clients are processed independently so a
//! broken record fails only its own client.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{
    ContractBilling, ContractType, Invoice, InvoiceWithItems, NewInvoice, NewInvoiceItem, User,
};
use crate::services::metrics;
use crate::services::period::{BillingPeriod, BillingPeriodCalculator};
use crate::services::rates::{calculate_earnings, line_charge, round_money, total_billable_hours};
use crate::services::store::BillingStore;

/// Attempts at claiming an invoice number before giving up.
const NUMBER_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub currency: String,
    pub days_until_due: i64,
    /// Allow a second non-void invoice for the same client and period.
    pub allow_duplicate_periods: bool,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            currency: "usd".to_string(),
            days_until_due: 30,
            allow_duplicate_periods: false,
        }
    }
}

/// Per-client outcome of a generation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerationResult {
    Generated {
        client_id: Uuid,
        client_name: String,
        invoice_id: Uuid,
        invoice_number: String,
        amount: Decimal,
    },
    Skipped {
        client_id: Uuid,
        client_name: String,
        reason: String,
    },
    Failed {
        client_id: Uuid,
        client_name: String,
        error: String,
    },
}

impl GenerationResult {
    pub fn client_name(&self) -> &str {
        match self {
            GenerationResult::Generated { client_name, .. }
            | GenerationResult::Skipped { client_name, .. }
            | GenerationResult::Failed { client_name, .. } => client_name,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            GenerationResult::Generated { .. } => "generated",
            GenerationResult::Skipped { .. } => "skipped",
            GenerationResult::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl GenerationSummary {
    pub fn from_results(results: &[GenerationResult]) -> Self {
        results.iter().fold(Self::default(), |mut acc, result| {
            match result {
                GenerationResult::Generated { .. } => acc.generated += 1,
                GenerationResult::Skipped { .. } => acc.skipped += 1,
                GenerationResult::Failed { .. } => acc.failed += 1,
            }
            acc
        })
    }
}

/// What happened when invoicing a single client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientInvoiceOutcome {
    Created(InvoiceWithItems),
    /// No contract had chargeable work in the period.
    NothingToBill,
    /// A non-void invoice already covers this client and period.
    AlreadyInvoiced(Invoice),
}

#[derive(Clone)]
pub struct InvoiceGenerator {
    store: Arc<dyn BillingStore>,
    calculator: BillingPeriodCalculator,
    settings: GeneratorSettings,
}

impl InvoiceGenerator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        calculator: BillingPeriodCalculator,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            store,
            calculator,
            settings,
        }
    }

    pub fn calculator(&self) -> &BillingPeriodCalculator {
        &self.calculator
    }

    /// Invoice every client with billable work in the week that just closed.
    pub async fn generate_weekly_invoices(&self) -> Result<Vec<GenerationResult>, AppError> {
        self.generate_weekly_invoices_at(Utc::now()).await
    }

    /// Same as [`Self::generate_weekly_invoices`] with an explicit clock.
    #[instrument(skip(self))]
    pub async fn generate_weekly_invoices_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<GenerationResult>, AppError> {
        let period = self.calculator.previous_period(now);
        let clients = self.store.clients_with_billable_tasks(&period).await?;

        info!(
            period_start = %period.start,
            period_end = %period.end,
            clients = clients.len(),
            "Starting weekly invoice generation"
        );

        let mut results = Vec::with_capacity(clients.len());
        for client in &clients {
            let result = match self
                .generate_client_invoice(client, &period, false, now)
                .await
            {
                Ok(outcome) => Self::summarize(client, outcome),
                Err(e) => {
                    error!(
                        client_id = %client.user_id,
                        client_name = %client.name,
                        error = %e,
                        "Invoice generation failed for client"
                    );
                    GenerationResult::Failed {
                        client_id: client.user_id,
                        client_name: client.name.clone(),
                        error: e.to_string(),
                    }
                }
            };
            metrics::record_generation(result.outcome());
            results.push(result);
        }

        let summary = GenerationSummary::from_results(&results);
        info!(
            generated = summary.generated,
            skipped = summary.skipped,
            failed = summary.failed,
            "Weekly invoice generation finished"
        );

        Ok(results)
    }

    fn summarize(client: &User, outcome: ClientInvoiceOutcome) -> GenerationResult {
        match outcome {
            ClientInvoiceOutcome::Created(created) => GenerationResult::Generated {
                client_id: client.user_id,
                client_name: client.name.clone(),
                invoice_id: created.invoice.invoice_id,
                invoice_number: created.invoice.invoice_number,
                amount: created.invoice.total,
            },
            ClientInvoiceOutcome::NothingToBill => GenerationResult::Skipped {
                client_id: client.user_id,
                client_name: client.name.clone(),
                reason: "no billable contracts".to_string(),
            },
            ClientInvoiceOutcome::AlreadyInvoiced(existing) => GenerationResult::Skipped {
                client_id: client.user_id,
                client_name: client.name.clone(),
                reason: format!("already invoiced as {}", existing.invoice_number),
            },
        }
    }

    /// Build and store the draft invoice for one client and period.
    ///
    /// `force` creates a correction invoice even when the period is already
    /// invoiced.
    #[instrument(skip(self, client), fields(client_id = %client.user_id))]
    pub async fn generate_client_invoice(
        &self,
        client: &User,
        period: &BillingPeriod,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<ClientInvoiceOutcome, AppError> {
        if !force && !self.settings.allow_duplicate_periods {
            if let Some(existing) = self
                .store
                .find_invoice_for_period(client.user_id, period)
                .await?
            {
                warn!(
                    invoice_number = %existing.invoice_number,
                    "Period already invoiced, skipping"
                );
                return Ok(ClientInvoiceOutcome::AlreadyInvoiced(existing));
            }
        }

        let contracts = self
            .store
            .contracts_for_client(client.user_id, period)
            .await?;

        let items: Vec<NewInvoiceItem> = contracts
            .iter()
            .filter_map(|billing| build_item(billing, period))
            .collect();

        if items.is_empty() {
            info!("No chargeable contracts in period");
            return Ok(ClientInvoiceOutcome::NothingToBill);
        }

        let input = NewInvoice {
            client_id: client.user_id,
            billing_period_start: period.start,
            billing_period_end: period.end,
            currency: self.settings.currency.clone(),
            due_date: (now + Duration::days(self.settings.days_until_due)).date_naive(),
            metadata: json!({}),
            items,
        };

        let created = self.insert_with_fresh_number(&input, now).await?;

        metrics::record_invoice_amount(
            &created.invoice.currency,
            created.invoice.total.to_f64().unwrap_or_default(),
        );
        info!(
            invoice_id = %created.invoice.invoice_id,
            invoice_number = %created.invoice.invoice_number,
            total = %created.invoice.total,
            items = created.items.len(),
            "Invoice generated"
        );

        Ok(ClientInvoiceOutcome::Created(created))
    }

    /// `INV-YYYYMM-NNNN`, with the month taken in the billing timezone.
    pub async fn next_invoice_number(&self, now: DateTime<Utc>) -> Result<String, AppError> {
        let prefix = self.number_prefix(now);
        let last = self.store.max_invoice_sequence(&prefix).await?;
        Ok(format!("{}{:04}", prefix, last + 1))
    }

    fn number_prefix(&self, now: DateTime<Utc>) -> String {
        let local = now.with_timezone(&self.calculator.timezone());
        format!("INV-{}-", local.format("%Y%m"))
    }

    async fn insert_with_fresh_number(
        &self,
        input: &NewInvoice,
        now: DateTime<Utc>,
    ) -> Result<InvoiceWithItems, AppError> {
        let mut attempt = 1;
        loop {
            let number = self.next_invoice_number(now).await?;
            match self.store.create_invoice(&number, input).await {
                Err(AppError::Conflict(e)) if attempt < NUMBER_ATTEMPTS => {
                    warn!(invoice_number = %number, error = %e, "Invoice number taken, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// One invoice line for a contract, or `None` when it charges nothing.
fn build_item(billing: &ContractBilling, period: &BillingPeriod) -> Option<NewInvoiceItem> {
    let work = &billing.work;
    let total_hours = total_billable_hours(&billing.tasks);
    let charge = line_charge(work.contract_type, work.rate, total_hours)?;
    let earnings = calculate_earnings(
        work.contract_type,
        work.rate,
        billing.contract.agency_rate,
        total_hours,
    );

    let description = match work.contract_type {
        ContractType::Hourly => format!(
            "{} - {} ({} hours)",
            work.title,
            billing.freelancer.name,
            total_hours.normalize()
        ),
        ContractType::Monthly => format!(
            "{} - {} (monthly fixed rate)",
            work.title, billing.freelancer.name
        ),
    };

    let task_ids: Vec<Uuid> = billing.tasks.iter().map(|t| t.task_id).collect();

    Some(NewInvoiceItem {
        contract_id: billing.contract.contract_id,
        description,
        quantity: charge.quantity,
        rate: charge.rate,
        amount: charge.amount,
        metadata: json!({
            "task_ids": task_ids,
            "contract_type": work.contract_type.as_str(),
            "work_id": work.work_id,
            "freelancer_id": billing.freelancer.user_id,
            "total_hours": total_hours.to_string(),
            "agency_rate": billing.contract.agency_rate.to_string(),
            "freelancer_earnings": round_money(earnings.freelancer_earnings).to_string(),
            "agency_earnings": round_money(earnings.agency_earnings).to_string(),
            "billing_period_start": period.start,
            "billing_period_end": period.end,
        }),
    })
}
