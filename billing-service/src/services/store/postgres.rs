//! PostgreSQL store for billing-service.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::BillingStore;
use crate::models::{
    Contract, ContractBilling, ContractType, Invoice, InvoiceEvent, InvoiceItem, InvoiceStatus,
    InvoiceWithItems, NewContract, NewInvoice, Task, User, Work, WorkStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::period::BillingPeriod;

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, client_id, billing_period_start, \
    billing_period_end, subtotal, total, currency, status, gateway_invoice_id, due_date, \
    sent_utc, paid_utc, metadata, created_utc";

const ITEM_COLUMNS: &str =
    "item_id, invoice_id, contract_id, description, quantity, rate, amount, metadata, created_utc";

#[derive(FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    invoice_number: String,
    client_id: Uuid,
    billing_period_start: DateTime<Utc>,
    billing_period_end: DateTime<Utc>,
    subtotal: Decimal,
    total: Decimal,
    currency: String,
    status: String,
    gateway_invoice_id: Option<String>,
    due_date: NaiveDate,
    sent_utc: Option<DateTime<Utc>>,
    paid_utc: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
    created_utc: DateTime<Utc>,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            invoice_id: row.invoice_id,
            invoice_number: row.invoice_number,
            client_id: row.client_id,
            billing_period_start: row.billing_period_start,
            billing_period_end: row.billing_period_end,
            subtotal: row.subtotal,
            total: row.total,
            currency: row.currency,
            status: InvoiceStatus::from_string(&row.status),
            gateway_invoice_id: row.gateway_invoice_id,
            due_date: row.due_date,
            sent_utc: row.sent_utc,
            paid_utc: row.paid_utc,
            metadata: row.metadata,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct ItemRow {
    item_id: Uuid,
    invoice_id: Uuid,
    contract_id: Uuid,
    description: String,
    quantity: Decimal,
    rate: Decimal,
    amount: Decimal,
    metadata: serde_json::Value,
    created_utc: DateTime<Utc>,
}

impl From<ItemRow> for InvoiceItem {
    fn from(row: ItemRow) -> Self {
        InvoiceItem {
            item_id: row.item_id,
            invoice_id: row.invoice_id,
            contract_id: row.contract_id,
            description: row.description,
            quantity: row.quantity,
            rate: row.rate,
            amount: row.amount,
            metadata: row.metadata,
            created_utc: row.created_utc,
        }
    }
}

/// Contract joined with its work and (possibly missing) freelancer.
#[derive(FromRow)]
struct ContractRow {
    contract_id: Uuid,
    work_id: Uuid,
    freelancer_id: Uuid,
    agency_rate: Decimal,
    contract_created_utc: DateTime<Utc>,
    client_id: Uuid,
    title: String,
    contract_type: String,
    rate: Decimal,
    work_status: String,
    weekly_time_limit: Option<Decimal>,
    freelancer_name: Option<String>,
    freelancer_email: Option<String>,
    freelancer_gateway_customer_id: Option<String>,
}

#[derive(FromRow)]
struct TaskRow {
    task_id: Uuid,
    freelancer_id: Uuid,
    contract_id: Option<Uuid>,
    title: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    is_billable: bool,
    billable_hours: Decimal,
    status: String,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            task_id: row.task_id,
            freelancer_id: row.freelancer_id,
            contract_id: row.contract_id,
            title: row.title,
            start_time: row.start_time,
            end_time: row.end_time,
            is_billable: row.is_billable,
            billable_hours: row.billable_hours,
            status: row.status,
        }
    }
}

#[derive(FromRow)]
struct ContractInsertRow {
    contract_id: Uuid,
    work_id: Uuid,
    freelancer_id: Uuid,
    agency_rate: Decimal,
    created_utc: DateTime<Utc>,
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_invoice_where<T>(
        &self,
        operation: &str,
        clause: &str,
        bind: T,
    ) -> Result<Option<Invoice>, AppError>
    where
        T: for<'q> sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Send + 'static,
    {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let sql = format!("SELECT {} FROM invoices WHERE {}", INVOICE_COLUMNS, clause);
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error(operation, e))?;

        timer.observe_duration();

        Ok(row.map(Invoice::from))
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self))]
    async fn clients_with_billable_tasks(
        &self,
        period: &BillingPeriod,
    ) -> Result<Vec<User>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["clients_with_billable_tasks"])
            .start_timer();

        let clients = sqlx::query_as::<_, User>(
            r#"
            SELECT DISTINCT u.user_id, u.name, u.email, u.gateway_customer_id
            FROM users u
            JOIN works w ON w.client_id = u.user_id
            JOIN contracts c ON c.work_id = w.work_id
            JOIN tasks t ON t.contract_id = c.contract_id
            WHERE t.is_billable = TRUE
              AND t.start_time >= $1
              AND t.start_time < $2
            ORDER BY u.name, u.user_id
            "#,
        )
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list billable clients", e))?;

        timer.observe_duration();

        Ok(clients)
    }

    #[instrument(skip(self))]
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, User>(
            "SELECT user_id, name, email, gateway_customer_id FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get user", e))
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn contracts_for_client(
        &self,
        client_id: Uuid,
        period: &BillingPeriod,
    ) -> Result<Vec<ContractBilling>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["contracts_for_client"])
            .start_timer();

        let contracts = sqlx::query_as::<_, ContractRow>(
            r#"
            SELECT c.contract_id, c.work_id, c.freelancer_id, c.agency_rate,
                c.created_utc AS contract_created_utc,
                w.client_id, w.title, w.contract_type, w.rate, w.status AS work_status,
                w.weekly_time_limit,
                f.name AS freelancer_name, f.email AS freelancer_email,
                f.gateway_customer_id AS freelancer_gateway_customer_id
            FROM contracts c
            JOIN works w ON w.work_id = c.work_id
            LEFT JOIN users f ON f.user_id = c.freelancer_id
            WHERE w.client_id = $1
              AND EXISTS (
                SELECT 1 FROM tasks t
                WHERE t.contract_id = c.contract_id
                  AND t.is_billable = TRUE
                  AND t.start_time >= $2
                  AND t.start_time < $3
              )
            ORDER BY c.created_utc, c.contract_id
            "#,
        )
        .bind(client_id)
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load contracts", e))?;

        let contract_ids: Vec<Uuid> = contracts.iter().map(|c| c.contract_id).collect();

        let tasks = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT task_id, freelancer_id, contract_id, title, start_time, end_time,
                is_billable, billable_hours, status
            FROM tasks
            WHERE contract_id = ANY($1)
              AND is_billable = TRUE
              AND start_time >= $2
              AND start_time < $3
            ORDER BY start_time, task_id
            "#,
        )
        .bind(&contract_ids)
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load tasks", e))?;

        timer.observe_duration();

        let mut tasks_by_contract: HashMap<Uuid, Vec<Task>> = HashMap::new();
        for row in tasks {
            if let Some(contract_id) = row.contract_id {
                tasks_by_contract
                    .entry(contract_id)
                    .or_default()
                    .push(row.into());
            }
        }

        contracts
            .into_iter()
            .map(|row| {
                let freelancer = match (row.freelancer_name, row.freelancer_email) {
                    (Some(name), Some(email)) => User {
                        user_id: row.freelancer_id,
                        name,
                        email,
                        gateway_customer_id: row.freelancer_gateway_customer_id,
                    },
                    _ => {
                        return Err(AppError::NotFound(anyhow::anyhow!(
                            "Freelancer {} for contract {} not found",
                            row.freelancer_id,
                            row.contract_id
                        )))
                    }
                };

                Ok(ContractBilling {
                    tasks: tasks_by_contract
                        .remove(&row.contract_id)
                        .unwrap_or_default(),
                    contract: Contract {
                        contract_id: row.contract_id,
                        work_id: row.work_id,
                        freelancer_id: row.freelancer_id,
                        agency_rate: row.agency_rate,
                        created_utc: row.contract_created_utc,
                    },
                    work: Work {
                        work_id: row.work_id,
                        client_id: row.client_id,
                        title: row.title,
                        contract_type: ContractType::from_string(&row.contract_type),
                        rate: row.rate,
                        status: WorkStatus::from_string(&row.work_status),
                        weekly_time_limit: row.weekly_time_limit,
                    },
                    freelancer,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn max_invoice_sequence(&self, prefix: &str) -> Result<i64, AppError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let suffix_from = prefix.chars().count() as i32 + 1;
        let max: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(CAST(SUBSTRING(invoice_number FROM $2) AS BIGINT)), 0) \
             FROM invoices \
             WHERE invoice_number LIKE $1 AND SUBSTRING(invoice_number FROM $2) ~ '^[0-9]+$'",
        )
        .bind(pattern)
        .bind(suffix_from)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read invoice sequence", e))?;
        Ok(max)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn find_invoice_for_period(
        &self,
        client_id: Uuid,
        period: &BillingPeriod,
    ) -> Result<Option<Invoice>, AppError> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE client_id = $1 AND billing_period_start = $2 \
             AND billing_period_end = $3 AND status <> 'void' ORDER BY created_utc LIMIT 1",
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(client_id)
            .bind(period.start)
            .bind(period.end)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to look up invoice for period", e))?;
        Ok(row.map(Invoice::from))
    }

    #[instrument(skip(self, input), fields(client_id = %input.client_id))]
    async fn create_invoice(
        &self,
        invoice_number: &str,
        input: &NewInvoice,
    ) -> Result<InvoiceWithItems, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let total = input.total();
        let sql = format!(
            r#"
            INSERT INTO invoices (
                invoice_id, invoice_number, client_id, billing_period_start, billing_period_end,
                subtotal, total, currency, status, due_date, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $6, $7, 'draft', $8, $9)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let invoice: Invoice = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(invoice_number)
            .bind(input.client_id)
            .bind(input.billing_period_start)
            .bind(input.billing_period_end)
            .bind(total)
            .bind(&input.currency)
            .bind(input.due_date)
            .bind(&input.metadata)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!(
                        "Invoice number {} already exists",
                        invoice_number
                    ))
                }
                _ => db_error("Failed to create invoice", e),
            })?
            .into();

        let item_sql = format!(
            r#"
            INSERT INTO invoice_items (
                item_id, invoice_id, contract_id, description, quantity, rate, amount, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            ITEM_COLUMNS
        );

        let mut items = Vec::with_capacity(input.items.len());
        for item in &input.items {
            let row = sqlx::query_as::<_, ItemRow>(&item_sql)
                .bind(Uuid::new_v4())
                .bind(invoice.invoice_id)
                .bind(item.contract_id)
                .bind(&item.description)
                .bind(item.quantity)
                .bind(item.rate)
                .bind(item.amount)
                .bind(&item.metadata)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to create invoice item", e))?;
            items.push(InvoiceItem::from(row));
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit invoice", e))?;

        timer.observe_duration();

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            items = items.len(),
            "Draft invoice created"
        );

        Ok(InvoiceWithItems { invoice, items })
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        self.fetch_invoice_where("get_invoice", "invoice_id = $1", invoice_id)
            .await
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError> {
        let sql = format!(
            "SELECT {} FROM invoice_items WHERE invoice_id = $1 ORDER BY created_utc, item_id",
            ITEM_COLUMNS
        );
        let rows = sqlx::query_as::<_, ItemRow>(&sql)
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to get invoice items", e))?;
        Ok(rows.into_iter().map(InvoiceItem::from).collect())
    }

    #[instrument(skip(self))]
    async fn find_invoice_by_gateway_id(
        &self,
        gateway_invoice_id: &str,
    ) -> Result<Option<Invoice>, AppError> {
        self.fetch_invoice_where(
            "find_invoice_by_gateway_id",
            "gateway_invoice_id = $1",
            gateway_invoice_id.to_string(),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_pending_invoices(&self) -> Result<Vec<Invoice>, AppError> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE status = 'draft' AND gateway_invoice_id IS NULL \
             ORDER BY created_utc, invoice_number",
            INVOICE_COLUMNS
        );
        let rows = sqlx::query_as::<_, InvoiceRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list pending invoices", e))?;
        Ok(rows.into_iter().map(Invoice::from).collect())
    }

    #[instrument(skip(self, metadata), fields(invoice_id = %invoice_id))]
    async fn mark_invoice_sent(
        &self,
        invoice_id: Uuid,
        gateway_invoice_id: &str,
        sent_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_sent"])
            .start_timer();

        let sql = format!(
            r#"
            UPDATE invoices
            SET status = 'sent',
                gateway_invoice_id = $2,
                sent_utc = $3,
                metadata = COALESCE(metadata, '{{}}'::jsonb) || $4,
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status = 'draft'
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(invoice_id)
            .bind(gateway_invoice_id)
            .bind(sent_at)
            .bind(&metadata)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to mark invoice sent", e))?;

        timer.observe_duration();

        Ok(row.map(Invoice::from))
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id, event = ?event))]
    async fn apply_invoice_event(
        &self,
        invoice_id: Uuid,
        event: InvoiceEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_invoice_event"])
            .start_timer();

        let target = event.target();
        let sources: Vec<String> = event
            .sources()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let sql = format!(
            r#"
            UPDATE invoices
            SET status = $2,
                sent_utc = CASE WHEN $2 = 'sent' THEN $3 ELSE sent_utc END,
                paid_utc = CASE WHEN $2 = 'paid' THEN $3 ELSE paid_utc END,
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status = ANY($4)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(invoice_id)
            .bind(target.as_str())
            .bind(at)
            .bind(&sources)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update invoice status", e))?;

        timer.observe_duration();

        Ok(row.map(Invoice::from))
    }

    #[instrument(skip(self, patch), fields(invoice_id = %invoice_id))]
    async fn merge_invoice_metadata(
        &self,
        invoice_id: Uuid,
        patch: serde_json::Value,
    ) -> Result<Option<Invoice>, AppError> {
        let sql = format!(
            r#"
            UPDATE invoices
            SET metadata = COALESCE(metadata, '{{}}'::jsonb) || $2,
                updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let row = sqlx::query_as::<_, InvoiceRow>(&sql)
            .bind(invoice_id)
            .bind(&patch)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to update invoice metadata", e))?;
        Ok(row.map(Invoice::from))
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn set_gateway_customer_id(
        &self,
        user_id: Uuid,
        gateway_customer_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET gateway_customer_id = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(gateway_customer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to store gateway customer id", e))?;
        Ok(())
    }

    #[instrument(skip(self, input), fields(work_id = %input.work_id))]
    async fn create_contract(&self, input: &NewContract) -> Result<Contract, AppError> {
        input
            .validate()
            .map_err(|msg| AppError::BadRequest(anyhow::anyhow!(msg)))?;

        let row = sqlx::query_as::<_, ContractInsertRow>(
            r#"
            INSERT INTO contracts (contract_id, work_id, freelancer_id, agency_rate)
            VALUES ($1, $2, $3, $4)
            RETURNING contract_id, work_id, freelancer_id, agency_rate, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.work_id)
        .bind(input.freelancer_id)
        .bind(input.agency_rate)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Work {} already has a contract",
                    input.work_id
                ))
            }
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                AppError::NotFound(anyhow::anyhow!("Work or freelancer not found"))
            }
            _ => db_error("Failed to create contract", e),
        })?;

        info!(contract_id = %row.contract_id, "Contract created");

        Ok(Contract {
            contract_id: row.contract_id,
            work_id: row.work_id,
            freelancer_id: row.freelancer_id,
            agency_rate: row.agency_rate,
            created_utc: row.created_utc,
        })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;
        Ok(())
    }
}
