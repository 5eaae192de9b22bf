//! Test helper module for billing-service integration tests.
//!
//! Tests run against the in-memory store with a scripted gateway and a
//! notifier that records what it was asked to send.

#![allow(dead_code)]

use async_trait::async_trait;
use billing_service::config::{
    BillingConfig, BillingSettings, DatabaseConfig, GatewayConfig, SmtpConfig,
};
use billing_service::models::{
    Contract, ContractBilling, ContractType, Invoice, InvoiceEvent, InvoiceItem, InvoiceWithItems,
    NewContract, NewInvoice, NewInvoiceItem, Task, User, Work, WorkStatus,
};
use billing_service::services::gateway::{
    CreateInvoiceItemParams, CreateInvoiceParams, GatewayCustomer, GatewayError, GatewayInvoice,
    GatewayInvoiceItem, NewCustomer, PaymentGateway,
};
use billing_service::services::{
    init_metrics, BillingPeriod, BillingStore, InMemoryStore, InvoiceNotice, NotificationKind,
    Notifier, NotifyError,
};
use billing_service::startup::{router, AppState, Components};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::json;
use service_core::config::Config;
use service_core::error::AppError;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const ADMIN_EMAIL: &str = "billing-admin@example.com";

/// Wednesday 2024-03-13 11:00 in New York, three days into the DST week.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 13, 15, 0, 0).unwrap()
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn test_config() -> BillingConfig {
    BillingConfig {
        common: Config::default(),
        service_name: "billing-service".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 0,
        },
        gateway: GatewayConfig {
            api_base_url: "http://127.0.0.1:0".to_string(),
            secret_key: Secret::new("sk_test".to_string()),
            webhook_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            webhook_tolerance_secs: 300,
            timeout_secs: 5,
        },
        billing: BillingSettings {
            timezone: "America/New_York".to_string(),
            currency: "usd".to_string(),
            days_until_due: 30,
            allow_duplicate_periods: false,
        },
        smtp: SmtpConfig {
            host: "localhost".to_string(),
            port: 587,
            user: String::new(),
            password: Secret::new(String::new()),
            from_email: "billing@example.com".to_string(),
            from_name: "Billing".to_string(),
            enabled: false,
        },
        admin_emails: vec![ADMIN_EMAIL.to_string()],
    }
}

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    RetrieveCustomer(String),
    CreateCustomer { email: String },
    CreateInvoice { customer_id: String, currency: String },
    RetrieveInvoice(String),
    CreateInvoiceItem { invoice_id: String, amount: i64 },
    Finalize(String),
    Send(String),
}

#[derive(Default)]
struct FakeGatewayState {
    calls: Vec<GatewayCall>,
    items: Vec<CreateInvoiceItemParams>,
    customers: Vec<String>,
    invoice_status: HashMap<String, String>,
    failures: Vec<(&'static str, GatewayError)>,
    omit_payment_url: bool,
    next_id: u32,
}

/// Scripted gateway. Every operation succeeds unless told otherwise.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeGatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` fail with `error` from now on.
    ///
    /// Operations: `retrieve_customer`, `create_customer`, `create_invoice`,
    /// `retrieve_invoice`, `create_invoice_item`, `finalize_invoice`, `send_invoice`.
    pub fn fail(&self, operation: &'static str, error: GatewayError) {
        self.state.lock().unwrap().failures.push((operation, error));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn add_customer(&self, customer_id: &str) {
        self.state
            .lock()
            .unwrap()
            .customers
            .push(customer_id.to_string());
    }

    /// Status the gateway currently reports for `invoice_id`.
    pub fn invoice_status(&self, invoice_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .invoice_status
            .get(invoice_id)
            .cloned()
    }

    pub fn set_invoice_status(&self, invoice_id: &str, status: &str) {
        self.state
            .lock()
            .unwrap()
            .invoice_status
            .insert(invoice_id.to_string(), status.to_string());
    }

    pub fn omit_payment_url(&self) {
        self.state.lock().unwrap().omit_payment_url = true;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn items(&self) -> Vec<CreateInvoiceItemParams> {
        self.state.lock().unwrap().items.clone()
    }

    fn record(&self, operation: &'static str, call: GatewayCall) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.failures.iter().find(|(op, _)| *op == operation) {
            Some((_, error)) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("{}_{}", prefix, state.next_id)
    }

    fn invoice(&self, id: &str, status: &str) -> GatewayInvoice {
        let omit = self.state.lock().unwrap().omit_payment_url;
        GatewayInvoice {
            id: id.to_string(),
            status: Some(status.to_string()),
            hosted_invoice_url: (!omit).then(|| format!("https://pay.example.com/{}", id)),
            invoice_pdf: (!omit).then(|| format!("https://pay.example.com/{}.pdf", id)),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<GatewayCustomer, GatewayError> {
        self.record(
            "retrieve_customer",
            GatewayCall::RetrieveCustomer(customer_id.to_string()),
        )?;
        let known = self
            .state
            .lock()
            .unwrap()
            .customers
            .iter()
            .any(|c| c == customer_id);
        if known {
            Ok(GatewayCustomer {
                id: customer_id.to_string(),
                email: None,
                name: None,
            })
        } else {
            Err(GatewayError::InvalidRequest {
                message: format!("No such customer: '{}'", customer_id),
                param: Some("id".to_string()),
            })
        }
    }

    async fn create_customer(&self, customer: &NewCustomer) -> Result<GatewayCustomer, GatewayError> {
        self.record(
            "create_customer",
            GatewayCall::CreateCustomer {
                email: customer.email.clone(),
            },
        )?;
        let id = self.next_id("cus");
        self.add_customer(&id);
        Ok(GatewayCustomer {
            id,
            email: Some(customer.email.clone()),
            name: Some(customer.name.clone()),
        })
    }

    async fn create_invoice(
        &self,
        params: &CreateInvoiceParams,
    ) -> Result<GatewayInvoice, GatewayError> {
        self.record(
            "create_invoice",
            GatewayCall::CreateInvoice {
                customer_id: params.customer_id.clone(),
                currency: params.currency.clone(),
            },
        )?;
        let id = self.next_id("in");
        self.set_invoice_status(&id, "draft");
        Ok(GatewayInvoice {
            id,
            status: Some("draft".to_string()),
            hosted_invoice_url: None,
            invoice_pdf: None,
        })
    }

    async fn create_invoice_item(
        &self,
        params: &CreateInvoiceItemParams,
    ) -> Result<GatewayInvoiceItem, GatewayError> {
        self.record(
            "create_invoice_item",
            GatewayCall::CreateInvoiceItem {
                invoice_id: params.invoice_id.clone(),
                amount: params.amount,
            },
        )?;
        self.state.lock().unwrap().items.push(params.clone());
        Ok(GatewayInvoiceItem {
            id: self.next_id("ii"),
        })
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError> {
        self.record(
            "retrieve_invoice",
            GatewayCall::RetrieveInvoice(invoice_id.to_string()),
        )?;
        match self.invoice_status(invoice_id) {
            Some(status) => Ok(self.invoice(invoice_id, &status)),
            None => Err(GatewayError::InvalidRequest {
                message: format!("No such invoice: '{}'", invoice_id),
                param: Some("id".to_string()),
            }),
        }
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError> {
        self.record("finalize_invoice", GatewayCall::Finalize(invoice_id.to_string()))?;
        self.set_invoice_status(invoice_id, "open");
        Ok(self.invoice(invoice_id, "open"))
    }

    async fn send_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError> {
        self.record("send_invoice", GatewayCall::Send(invoice_id.to_string()))?;
        Ok(self.invoice(invoice_id, "open"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotice {
    pub recipient: String,
    pub kind: NotificationKind,
    pub invoice_number: String,
    pub payment_url: Option<String>,
}

/// Records notices instead of mailing them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotice>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send to `recipient`.
    pub fn fail_for(&self, recipient: &str) {
        self.failing.lock().unwrap().push(recipient.to_string());
    }

    pub fn sent(&self) -> Vec<SentNotice> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        recipient: &str,
        kind: NotificationKind,
        notice: &InvoiceNotice,
    ) -> Result<(), NotifyError> {
        if self.failing.lock().unwrap().iter().any(|r| r == recipient) {
            return Err(NotifyError::SendFailed("mailbox unavailable".to_string()));
        }
        self.sent.lock().unwrap().push(SentNotice {
            recipient: recipient.to_string(),
            kind,
            invoice_number: notice.invoice_number.clone(),
            payment_url: notice.payment_url.clone(),
        });
        Ok(())
    }
}

fn pool_timeout() -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("pool timed out"))
}

/// Passes everything through to the in-memory store, except the reads and
/// writes it has been told to break.
pub struct FaultyStore {
    inner: Arc<InMemoryStore>,
    user_reads: AtomicUsize,
    user_read_limit: AtomicUsize,
    mark_sent_failures: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            user_reads: AtomicUsize::new(0),
            user_read_limit: AtomicUsize::new(usize::MAX),
            mark_sent_failures: AtomicUsize::new(0),
        }
    }

    /// Let `reads` more user lookups through, then fail every one after.
    pub fn fail_user_reads_after(&self, reads: usize) {
        let done = self.user_reads.load(Ordering::SeqCst);
        self.user_read_limit.store(done + reads, Ordering::SeqCst);
    }

    /// Fail the next `times` attempts to mark an invoice sent.
    pub fn fail_mark_sent(&self, times: usize) {
        self.mark_sent_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingStore for FaultyStore {
    async fn clients_with_billable_tasks(
        &self,
        period: &BillingPeriod,
    ) -> Result<Vec<User>, AppError> {
        self.inner.clients_with_billable_tasks(period).await
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, AppError> {
        let read = self.user_reads.fetch_add(1, Ordering::SeqCst);
        if read >= self.user_read_limit.load(Ordering::SeqCst) {
            return Err(pool_timeout());
        }
        self.inner.get_user(user_id).await
    }

    async fn contracts_for_client(
        &self,
        client_id: Uuid,
        period: &BillingPeriod,
    ) -> Result<Vec<ContractBilling>, AppError> {
        self.inner.contracts_for_client(client_id, period).await
    }

    async fn max_invoice_sequence(&self, prefix: &str) -> Result<i64, AppError> {
        self.inner.max_invoice_sequence(prefix).await
    }

    async fn find_invoice_for_period(
        &self,
        client_id: Uuid,
        period: &BillingPeriod,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.find_invoice_for_period(client_id, period).await
    }

    async fn create_invoice(
        &self,
        invoice_number: &str,
        input: &NewInvoice,
    ) -> Result<InvoiceWithItems, AppError> {
        self.inner.create_invoice(invoice_number, input).await
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        self.inner.get_invoice(invoice_id).await
    }

    async fn get_invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError> {
        self.inner.get_invoice_items(invoice_id).await
    }

    async fn find_invoice_by_gateway_id(
        &self,
        gateway_invoice_id: &str,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.find_invoice_by_gateway_id(gateway_invoice_id).await
    }

    async fn list_pending_invoices(&self) -> Result<Vec<Invoice>, AppError> {
        self.inner.list_pending_invoices().await
    }

    async fn mark_invoice_sent(
        &self,
        invoice_id: Uuid,
        gateway_invoice_id: &str,
        sent_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Result<Option<Invoice>, AppError> {
        let failing = self
            .mark_sent_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(pool_timeout());
        }
        self.inner
            .mark_invoice_sent(invoice_id, gateway_invoice_id, sent_at, metadata)
            .await
    }

    async fn apply_invoice_event(
        &self,
        invoice_id: Uuid,
        event: InvoiceEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.apply_invoice_event(invoice_id, event, at).await
    }

    async fn merge_invoice_metadata(
        &self,
        invoice_id: Uuid,
        patch: serde_json::Value,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.merge_invoice_metadata(invoice_id, patch).await
    }

    async fn set_gateway_customer_id(
        &self,
        user_id: Uuid,
        gateway_customer_id: &str,
    ) -> Result<(), AppError> {
        self.inner
            .set_gateway_customer_id(user_id, gateway_customer_id)
            .await
    }

    async fn create_contract(&self, input: &NewContract) -> Result<Contract, AppError> {
        self.inner.create_contract(input).await
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.inner.health_check().await
    }
}

/// Seeded marketplace data plus the wired application state.
pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub faults: Arc<FaultyStore>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub state: AppState,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BillingConfig) -> Self {
        init_metrics();

        let store = Arc::new(InMemoryStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let gateway = Arc::new(FakeGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let state = AppState::new(
            &config,
            Components {
                store: faults.clone(),
                gateway: gateway.clone(),
                notifier: notifier.clone(),
            },
        )
        .expect("Failed to build app state");

        Self {
            store,
            faults,
            gateway,
            notifier,
            state,
        }
    }

    /// Last week's billing window as of [`now`].
    pub fn previous_period(&self) -> BillingPeriod {
        self.state.generator.calculator().previous_period(now())
    }

    pub async fn client(&self, name: &str) -> User {
        let user = User {
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@client.example.com", name.to_lowercase()),
            gateway_customer_id: None,
        };
        self.store.insert_user(user.clone()).await;
        user
    }

    pub async fn freelancer(&self, name: &str) -> User {
        let user = User {
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@freelancer.example.com", name.to_lowercase()),
            gateway_customer_id: None,
        };
        self.store.insert_user(user.clone()).await;
        user
    }

    pub async fn work(
        &self,
        client: &User,
        title: &str,
        contract_type: ContractType,
        rate: &str,
    ) -> Work {
        let work = Work {
            work_id: Uuid::new_v4(),
            client_id: client.user_id,
            title: title.to_string(),
            contract_type,
            rate: dec(rate),
            status: WorkStatus::Active,
            weekly_time_limit: None,
        };
        self.store.insert_work(work.clone()).await;
        work
    }

    /// A work for `client` staffed by a new freelancer.
    pub async fn contract(
        &self,
        client: &User,
        title: &str,
        contract_type: ContractType,
        rate: &str,
        agency_rate: &str,
    ) -> Contract {
        let freelancer = self.freelancer(&format!("{} Dev", title)).await;
        let work = self.work(client, title, contract_type, rate).await;
        self.store
            .create_contract(&NewContract {
                work_id: work.work_id,
                freelancer_id: freelancer.user_id,
                agency_rate: dec(agency_rate),
            })
            .await
            .expect("Failed to create contract")
    }

    pub async fn task_at(&self, contract: &Contract, start: DateTime<Utc>, hours: &str) -> Task {
        let task = Task {
            task_id: Uuid::new_v4(),
            freelancer_id: contract.freelancer_id,
            contract_id: Some(contract.contract_id),
            title: "Implementation".to_string(),
            start_time: start,
            end_time: Some(start + Duration::hours(1)),
            is_billable: true,
            billable_hours: dec(hours),
            status: "completed".to_string(),
        };
        self.store.insert_task(task.clone()).await;
        task
    }

    /// A billable task in the middle of last week.
    pub async fn task(&self, contract: &Contract, hours: &str) -> Task {
        let start = self.previous_period().start + Duration::days(2);
        self.task_at(contract, start, hours).await
    }

    /// A draft invoice with a single item, bypassing generation.
    pub async fn draft_invoice(&self, client: &User, number: &str, amount: &str) -> Invoice {
        let period = self.previous_period();
        self.store
            .create_invoice(
                number,
                &NewInvoice {
                    client_id: client.user_id,
                    billing_period_start: period.start,
                    billing_period_end: period.end,
                    currency: "usd".to_string(),
                    due_date: (now() + Duration::days(30)).date_naive(),
                    metadata: json!({}),
                    items: vec![NewInvoiceItem {
                        contract_id: Uuid::new_v4(),
                        description: "Design work - Grace (4 hours)".to_string(),
                        quantity: dec("4"),
                        rate: dec(amount) / dec("4"),
                        amount: dec(amount),
                        metadata: json!({}),
                    }],
                },
            )
            .await
            .expect("Failed to create invoice")
            .invoice
    }

    /// A draft already pushed to the gateway as `gateway_invoice_id`.
    pub async fn sent_invoice(&self, client: &User, number: &str, gateway_invoice_id: &str) -> Invoice {
        let draft = self.draft_invoice(client, number, "400").await;
        self.store
            .mark_invoice_sent(draft.invoice_id, gateway_invoice_id, now(), json!({}))
            .await
            .expect("Failed to mark invoice sent")
            .expect("Invoice was not a draft")
    }
}

/// A running HTTP server around a [`TestContext`].
pub struct TestApp {
    pub address: String,
    pub ctx: TestContext,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let ctx = TestContext::new();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind random port");
        let port = listener.local_addr().unwrap().port();
        let app = router(ctx.state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            address: format!("http://127.0.0.1:{}", port),
            ctx,
        }
    }
}

/// Gateway event body for `event_type` about `gateway_invoice_id`.
pub fn invoice_event(event_type: &str, gateway_invoice_id: &str) -> String {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "object": "event",
        "type": event_type,
        "data": { "object": { "id": gateway_invoice_id, "object": "invoice" } }
    })
    .to_string()
}

/// `Stripe-Signature` header for `payload` signed at `at`.
pub fn sign(payload: &str, at: DateTime<Utc>) -> String {
    service_core::utils::signature::webhook_signature_header(
        WEBHOOK_SECRET,
        at.timestamp(),
        payload,
    )
    .expect("Failed to sign payload")
}
