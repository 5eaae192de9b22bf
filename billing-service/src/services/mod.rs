//! Services module for billing-service.

pub mod dispatcher;
pub mod gateway;
pub mod generator;
pub mod metrics;
pub mod notifier;
pub mod period;
pub mod rates;
pub mod sender;
pub mod store;
pub mod webhook;

pub use dispatcher::{DeliveryResult, DeliveryStatus, NotificationDispatcher};
pub use gateway::{GatewayError, PaymentGateway, StripeClient};
pub use generator::{
    ClientInvoiceOutcome, GenerationResult, GenerationSummary, GeneratorSettings, InvoiceGenerator,
};
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{InvoiceNotice, NotificationKind, Notifier, NotifyError, SmtpNotifier};
pub use period::{BillingPeriod, BillingPeriodCalculator};
pub use sender::InvoiceSender;
pub use store::{BillingStore, Database, InMemoryStore};
pub use webhook::{GatewayEvent, WebhookError, WebhookOutcome, WebhookReconciler};
