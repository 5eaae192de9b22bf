//! Invoice emails.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::fmt::Write as _;
use thiserror::Error;

use crate::config::SmtpConfig;
use crate::models::{Invoice, InvoiceItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Client-facing "your invoice is ready" mail.
    InvoiceReady,
    /// Copy for admins, with internal fields.
    InvoiceAdminCopy,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::InvoiceReady => "invoice_ready",
            NotificationKind::InvoiceAdminCopy => "invoice_admin_copy",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notifications are disabled")]
    Disabled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Send error: {0}")]
    SendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoticeLine {
    pub description: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
}

/// Everything an invoice email shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceNotice {
    pub invoice_number: String,
    pub client_name: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub due_date: NaiveDate,
    pub total: Decimal,
    pub currency: String,
    pub payment_url: Option<String>,
    pub lines: Vec<NoticeLine>,
    pub gateway_invoice_id: Option<String>,
    pub status: String,
}

impl InvoiceNotice {
    pub fn new(invoice: &Invoice, items: &[InvoiceItem], client_name: &str) -> Self {
        Self {
            invoice_number: invoice.invoice_number.clone(),
            client_name: client_name.to_string(),
            period_start: invoice.billing_period_start,
            period_end: invoice.billing_period_end,
            due_date: invoice.due_date,
            total: invoice.total,
            currency: invoice.currency.to_uppercase(),
            payment_url: invoice.hosted_invoice_url().map(str::to_string),
            lines: items
                .iter()
                .map(|item| NoticeLine {
                    description: item.description.clone(),
                    quantity: item.quantity,
                    rate: item.rate,
                    amount: item.amount,
                })
                .collect(),
            gateway_invoice_id: invoice.gateway_invoice_id.clone(),
            status: invoice.status.as_str().to_string(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        kind: NotificationKind,
        notice: &InvoiceNotice,
    ) -> Result<(), NotifyError>;
}

/// Subject and plain-text body for a notice.
pub fn render(kind: NotificationKind, notice: &InvoiceNotice) -> (String, String) {
    let mut body = String::new();

    let subject = match kind {
        NotificationKind::InvoiceReady => {
            let _ = writeln!(body, "Hello {},", notice.client_name);
            let _ = writeln!(body);
            let _ = writeln!(body, "Your invoice {} is ready.", notice.invoice_number);
            format!("Invoice {} is ready for payment", notice.invoice_number)
        }
        NotificationKind::InvoiceAdminCopy => {
            let _ = writeln!(
                body,
                "Invoice {} was sent to {}.",
                notice.invoice_number, notice.client_name
            );
            format!(
                "[Admin] Invoice {} sent to {}",
                notice.invoice_number, notice.client_name
            )
        }
    };

    let _ = writeln!(body);
    let _ = writeln!(
        body,
        "Billing period: {} to {}",
        notice.period_start.format("%Y-%m-%d %H:%M UTC"),
        notice.period_end.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(body, "Due date: {}", notice.due_date);
    let _ = writeln!(body);
    for line in &notice.lines {
        let _ = writeln!(
            body,
            "- {}: {} x {} = {} {}",
            line.description, line.quantity, line.rate, line.amount, notice.currency
        );
    }
    let _ = writeln!(body);
    let _ = writeln!(body, "Total: {} {}", notice.total, notice.currency);

    if let Some(url) = &notice.payment_url {
        let _ = writeln!(body, "Pay online: {}", url);
    }

    if kind == NotificationKind::InvoiceAdminCopy {
        let _ = writeln!(body);
        let _ = writeln!(
            body,
            "Gateway invoice: {}",
            notice.gateway_invoice_id.as_deref().unwrap_or("-")
        );
        let _ = writeln!(body, "Status: {}", notice.status);
    }

    (subject, body)
}

/// Sends notices over SMTP with lettre.
pub struct SmtpNotifier {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self, NotifyError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| NotifyError::Configuration(format!("Failed to create SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(
        &self,
        recipient: &str,
        kind: NotificationKind,
        notice: &InvoiceNotice,
    ) -> Result<(), NotifyError> {
        let transport = self.transport.as_ref().ok_or(NotifyError::Disabled)?;

        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| NotifyError::Configuration(format!("Invalid from address: {}", e)))?;
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| NotifyError::InvalidRecipient(format!("{}: {}", recipient, e)))?;

        let (subject, body) = render(kind, notice);
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| NotifyError::SendFailed(format!("Failed to build message: {}", e)))?;

        transport
            .send(message)
            .await
            .map_err(|e| NotifyError::SendFailed(format!("Failed to send email: {}", e)))?;

        tracing::info!(
            to = %recipient,
            kind = kind.as_str(),
            invoice_number = %notice.invoice_number,
            "Invoice email sent"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use secrecy::Secret;

    fn notice() -> InvoiceNotice {
        InvoiceNotice {
            invoice_number: "INV-202403-0007".to_string(),
            client_name: "Acme".to_string(),
            period_start: Utc.with_ymd_and_hms(2024, 3, 3, 22, 1, 0).unwrap(),
            period_end: Utc.with_ymd_and_hms(2024, 3, 10, 21, 1, 0).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2024, 4, 10).unwrap(),
            total: Decimal::from(500),
            currency: "USD".to_string(),
            payment_url: Some("https://pay.example/in_1".to_string()),
            lines: vec![NoticeLine {
                description: "API build - Ada (10 hours)".to_string(),
                quantity: Decimal::from(10),
                rate: Decimal::from(50),
                amount: Decimal::from(500),
            }],
            gateway_invoice_id: Some("in_1".to_string()),
            status: "sent".to_string(),
        }
    }

    #[test]
    fn client_mail_hides_internal_fields() {
        let (subject, body) = render(NotificationKind::InvoiceReady, &notice());
        assert!(subject.contains("INV-202403-0007"));
        assert!(body.contains("Pay online: https://pay.example/in_1"));
        assert!(body.contains("API build - Ada (10 hours): 10 x 50 = 500 USD"));
        assert!(body.contains("Due date: 2024-04-10"));
        assert!(!body.contains("Gateway invoice"));
        assert!(!body.contains("Status:"));
    }

    #[test]
    fn admin_copy_includes_gateway_id_and_status() {
        let (subject, body) = render(NotificationKind::InvoiceAdminCopy, &notice());
        assert!(subject.starts_with("[Admin]"));
        assert!(body.contains("Gateway invoice: in_1"));
        assert!(body.contains("Status: sent"));
    }

    #[tokio::test]
    async fn disabled_smtp_refuses_to_send() {
        let notifier = SmtpNotifier::new(SmtpConfig {
            host: "localhost".to_string(),
            port: 587,
            user: String::new(),
            password: Secret::new(String::new()),
            from_email: "billing@example.com".to_string(),
            from_name: "Billing".to_string(),
            enabled: false,
        })
        .unwrap();

        assert!(!notifier.is_enabled());
        let err = notifier
            .send("client@example.com", NotificationKind::InvoiceReady, &notice())
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Disabled));
    }
}
