//! Payment gateway seam.
//!
//! The sender only talks to [`PaymentGateway`]; [`StripeClient`] is the
//! production implementation and tests inject fakes.

mod stripe;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub use stripe::StripeClient;

/// Failures a gateway call can end in.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// The gateway rejected what we sent.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        param: Option<String>,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("gateway error: {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },
}

impl GatewayError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::Authentication(_) => "authentication",
            GatewayError::Connection(_) => "connection",
            GatewayError::Api { .. } => "api",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub email: String,
    pub name: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceParams {
    pub customer_id: String,
    pub currency: String,
    pub days_until_due: u32,
    pub description: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayInvoice {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub invoice_pdf: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceItemParams {
    pub customer_id: String,
    pub invoice_id: String,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayInvoiceItem {
    pub id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<GatewayCustomer, GatewayError>;

    async fn create_customer(&self, customer: &NewCustomer) -> Result<GatewayCustomer, GatewayError>;

    /// Create an invoice the gateway collects by sending it to the customer.
    async fn create_invoice(
        &self,
        params: &CreateInvoiceParams,
    ) -> Result<GatewayInvoice, GatewayError>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError>;

    async fn create_invoice_item(
        &self,
        params: &CreateInvoiceItemParams,
    ) -> Result<GatewayInvoiceItem, GatewayError>;

    async fn finalize_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError>;

    async fn send_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError>;
}
