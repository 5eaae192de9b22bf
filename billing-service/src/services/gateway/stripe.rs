//! Stripe-compatible REST client.
//!
//! Requests are form encoded with `metadata[key]` fields and authenticated
//! with the secret key as a bearer token. Responses are JSON.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{
    CreateInvoiceItemParams, CreateInvoiceParams, GatewayCustomer, GatewayError, GatewayInvoice,
    GatewayInvoiceItem, NewCustomer, PaymentGateway,
};
use crate::config::GatewayConfig;
use crate::services::metrics;

type Form = Vec<(String, String)>;

/// Stripe API error envelope.
#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    param: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Retrieve response; deleted customers come back as a stub.
#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    api_base_url: String,
    secret_key: Secret<String>,
}

impl StripeClient {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
        })
    }

    /// Check if the secret key is set.
    pub fn is_configured(&self) -> bool {
        !self.secret_key.expose_secret().is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, operation: &str, path: &str) -> Result<T, GatewayError> {
        let request = self
            .client
            .get(self.url(path))
            .bearer_auth(self.secret_key.expose_secret());
        self.execute(operation, request).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        form: &Form,
    ) -> Result<T, GatewayError> {
        let request = self
            .client
            .post(self.url(path))
            .bearer_auth(self.secret_key.expose_secret())
            .form(form);
        self.execute(operation, request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let result = self.send(request).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::record_gateway_request(operation, outcome);
        result
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::Authentication(
                "gateway secret key not configured".to_string(),
            ));
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        tracing::debug!(status = %status, "Gateway response received");

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| GatewayError::Api {
                status: Some(status.as_u16()),
                message: format!("undecodable response: {}", e),
            })
        } else {
            Err(map_error(status, &body))
        }
    }
}

fn map_error(status: StatusCode, body: &str) -> GatewayError {
    let detail = serde_json::from_str::<StripeErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or(StripeErrorDetail {
            message: None,
            param: None,
            kind: None,
        });
    let message = detail
        .message
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body));

    match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYMENT_REQUIRED | StatusCode::NOT_FOUND => {
            GatewayError::InvalidRequest {
                message,
                param: detail.param,
            }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Authentication(message),
        _ => GatewayError::Api {
            status: Some(status.as_u16()),
            message: match detail.kind {
                Some(kind) => format!("{}: {}", kind, message),
                None => message,
            },
        },
    }
}

fn push_metadata(form: &mut Form, metadata: &BTreeMap<String, String>) {
    for (key, value) in metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn retrieve_customer(&self, customer_id: &str) -> Result<GatewayCustomer, GatewayError> {
        let customer: CustomerResponse = self
            .get("retrieve_customer", &format!("customers/{}", customer_id))
            .await?;

        if customer.deleted {
            return Err(GatewayError::InvalidRequest {
                message: format!("customer {} was deleted", customer.id),
                param: Some("customer".to_string()),
            });
        }

        Ok(GatewayCustomer {
            id: customer.id,
            email: customer.email,
            name: customer.name,
        })
    }

    async fn create_customer(&self, customer: &NewCustomer) -> Result<GatewayCustomer, GatewayError> {
        let mut form: Form = vec![
            ("email".to_string(), customer.email.clone()),
            ("name".to_string(), customer.name.clone()),
        ];
        push_metadata(&mut form, &customer.metadata);

        let created: GatewayCustomer = self.post("create_customer", "customers", &form).await?;
        tracing::info!(customer_id = %created.id, "Gateway customer created");
        Ok(created)
    }

    async fn create_invoice(
        &self,
        params: &CreateInvoiceParams,
    ) -> Result<GatewayInvoice, GatewayError> {
        let mut form: Form = vec![
            ("customer".to_string(), params.customer_id.clone()),
            ("currency".to_string(), params.currency.clone()),
            ("collection_method".to_string(), "send_invoice".to_string()),
            ("days_until_due".to_string(), params.days_until_due.to_string()),
            ("auto_advance".to_string(), "false".to_string()),
            // Only the items we attach explicitly belong on this invoice.
            (
                "pending_invoice_items_behavior".to_string(),
                "exclude".to_string(),
            ),
        ];
        if let Some(description) = &params.description {
            form.push(("description".to_string(), description.clone()));
        }
        push_metadata(&mut form, &params.metadata);

        self.post("create_invoice", "invoices", &form).await
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError> {
        self.get("retrieve_invoice", &format!("invoices/{}", invoice_id))
            .await
    }

    async fn create_invoice_item(
        &self,
        params: &CreateInvoiceItemParams,
    ) -> Result<GatewayInvoiceItem, GatewayError> {
        let mut form: Form = vec![
            ("customer".to_string(), params.customer_id.clone()),
            ("invoice".to_string(), params.invoice_id.clone()),
            ("amount".to_string(), params.amount.to_string()),
            ("currency".to_string(), params.currency.clone()),
            ("description".to_string(), params.description.clone()),
        ];
        push_metadata(&mut form, &params.metadata);

        self.post("create_invoice_item", "invoiceitems", &form).await
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError> {
        let form: Form = vec![("auto_advance".to_string(), "false".to_string())];
        self.post(
            "finalize_invoice",
            &format!("invoices/{}/finalize", invoice_id),
            &form,
        )
        .await
    }

    async fn send_invoice(&self, invoice_id: &str) -> Result<GatewayInvoice, GatewayError> {
        self.post("send_invoice", &format!("invoices/{}/send", invoice_id), &Form::new())
            .await
    }
}
