//! Application startup and lifecycle management.

use crate::config::BillingConfig;
use crate::handlers;
use crate::services::{
    init_metrics, BillingPeriodCalculator, BillingStore, Database, GeneratorSettings,
    InvoiceGenerator, InvoiceSender, NotificationDispatcher, Notifier, PaymentGateway,
    SmtpNotifier, StripeClient, WebhookReconciler,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BillingStore>,
    pub generator: InvoiceGenerator,
    pub dispatcher: NotificationDispatcher,
    pub reconciler: WebhookReconciler,
}

/// Every collaborator the billing core needs, already constructed.
pub struct Components {
    pub store: Arc<dyn BillingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    /// Wire the billing services around the given collaborators.
    pub fn new(config: &BillingConfig, components: Components) -> Result<Self, AppError> {
        let calculator = BillingPeriodCalculator::new(config.billing.tz()?);

        let generator = InvoiceGenerator::new(
            components.store.clone(),
            calculator,
            GeneratorSettings {
                currency: config.billing.currency.clone(),
                days_until_due: i64::from(config.billing.days_until_due),
                allow_duplicate_periods: config.billing.allow_duplicate_periods,
            },
        );

        let sender = InvoiceSender::new(
            components.store.clone(),
            components.gateway,
            config.billing.days_until_due,
        );

        let dispatcher = NotificationDispatcher::new(
            components.store.clone(),
            sender,
            components.notifier,
            config.admin_emails.clone(),
        );

        let reconciler = WebhookReconciler::new(
            components.store.clone(),
            config.gateway.webhook_secret.clone(),
            config.gateway.webhook_tolerance_secs,
        );

        Ok(Self {
            store: components.store,
            generator,
            dispatcher,
            reconciler,
        })
    }

    /// Production wiring: Postgres, Stripe and SMTP.
    pub async fn from_config(config: &BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let gateway = StripeClient::new(&config.gateway).map_err(AppError::ConfigError)?;
        if !gateway.is_configured() {
            tracing::warn!("Gateway secret key not configured - invoice sending will fail");
        }

        let notifier = SmtpNotifier::new(config.smtp.clone())
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
        if !notifier.is_enabled() {
            tracing::warn!("SMTP disabled - invoice emails will not be sent");
        }

        Self::new(
            config,
            Components {
                store: Arc::new(db),
                gateway: Arc::new(gateway),
                notifier: Arc::new(notifier),
            },
        )
    }
}

/// HTTP routes for the billing core.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .route("/webhooks/gateway", post(handlers::webhook::gateway_webhook))
        .route("/billing/periods", get(handlers::billing::periods))
        .route("/billing/generate", post(handlers::billing::generate_weekly))
        .route(
            "/billing/clients/:client_id/invoices",
            post(handlers::billing::generate_client),
        )
        .route(
            "/billing/invoices/send-pending",
            post(handlers::billing::send_pending),
        )
        .route(
            "/billing/invoices/:invoice_id/send",
            post(handlers::billing::send_invoice),
        )
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        init_metrics();

        let state = AppState::from_config(&config, true).await?;

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Billing service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(
            service = "billing-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router(self.state)).await
    }
}
