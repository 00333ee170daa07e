//! HTTP API for the payment reconciliation saga.
//!
//! Provides checkout, webhook, patient intake and notification endpoints,
//! with structured logging (tracing) and Prometheus metrics. Event consumers
//! for the billing and patient record groups are built here and run by the
//! binary.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use billing::{
    ChargeRequestHandler, CheckoutGateway, CircuitBreaker, PaymentGatewayClient,
    SharedAttemptStore, WebhookReceiver,
};
use event_bus::{EventConsumer, SharedEventBus};
use metrics_exporter_prometheus::PrometheusHandle;
use patient_records::{
    ConsultationFeeOrchestrator, InMemoryPatientStore, NotificationCache, PatientIntake,
    PatientPaymentProjector, SharedPatientStore,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Consumer group that turns charge requests into attempts.
pub const BILLING_GROUP: &str = "billing";
/// Consumer group that projects payment events into patient records.
pub const PATIENT_RECORDS_GROUP: &str = "patient-records";

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub attempts: SharedAttemptStore,
    pub checkout: PaymentGatewayClient,
    pub webhooks: WebhookReceiver,
    pub intake: PatientIntake,
    pub notifications: Arc<NotificationCache>,
}

/// Everything the server runs: handler state plus one consumer per group.
pub struct Services {
    pub state: Arc<AppState>,
    pub billing_consumer: EventConsumer,
    pub records_consumer: EventConsumer,
}

/// Wires the saga components over the given bus, attempt store and gateway.
///
/// Patient records always live in memory; they stand in for the patient
/// service's own database.
pub fn build_services(
    config: &Config,
    bus: SharedEventBus,
    attempts: SharedAttemptStore,
    gateway: Arc<dyn CheckoutGateway>,
) -> Services {
    let patients: SharedPatientStore = Arc::new(InMemoryPatientStore::new());
    let notifications = Arc::new(NotificationCache::new(config.notifications));

    let checkout = PaymentGatewayClient::new(
        attempts.clone(),
        bus.clone(),
        gateway,
        CircuitBreaker::new("payment-gateway", config.breaker.clone()),
        config.retry.clone(),
        config.checkout_settings(),
    );
    let webhooks = WebhookReceiver::new(attempts.clone(), bus.clone(), config.webhook_settings());
    if !webhooks.is_configured() {
        tracing::warn!("WEBHOOK_SECRET is not configured, gateway callbacks will be rejected");
    }
    if !config.gateway_configured() {
        tracing::warn!("GATEWAY_API_KEY is not configured, checkout sessions cannot be created");
    }

    let intake = PatientIntake::new(
        patients.clone(),
        ConsultationFeeOrchestrator::new(bus.clone()),
    );

    let mut billing_consumer = EventConsumer::new(bus.clone(), BILLING_GROUP);
    billing_consumer.register(Arc::new(ChargeRequestHandler::new(
        attempts.clone(),
        config.default_currency.clone(),
    )));

    let mut records_consumer = EventConsumer::new(bus, PATIENT_RECORDS_GROUP);
    records_consumer.register(Arc::new(PatientPaymentProjector::new(
        patients,
        notifications.clone(),
    )));

    Services {
        state: Arc::new(AppState {
            attempts,
            checkout,
            webhooks,
            intake,
            notifications,
        }),
        billing_consumer,
        records_consumer,
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route(
            "/billing/payments/initial-consultation/create-checkout-session",
            post(routes::billing::create_checkout_session),
        )
        .route(
            "/billing/payments/visit/{visit_id}/create-checkout-session",
            post(routes::billing::create_visit_checkout_session),
        )
        .route(
            "/billing/payments/my-attempts",
            get(routes::billing::my_attempts),
        )
        .route("/billing/stripe-webhooks", post(routes::webhooks::receive))
        .route("/patients", post(routes::patients::register))
        .route("/patients/{id}", get(routes::patients::get))
        .route("/patients/{id}/visits", post(routes::patients::record_visit))
        .route(
            "/patients/{id}/payment-notification",
            get(routes::patients::take_notification),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
