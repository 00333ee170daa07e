//! Billing side of the payment reconciliation saga.
//!
//! This crate provides:
//! - `PaymentAttemptStore` with in-memory and PostgreSQL implementations
//! - `ChargeRequestHandler`, the idempotent consumer of charge requests
//! - `PaymentGatewayClient`, checkout session creation behind a circuit
//!   breaker and bounded retry
//! - `WebhookReceiver`, signed gateway callbacks driving attempt transitions

pub mod charge;
pub mod checkout;
pub mod error;
pub mod gateway;
pub mod resilience;
pub mod store;
pub mod webhook;

pub use charge::{ChargeOutcome, ChargeRequestHandler};
pub use checkout::{
    CheckoutSessionRequest, CheckoutSessionResponse, CheckoutSettings, FOLLOW_UP_PRODUCT_NAME,
    PaymentGatewayClient,
};
pub use error::{BillingError, Result};
pub use gateway::{
    CheckoutGateway, CheckoutRequest, CheckoutSession, GatewayError, InMemoryCheckoutGateway,
    StripeCheckoutGateway,
};
pub use resilience::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy, TransientError,
};
pub use store::{
    InMemoryAttemptStore, InsertOutcome, PaymentAttemptStore, PostgresAttemptStore,
    SharedAttemptStore,
};
pub use webhook::{
    SIGNATURE_HEADER, SignatureError, WebhookEventKind, WebhookOutcome, WebhookReceiver,
    WebhookSettings,
};
