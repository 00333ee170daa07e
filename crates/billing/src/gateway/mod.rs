//! Outbound hosted-checkout gateway.

mod memory;
mod stripe;

use async_trait::async_trait;
use common::{GatewaySessionId, PatientId, PaymentAttemptId, VisitId};
use domain::{Currency, Money, PaymentType};
use thiserror::Error;
use uuid::Uuid;

use crate::resilience::TransientError;

pub use memory::InMemoryCheckoutGateway;
pub use stripe::StripeCheckoutGateway;

/// Everything the gateway needs to open a hosted checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub patient_id: PatientId,
    pub visit_id: Option<VisitId>,
    pub payment_type: PaymentType,
    pub product_name: String,
    /// Price per unit.
    pub amount: Money,
    pub currency: Currency,
    pub quantity: u32,
    /// Echoed back by the gateway in the completion callback.
    pub client_reference_id: Option<PaymentAttemptId>,
    pub success_url: String,
    pub cancel_url: String,
    /// Reused across retries so the gateway opens at most one session.
    pub idempotency_key: Uuid,
}

/// A hosted checkout opened by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub session_id: GatewaySessionId,
    pub checkout_url: String,
}

/// Errors returned by a gateway adapter.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Network failure, timeout, rate limiting or a 5xx. Worth retrying.
    #[error("transient gateway failure: {0}")]
    Transient(String),

    /// The gateway refused the request. Retrying will not help.
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

impl TransientError for GatewayError {
    fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Trait for hosted-checkout gateway adapters.
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError>;
}
