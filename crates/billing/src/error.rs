use domain::DomainError;
use event_bus::EventBusError;
use thiserror::Error;

use crate::webhook::SignatureError;

/// Errors that can occur in billing operations.
#[derive(Debug, Error)]
pub enum BillingError {
    /// The request was malformed; nothing was changed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A webhook payload could not be parsed.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A webhook signature did not verify; nothing was changed.
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    /// A required secret or credential is missing.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The gateway call failed after retries, or the circuit breaker is open.
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// A concurrent writer kept winning a conditional update.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BillingError {
    /// True for failures that may clear up on a later try: storage, the bus,
    /// or a lost race on a conditional write.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::EventBus(_) | BillingError::Conflict(_)
        )
    }
}

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;
