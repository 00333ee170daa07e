//! Domain error types.

use event_bus::EventBusError;
use thiserror::Error;

use crate::payment::PaymentStatus;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The requested status change is not an edge of the attempt state machine.
    #[error("Cannot move payment attempt from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    /// A monetary amount could not be parsed or is out of range.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// A currency code is not a three-letter ISO code.
    #[error("Invalid currency: {0}")]
    InvalidCurrency(String),

    /// A status string is not one of the known values.
    #[error("Unknown payment status: {0}")]
    UnknownStatus(String),

    /// A payment type string is not one of the known values.
    #[error("Unknown payment type: {0}")]
    UnknownPaymentType(String),

    /// Building or decoding an event envelope failed.
    #[error("Event error: {0}")]
    Event(#[from] EventBusError),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
