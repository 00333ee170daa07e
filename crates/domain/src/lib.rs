//! Domain layer for the payment reconciliation saga.
//!
//! This crate provides:
//! - `Money` and `Currency` value objects
//! - The `PaymentAttempt` record and its status state machine
//! - Event contracts exchanged across service boundaries
//! - Patient and visit records with the payment projection rules

pub mod error;
pub mod events;
pub mod money;
pub mod patient;
pub mod payment;

pub use error::{DomainError, Result};
pub use events::{
    CompletionEvent, DomainEvent, DomainEventPublisher, InitialConsultationPaymentCompleted, PaymentInitiated,
    PaymentStatusUpdate, VisitFeeChargeRequested, VisitPaymentCompleted, topics,
};
pub use money::{Currency, Money};
pub use patient::{
    Appointment, ConsultationPaymentStatus, Patient, Visit, derive_consultation_status,
    earliest_paid_appointment, last_fee_visit,
};
pub use payment::{ChargeKey, PaymentAttempt, PaymentStatus, PaymentType, Transition};
