//! Patient record error types.

use common::{PatientId, VisitId};
use domain::DomainError;
use event_bus::EventBusError;
use thiserror::Error;

/// Errors that can occur while maintaining patient records.
#[derive(Debug, Error)]
pub enum RecordsError {
    #[error("Patient not found: {0}")]
    PatientNotFound(PatientId),

    #[error("Visit {visit_id} not found for patient {patient_id}")]
    VisitNotFound {
        patient_id: PatientId,
        visit_id: VisitId,
    },

    /// The request was malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A notification could not be handed over for pickup.
    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

/// Result type for patient record operations.
pub type Result<T> = std::result::Result<T, RecordsError>;
