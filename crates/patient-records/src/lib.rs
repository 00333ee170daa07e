//! Patient record side of the payment reconciliation saga.
//!
//! This crate provides:
//! - `PatientRecordStore`, the patient and visit records the saga projects into
//! - `ConsultationFeeOrchestrator`, which asks billing to charge fee-bearing visits
//! - `PatientIntake`, minimal patient registration and visit recording
//! - `PatientPaymentProjector`, the idempotent consumer of payment events
//! - `NotificationCache`, a bounded TTL cache of payment notifications

pub mod error;
pub mod intake;
pub mod notification;
pub mod orchestrator;
pub mod projector;
pub mod store;

pub use error::{RecordsError, Result};
pub use intake::{PatientIntake, RegisterPatient};
pub use notification::{
    NotificationCache, NotificationSettings, PaymentNotification, PaymentNotifier,
};
pub use orchestrator::ConsultationFeeOrchestrator;
pub use projector::{PatientPaymentProjector, ProjectionOutcome};
pub use store::{
    InMemoryPatientStore, NewVisit, PatientRecord, PatientRecordStore, RecordChange,
    RecordUpdate, SharedPatientStore,
};
