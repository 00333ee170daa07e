//! Identifier types shared by every service boundary.

pub mod types;

pub use types::{GatewaySessionId, IdParseError, PatientId, PaymentAttemptId, VisitId};
