//! Persistence for payment attempts.
//!
//! All writes are single-row and status-guarded. Implementations enforce the
//! one-active-attempt-per-charge invariant and session id uniqueness
//! themselves, so callers never need a lock.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use common::{GatewaySessionId, PatientId, PaymentAttemptId, VisitId};
use domain::{ChargeKey, PaymentAttempt, PaymentStatus};
use uuid::Uuid;

use crate::Result;

pub use memory::InMemoryAttemptStore;
pub use postgres::PostgresAttemptStore;

/// What happened when an attempt was offered to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The attempt was stored.
    Created(PaymentAttempt),
    /// An active attempt already exists for the same charge key.
    ActiveExists(PaymentAttempt),
    /// An attempt created from the same charge request already exists.
    DuplicateChargeRequest(PaymentAttempt),
}

impl InsertOutcome {
    /// The attempt that now represents the charge, new or existing.
    pub fn attempt(&self) -> &PaymentAttempt {
        match self {
            InsertOutcome::Created(a)
            | InsertOutcome::ActiveExists(a)
            | InsertOutcome::DuplicateChargeRequest(a) => a,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Core trait for attempt store implementations.
#[async_trait]
pub trait PaymentAttemptStore: Send + Sync {
    /// Stores a new attempt unless its charge request was already seen, or
    /// (for an active attempt) another active attempt holds its charge key.
    async fn insert(&self, attempt: PaymentAttempt) -> Result<InsertOutcome>;

    async fn get(&self, id: PaymentAttemptId) -> Result<Option<PaymentAttempt>>;

    async fn find_by_session(&self, session: &GatewaySessionId) -> Result<Option<PaymentAttempt>>;

    /// The attempt in `AwaitingPayment` or `Pending` for the key, if any.
    async fn find_active(&self, key: ChargeKey) -> Result<Option<PaymentAttempt>>;

    /// All attempts of a patient, newest first.
    async fn list_for_patient(&self, patient_id: PatientId) -> Result<Vec<PaymentAttempt>>;

    /// The most recently created attempt for a visit, in any status.
    async fn latest_for_visit(
        &self,
        patient_id: PatientId,
        visit_id: VisitId,
    ) -> Result<Option<PaymentAttempt>>;

    /// Binds a checkout session and moves the attempt to `Pending`, provided
    /// it is still in `expected`. Returns `None` if the guard did not hold.
    async fn attach_session(
        &self,
        id: PaymentAttemptId,
        session: GatewaySessionId,
        expected: PaymentStatus,
    ) -> Result<Option<PaymentAttempt>>;

    /// Moves the attempt to `to` if its current status is an allowed source.
    /// Returns the updated attempt, or `None` if nothing was written.
    async fn transition(
        &self,
        id: PaymentAttemptId,
        to: PaymentStatus,
    ) -> Result<Option<PaymentAttempt>>;

    /// Records that the completion event for a `Completed` attempt was
    /// published. Leaves `updated_at` alone; a second call is a no-op.
    async fn mark_completion_published(&self, id: PaymentAttemptId) -> Result<()>;
}

/// Shared handle to any attempt store.
pub type SharedAttemptStore = Arc<dyn PaymentAttemptStore>;

pub(crate) fn charge_request_matches(attempt: &PaymentAttempt, charge_request_id: Option<Uuid>) -> bool {
    charge_request_id.is_some() && attempt.charge_request_id == charge_request_id
}
