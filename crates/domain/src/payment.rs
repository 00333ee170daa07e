//! Payment attempt record and its status state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{GatewaySessionId, PatientId, PaymentAttemptId, VisitId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Currency, DomainError, Money, Result};

/// The status of a payment attempt.
///
/// State transitions:
/// ```text
/// AwaitingPayment ──► Pending ──┬──► Completed
///        │                      └──► Expired
///        └──────────────────────────► Completed
/// ```
///
/// `Failed` is terminal but no transition produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Created from a charge request, no checkout session yet.
    AwaitingPayment,

    /// A checkout session is open at the gateway.
    Pending,

    /// The gateway confirmed payment (terminal).
    Completed,

    /// Reserved for an explicit gateway failure signal (terminal).
    Failed,

    /// The checkout session timed out (terminal).
    Expired,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 5] = [
        PaymentStatus::AwaitingPayment,
        PaymentStatus::Pending,
        PaymentStatus::Completed,
        PaymentStatus::Failed,
        PaymentStatus::Expired,
    ];

    /// Statuses that count against the one-active-attempt-per-charge invariant.
    pub const ACTIVE: [PaymentStatus; 2] = [PaymentStatus::AwaitingPayment, PaymentStatus::Pending];

    /// Returns true if no further transition is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Failed | PaymentStatus::Expired
        )
    }

    /// Returns true while the attempt can still be paid.
    pub fn is_active(&self) -> bool {
        matches!(self, PaymentStatus::AwaitingPayment | PaymentStatus::Pending)
    }

    /// The statuses from which a move to `to` is legal.
    ///
    /// Stores use this as the guard of a conditional update.
    pub fn allowed_sources(to: PaymentStatus) -> &'static [PaymentStatus] {
        match to {
            PaymentStatus::Pending => &[PaymentStatus::AwaitingPayment],
            PaymentStatus::Completed => &[PaymentStatus::AwaitingPayment, PaymentStatus::Pending],
            PaymentStatus::Expired => &[PaymentStatus::Pending],
            PaymentStatus::AwaitingPayment | PaymentStatus::Failed => &[],
        }
    }

    /// Returns true if the state machine has an edge from `self` to `to`.
    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        Self::allowed_sources(to).contains(self)
    }

    /// Returns the status name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::AwaitingPayment => "AWAITING_PAYMENT",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        PaymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

/// What a charge is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    InitialConsultation,
    VisitFee,
}

impl PaymentType {
    /// A charge tied to a visit is a visit fee; otherwise it is the initial consultation.
    pub fn for_visit(visit_id: Option<VisitId>) -> Self {
        if visit_id.is_some() {
            PaymentType::VisitFee
        } else {
            PaymentType::InitialConsultation
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::InitialConsultation => "INITIAL_CONSULTATION",
            PaymentType::VisitFee => "VISIT_FEE",
        }
    }

    /// Product description used when an attempt is created from a charge request.
    pub fn default_product_name(visit_id: Option<VisitId>) -> String {
        match visit_id {
            Some(visit) => format!("Consultation Fee for Visit #{visit}"),
            None => "Initial Consultation Fee".to_string(),
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INITIAL_CONSULTATION" => Ok(PaymentType::InitialConsultation),
            "VISIT_FEE" => Ok(PaymentType::VisitFee),
            other => Err(DomainError::UnknownPaymentType(other.to_string())),
        }
    }
}

/// The triple that at most one active attempt may exist for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChargeKey {
    pub patient_id: PatientId,
    pub visit_id: Option<VisitId>,
    pub payment_type: PaymentType,
}

impl ChargeKey {
    /// Builds the key, deriving the payment type from the visit's presence.
    pub fn new(patient_id: PatientId, visit_id: Option<VisitId>) -> Self {
        Self {
            patient_id,
            visit_id,
            payment_type: PaymentType::for_visit(visit_id),
        }
    }
}

/// Outcome of applying a status change to an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed.
    Applied,
    /// The attempt already held this terminal status; nothing was written.
    Unchanged,
}

/// One charge attempt: the durable audit record of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttempt {
    pub id: PaymentAttemptId,
    pub patient_id: PatientId,
    pub visit_id: Option<VisitId>,
    pub gateway_session_id: Option<GatewaySessionId>,
    pub amount: Money,
    pub currency: Currency,
    pub product_name: String,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    /// Event id of the charge request that created this attempt, if any.
    pub charge_request_id: Option<Uuid>,
    /// Set once the completion event for this attempt reached the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    /// A fresh attempt created from a charge request, waiting for checkout.
    pub fn awaiting(
        key: ChargeKey,
        amount: Money,
        currency: Currency,
        product_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentAttemptId::new(),
            patient_id: key.patient_id,
            visit_id: key.visit_id,
            gateway_session_id: None,
            amount,
            currency,
            product_name: product_name.into(),
            payment_type: key.payment_type,
            status: PaymentStatus::AwaitingPayment,
            charge_request_id: None,
            completion_published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An attempt created directly in `Pending` when checkout finds nothing to attach to.
    pub fn pending(
        key: ChargeKey,
        amount: Money,
        currency: Currency,
        product_name: impl Into<String>,
        session: GatewaySessionId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut attempt = Self::awaiting(key, amount, currency, product_name, now);
        attempt.status = PaymentStatus::Pending;
        attempt.gateway_session_id = Some(session);
        attempt
    }

    /// Records the charge request this attempt was created from.
    pub fn with_charge_request(mut self, event_id: Uuid) -> Self {
        self.charge_request_id = Some(event_id);
        self
    }

    pub fn key(&self) -> ChargeKey {
        ChargeKey {
            patient_id: self.patient_id,
            visit_id: self.visit_id,
            payment_type: self.payment_type,
        }
    }

    /// Moves to `to` if the state machine allows it.
    ///
    /// Re-applying the terminal status the attempt already holds is a no-op
    /// and leaves `updated_at` untouched.
    pub fn transition_to(&mut self, to: PaymentStatus, now: DateTime<Utc>) -> Result<Transition> {
        if self.status == to && to.is_terminal() {
            return Ok(Transition::Unchanged);
        }
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch(now);
        Ok(Transition::Applied)
    }

    /// Binds a checkout session and moves the attempt to `Pending`.
    ///
    /// A `Pending` attempt has its session replaced; the status stays put.
    pub fn attach_session(&mut self, session: GatewaySessionId, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            PaymentStatus::AwaitingPayment | PaymentStatus::Pending => {
                self.status = PaymentStatus::Pending;
                self.gateway_session_id = Some(session);
                self.touch(now);
                Ok(())
            }
            from => Err(DomainError::InvalidTransition {
                from,
                to: PaymentStatus::Pending,
            }),
        }
    }

    // updated_at never moves backwards, even if the clock does
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }
}
