//! Event contracts exchanged between the patient record and billing services.
//!
//! Payloads use camelCase field names on the wire.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{GatewaySessionId, PatientId, PaymentAttemptId, VisitId};
use event_bus::{EventBus, EventEnvelope, Offset};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{Currency, Money, PaymentAttempt, PaymentStatus, PaymentType, Result};

/// Topic names on the bus.
pub mod topics {
    pub const VISIT_FEE_CHARGE_REQUESTED: &str = "visit-fee-charge-requested";
    pub const PAYMENT_INITIATED: &str = "payment-initiated-events";
    pub const VISIT_PAYMENT_COMPLETED: &str = "visit-payment-completed";
    pub const INITIAL_CONSULTATION_PAYMENT_COMPLETED: &str =
        "initial-consultation-payment-completed";
    pub const PAYMENT_STATUS_UPDATES: &str = "payment-status-updates";
}

/// Trait for events that travel over the bus.
///
/// Each event type has a fixed topic and derives its partition key from its
/// own payload.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    fn event_type(&self) -> &'static str;

    /// Returns the topic the event is published to.
    fn topic(&self) -> &'static str;

    /// Returns the partition key.
    fn partition_key(&self) -> String;

    /// Wraps the event in a bus envelope.
    fn to_envelope(&self) -> Result<EventEnvelope> {
        Ok(EventEnvelope::builder()
            .event_type(self.event_type())
            .topic(self.topic())
            .key(self.partition_key())
            .payload(self)?
            .build()?)
    }

    /// Decodes the event from an envelope's payload.
    fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        Ok(envelope.decode()?)
    }
}

/// Extension trait for publishing typed events to any bus.
#[async_trait]
pub trait DomainEventPublisher: EventBus {
    /// Wraps and publishes a single event.
    async fn publish_event<E: DomainEvent>(&self, event: &E) -> Result<(u32, Offset)> {
        Ok(self.publish(event.to_envelope()?).await?)
    }
}

// Blanket implementation for all EventBus implementations
impl<T: EventBus + ?Sized> DomainEventPublisher for T {}

/// Asks billing to begin tracking a fee for a visit or the initial consultation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitFeeChargeRequested {
    pub patient_id: PatientId,
    pub visit_id: Option<VisitId>,
    pub fee_amount: Money,
}

impl DomainEvent for VisitFeeChargeRequested {
    fn event_type(&self) -> &'static str {
        "VisitFeeChargeRequested"
    }

    fn topic(&self) -> &'static str {
        topics::VISIT_FEE_CHARGE_REQUESTED
    }

    fn partition_key(&self) -> String {
        self.patient_id.to_string()
    }
}

/// A checkout session was opened at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInitiated {
    pub patient_id: PatientId,
    pub session_id: GatewaySessionId,
    pub amount: Money,
    pub currency: Currency,
    pub product_name: String,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for PaymentInitiated {
    fn event_type(&self) -> &'static str {
        "PaymentInitiated"
    }

    fn topic(&self) -> &'static str {
        topics::PAYMENT_INITIATED
    }

    fn partition_key(&self) -> String {
        self.session_id.to_string()
    }
}

/// A visit fee was paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitPaymentCompleted {
    pub patient_id: PatientId,
    pub visit_id: VisitId,
    pub payment_attempt_id: PaymentAttemptId,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for VisitPaymentCompleted {
    fn event_type(&self) -> &'static str {
        "VisitPaymentCompleted"
    }

    fn topic(&self) -> &'static str {
        topics::VISIT_PAYMENT_COMPLETED
    }

    fn partition_key(&self) -> String {
        self.patient_id.to_string()
    }
}

/// The initial consultation fee was paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialConsultationPaymentCompleted {
    pub patient_id: PatientId,
    pub payment_attempt_id: PaymentAttemptId,
    pub amount: Money,
    pub currency: Currency,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for InitialConsultationPaymentCompleted {
    fn event_type(&self) -> &'static str {
        "InitialConsultationPaymentCompletedEvent"
    }

    fn topic(&self) -> &'static str {
        topics::INITIAL_CONSULTATION_PAYMENT_COMPLETED
    }

    fn partition_key(&self) -> String {
        self.patient_id.to_string()
    }
}

/// An attempt reached a terminal status through a gateway callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusUpdate {
    pub patient_id: PatientId,
    pub session_id: GatewaySessionId,
    pub status: PaymentStatus,
    pub amount: Money,
    pub currency: Currency,
    pub timestamp: DateTime<Utc>,
}

impl PaymentStatusUpdate {
    /// Snapshot of an attempt's status. `None` if the attempt has no session.
    pub fn for_attempt(attempt: &PaymentAttempt, timestamp: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            patient_id: attempt.patient_id,
            session_id: attempt.gateway_session_id.clone()?,
            status: attempt.status,
            amount: attempt.amount,
            currency: attempt.currency.clone(),
            timestamp,
        })
    }
}

impl DomainEvent for PaymentStatusUpdate {
    fn event_type(&self) -> &'static str {
        "PaymentStatusUpdateEvent"
    }

    fn topic(&self) -> &'static str {
        topics::PAYMENT_STATUS_UPDATES
    }

    fn partition_key(&self) -> String {
        self.session_id.to_string()
    }
}

/// The completion event a paid attempt produces, chosen by payment type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    Visit(VisitPaymentCompleted),
    InitialConsultation(InitialConsultationPaymentCompleted),
}

impl CompletionEvent {
    pub fn for_attempt(attempt: &PaymentAttempt, timestamp: DateTime<Utc>) -> Self {
        match (attempt.payment_type, attempt.visit_id) {
            (PaymentType::VisitFee, Some(visit_id)) => Self::Visit(VisitPaymentCompleted {
                patient_id: attempt.patient_id,
                visit_id,
                payment_attempt_id: attempt.id,
                timestamp,
            }),
            _ => Self::InitialConsultation(InitialConsultationPaymentCompleted {
                patient_id: attempt.patient_id,
                payment_attempt_id: attempt.id,
                amount: attempt.amount,
                currency: attempt.currency.clone(),
                timestamp,
            }),
        }
    }

    pub fn to_envelope(&self) -> Result<EventEnvelope> {
        match self {
            Self::Visit(event) => event.to_envelope(),
            Self::InitialConsultation(event) => event.to_envelope(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Visit(event) => event.event_type(),
            Self::InitialConsultation(event) => event.event_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChargeKey;

    #[test]
    fn charge_request_is_keyed_by_patient() {
        let patient_id = PatientId::new();
        let event = VisitFeeChargeRequested {
            patient_id,
            visit_id: Some(VisitId::new(9)),
            fee_amount: Money::from_cents(5000),
        };

        let envelope = event.to_envelope().unwrap();
        assert_eq!(envelope.topic, topics::VISIT_FEE_CHARGE_REQUESTED);
        assert_eq!(envelope.key, patient_id.to_string());
        assert_eq!(envelope.payload["visitId"], 9);
        assert_eq!(envelope.payload["feeAmount"], "50.00");

        let decoded = VisitFeeChargeRequested::from_envelope(&envelope).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn initiated_is_keyed_by_session() {
        let event = PaymentInitiated {
            patient_id: PatientId::new(),
            session_id: GatewaySessionId::new("cs_test_1"),
            amount: Money::from_cents(5000),
            currency: Currency::usd(),
            product_name: "Initial Consultation Fee".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.to_envelope().unwrap().key, "cs_test_1");
    }

    #[test]
    fn completion_event_follows_payment_type() {
        let now = Utc::now();
        let visit = PaymentAttempt::awaiting(
            ChargeKey::new(PatientId::new(), Some(VisitId::new(4))),
            Money::from_cents(5000),
            Currency::usd(),
            "fee",
            now,
        );
        let initial = PaymentAttempt::awaiting(
            ChargeKey::new(PatientId::new(), None),
            Money::from_cents(7500),
            Currency::usd(),
            "fee",
            now,
        );

        let visit_event = CompletionEvent::for_attempt(&visit, now);
        assert!(matches!(visit_event, CompletionEvent::Visit(ref e) if e.visit_id == VisitId::new(4)));
        assert_eq!(
            visit_event.to_envelope().unwrap().topic,
            topics::VISIT_PAYMENT_COMPLETED
        );

        let initial_event = CompletionEvent::for_attempt(&initial, now);
        let CompletionEvent::InitialConsultation(ref e) = initial_event else {
            panic!("expected initial consultation completion");
        };
        assert_eq!(e.amount, Money::from_cents(7500));
        assert_eq!(
            initial_event.to_envelope().unwrap().event_type,
            "InitialConsultationPaymentCompletedEvent"
        );
    }

    #[tokio::test]
    async fn publisher_routes_to_event_topic() {
        let bus = event_bus::InMemoryEventBus::new(4);
        let event = VisitFeeChargeRequested {
            patient_id: PatientId::new(),
            visit_id: None,
            fee_amount: Money::from_cents(2500),
        };

        bus.publish_event(&event).await.unwrap();
        let published = bus.published(topics::VISIT_FEE_CHARGE_REQUESTED).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, "VisitFeeChargeRequested");
    }

    #[test]
    fn status_update_requires_session() {
        let attempt = PaymentAttempt::awaiting(
            ChargeKey::new(PatientId::new(), None),
            Money::from_cents(100),
            Currency::usd(),
            "fee",
            Utc::now(),
        );
        assert!(PaymentStatusUpdate::for_attempt(&attempt, Utc::now()).is_none());
    }
}
