//! Charge-request handling: turns `VisitFeeChargeRequested` into an attempt.

use async_trait::async_trait;
use chrono::Utc;
use domain::{
    ChargeKey, Currency, DomainEvent, PaymentAttempt, PaymentType, VisitFeeChargeRequested,
    topics,
};
use event_bus::{EventEnvelope, EventHandler, EventId, HandlerError};

use crate::{InsertOutcome, Result, SharedAttemptStore};

/// Result of processing one charge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// A new attempt in `AwaitingPayment` was stored.
    Created(PaymentAttempt),
    /// The charge is already tracked; nothing was written.
    AlreadyTracked(PaymentAttempt),
    /// The fee was not positive.
    Skipped,
}

/// Consumes charge requests and creates attempts idempotently.
///
/// Redelivery of the same record is recognized by its event id, even after
/// the attempt it created has completed. A different request for a charge
/// that already has an active attempt is also a no-op.
pub struct ChargeRequestHandler {
    store: SharedAttemptStore,
    currency: Currency,
}

impl ChargeRequestHandler {
    pub fn new(store: SharedAttemptStore, currency: Currency) -> Self {
        Self { store, currency }
    }

    #[tracing::instrument(
        skip(self, request),
        fields(patient_id = %request.patient_id, visit_id = ?request.visit_id)
    )]
    pub async fn process(
        &self,
        event_id: EventId,
        request: &VisitFeeChargeRequested,
    ) -> Result<ChargeOutcome> {
        if !request.fee_amount.is_positive() {
            tracing::warn!(fee = %request.fee_amount, "ignoring charge request without a positive fee");
            return Ok(ChargeOutcome::Skipped);
        }

        let key = ChargeKey::new(request.patient_id, request.visit_id);
        let attempt = PaymentAttempt::awaiting(
            key,
            request.fee_amount,
            self.currency.clone(),
            PaymentType::default_product_name(request.visit_id),
            Utc::now(),
        )
        .with_charge_request(event_id.as_uuid());

        match self.store.insert(attempt).await? {
            InsertOutcome::Created(attempt) => {
                tracing::info!(attempt_id = %attempt.id, amount = %attempt.amount, "payment attempt created");
                metrics::counter!("payment_attempts_created", "source" => "charge_request").increment(1);
                Ok(ChargeOutcome::Created(attempt))
            }
            InsertOutcome::ActiveExists(existing) | InsertOutcome::DuplicateChargeRequest(existing) => {
                tracing::debug!(attempt_id = %existing.id, status = %existing.status, "charge already tracked");
                metrics::counter!("charge_requests_deduplicated").increment(1);
                Ok(ChargeOutcome::AlreadyTracked(existing))
            }
        }
    }
}

#[async_trait]
impl EventHandler for ChargeRequestHandler {
    fn name(&self) -> &'static str {
        "ChargeRequestHandler"
    }

    fn topics(&self) -> &'static [&'static str] {
        &[topics::VISIT_FEE_CHARGE_REQUESTED]
    }

    async fn handle(&self, event: &EventEnvelope) -> std::result::Result<(), HandlerError> {
        let request =
            VisitFeeChargeRequested::from_envelope(event).map_err(HandlerError::rejected)?;
        match self.process(event.event_id, &request).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable() => Err(HandlerError::failed(e)),
            Err(e) => Err(HandlerError::rejected(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryAttemptStore, PaymentAttemptStore};
    use common::{PatientId, VisitId};
    use domain::{Money, PaymentStatus};
    use std::sync::Arc;

    fn handler() -> (ChargeRequestHandler, InMemoryAttemptStore) {
        let store = InMemoryAttemptStore::new();
        (
            ChargeRequestHandler::new(Arc::new(store.clone()), Currency::usd()),
            store,
        )
    }

    fn request(visit: Option<i64>) -> VisitFeeChargeRequested {
        VisitFeeChargeRequested {
            patient_id: PatientId::new(),
            visit_id: visit.map(VisitId::new),
            fee_amount: Money::from_cents(5000),
        }
    }

    #[tokio::test]
    async fn creates_awaiting_attempt_with_generated_description() {
        let (handler, _store) = handler();
        let outcome = handler.process(EventId::new(), &request(Some(12))).await.unwrap();

        let ChargeOutcome::Created(attempt) = outcome else {
            panic!("expected a new attempt");
        };
        assert_eq!(attempt.status, PaymentStatus::AwaitingPayment);
        assert_eq!(attempt.payment_type, PaymentType::VisitFee);
        assert_eq!(attempt.product_name, "Consultation Fee for Visit #12");
        assert_eq!(attempt.currency, Currency::usd());
    }

    #[tokio::test]
    async fn redelivery_is_a_noop_even_after_completion() {
        let (handler, store) = handler();
        let event_id = EventId::new();
        let req = request(Some(1));

        let ChargeOutcome::Created(attempt) = handler.process(event_id, &req).await.unwrap() else {
            panic!("expected a new attempt");
        };
        store
            .transition(attempt.id, PaymentStatus::Completed)
            .await
            .unwrap();

        let again = handler.process(event_id, &req).await.unwrap();
        assert!(matches!(again, ChargeOutcome::AlreadyTracked(ref a) if a.id == attempt.id));
        assert_eq!(store.attempt_count().await, 1);
    }

    #[tokio::test]
    async fn distinct_request_for_active_charge_is_deduplicated() {
        let (handler, store) = handler();
        let req = request(None);

        handler.process(EventId::new(), &req).await.unwrap();
        let second = handler.process(EventId::new(), &req).await.unwrap();

        assert!(matches!(second, ChargeOutcome::AlreadyTracked(_)));
        assert_eq!(store.attempt_count().await, 1);
    }

    #[tokio::test]
    async fn zero_fee_is_skipped() {
        let (handler, store) = handler();
        let mut req = request(Some(1));
        req.fee_amount = Money::zero();

        assert_eq!(
            handler.process(EventId::new(), &req).await.unwrap(),
            ChargeOutcome::Skipped
        );
        assert_eq!(store.attempt_count().await, 0);
    }

    #[tokio::test]
    async fn handler_rejects_undecodable_payload() {
        let (handler, _store) = handler();
        let envelope = EventEnvelope::builder()
            .event_type("VisitFeeChargeRequested")
            .topic(topics::VISIT_FEE_CHARGE_REQUESTED)
            .key("k")
            .payload_raw(serde_json::json!({"unexpected": true}))
            .build()
            .unwrap();
        assert!(handler.handle(&envelope).await.is_err());
    }
}
