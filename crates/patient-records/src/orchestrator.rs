//! Turns fee-bearing visits into charge requests for billing.

use common::PatientId;
use domain::{DomainEventPublisher, Money, Visit, VisitFeeChargeRequested};
use event_bus::SharedEventBus;

use crate::Result;

/// Publishes `VisitFeeChargeRequested` for every positive fee.
///
/// Publishing is the only side effect. Billing deduplicates redelivered
/// requests, so a retried publish is harmless.
pub struct ConsultationFeeOrchestrator {
    bus: SharedEventBus,
}

impl ConsultationFeeOrchestrator {
    pub fn new(bus: SharedEventBus) -> Self {
        Self { bus }
    }

    /// Requests a charge for a recorded visit. Visits without a positive fee
    /// publish nothing.
    #[tracing::instrument(skip(self, visit), fields(patient_id = %visit.patient_id, visit_id = %visit.id))]
    pub async fn visit_recorded(&self, visit: &Visit) -> Result<Option<VisitFeeChargeRequested>> {
        match visit.fee {
            Some(fee) if fee.is_positive() => {
                self.request_charge(visit.patient_id, Some(visit), fee).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Requests a charge for the patient's initial consultation.
    #[tracing::instrument(skip(self))]
    pub async fn initial_consultation(
        &self,
        patient_id: PatientId,
        fee: Money,
    ) -> Result<Option<VisitFeeChargeRequested>> {
        if !fee.is_positive() {
            return Ok(None);
        }
        self.request_charge(patient_id, None, fee).await.map(Some)
    }

    async fn request_charge(
        &self,
        patient_id: PatientId,
        visit: Option<&Visit>,
        fee: Money,
    ) -> Result<VisitFeeChargeRequested> {
        let event = VisitFeeChargeRequested {
            patient_id,
            visit_id: visit.map(|v| v.id),
            fee_amount: fee,
        };
        self.bus.publish_event(&event).await?;

        tracing::info!(fee = %fee, "charge requested");
        metrics::counter!("charge_requests_published").increment(1);
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use common::VisitId;
    use domain::{ConsultationPaymentStatus, DomainEvent, topics};
    use event_bus::InMemoryEventBus;
    use std::sync::Arc;

    fn visit(fee: Option<i64>) -> Visit {
        Visit {
            id: VisitId::new(3),
            patient_id: PatientId::new(),
            visit_date: NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
            fee: fee.map(Money::from_cents),
            payment_status: ConsultationPaymentStatus::NotPaid,
            appointment: None,
        }
    }

    #[tokio::test]
    async fn fee_bearing_visit_is_published_under_patient_key() {
        let bus = InMemoryEventBus::new(4);
        let orchestrator = ConsultationFeeOrchestrator::new(Arc::new(bus.clone()));
        let visit = visit(Some(5000));

        let event = orchestrator.visit_recorded(&visit).await.unwrap().unwrap();
        assert_eq!(event.visit_id, Some(VisitId::new(3)));

        let published = bus.published(topics::VISIT_FEE_CHARGE_REQUESTED).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, visit.patient_id.to_string());
        assert_eq!(
            VisitFeeChargeRequested::from_envelope(&published[0]).unwrap(),
            event
        );
    }

    #[tokio::test]
    async fn free_visits_publish_nothing() {
        let bus = InMemoryEventBus::new(4);
        let orchestrator = ConsultationFeeOrchestrator::new(Arc::new(bus.clone()));

        assert!(orchestrator.visit_recorded(&visit(None)).await.unwrap().is_none());
        assert!(orchestrator.visit_recorded(&visit(Some(0))).await.unwrap().is_none());
        assert!(
            orchestrator
                .initial_consultation(PatientId::new(), Money::zero())
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(bus.event_count().await, 0);
    }

    #[tokio::test]
    async fn initial_consultation_has_no_visit() {
        let bus = InMemoryEventBus::new(4);
        let orchestrator = ConsultationFeeOrchestrator::new(Arc::new(bus.clone()));

        let event = orchestrator
            .initial_consultation(PatientId::new(), Money::from_cents(7500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.visit_id, None);
        assert_eq!(event.fee_amount, Money::from_cents(7500));
    }
}
