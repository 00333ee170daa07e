//! Projects payment events into patient and visit payment status.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{PatientId, VisitId};
use domain::{
    ConsultationPaymentStatus, DomainEvent, InitialConsultationPaymentCompleted, PaymentInitiated,
    PaymentType, VisitPaymentCompleted, derive_consultation_status, earliest_paid_appointment,
    topics,
};
use event_bus::{EventEnvelope, EventHandler, HandlerError};

use crate::{
    PatientRecord, PaymentNotification, PaymentNotifier, RecordsError, Result, SharedPatientStore,
};

/// Marks a visit paid and recomputes the patient's derived fields.
///
/// Returns false if the visit is unknown or already paid.
pub fn apply_visit_paid(record: &mut PatientRecord, visit_id: VisitId) -> bool {
    let Some(visit) = record.visit_mut(visit_id) else {
        return false;
    };
    if visit.is_paid() {
        return false;
    }
    visit.payment_status = ConsultationPaymentStatus::Paid;
    let has_appointment = visit.appointment.is_some();

    if has_appointment {
        record.patient.main_appointment = earliest_paid_appointment(&record.visits);
    }
    record.patient.consultation_payment_status =
        derive_consultation_status(record.patient.consultation_payment_status, &record.visits);
    true
}

/// Marks the initial consultation paid.
pub fn apply_initial_consultation_paid(record: &mut PatientRecord) -> bool {
    if record.patient.consultation_payment_status == ConsultationPaymentStatus::Paid {
        return false;
    }
    record.patient.consultation_payment_status = ConsultationPaymentStatus::Paid;
    true
}

/// Moves a `NotPaid` patient to `PaymentPending`. Never downgrades `Paid`.
pub fn apply_payment_initiated(record: &mut PatientRecord) -> bool {
    if record.patient.consultation_payment_status != ConsultationPaymentStatus::NotPaid {
        return false;
    }
    record.patient.consultation_payment_status = ConsultationPaymentStatus::PaymentPending;
    true
}

/// What a projected event did to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionOutcome {
    /// The record changed.
    Applied(PatientRecord),
    /// The event had already been applied.
    Unchanged,
    UnknownPatient,
    UnknownVisit,
}

impl ProjectionOutcome {
    fn label(&self) -> &'static str {
        match self {
            ProjectionOutcome::Applied(_) => "applied",
            ProjectionOutcome::Unchanged => "unchanged",
            ProjectionOutcome::UnknownPatient => "unknown_patient",
            ProjectionOutcome::UnknownVisit => "unknown_visit",
        }
    }
}

/// Consumes payment events and updates patient records idempotently.
///
/// Events for unknown patients or visits are logged and skipped so they
/// cannot block the partition. Notifications are sent only when a completion
/// changed the record, and a failing notifier never fails the update.
pub struct PatientPaymentProjector {
    store: SharedPatientStore,
    notifier: Arc<dyn PaymentNotifier>,
}

impl PatientPaymentProjector {
    pub fn new(store: SharedPatientStore, notifier: Arc<dyn PaymentNotifier>) -> Self {
        Self { store, notifier }
    }

    #[tracing::instrument(
        skip(self, event),
        fields(patient_id = %event.patient_id, visit_id = %event.visit_id, attempt_id = %event.payment_attempt_id)
    )]
    pub async fn visit_payment_completed(
        &self,
        event: &VisitPaymentCompleted,
    ) -> Result<ProjectionOutcome> {
        let visit_id = event.visit_id;
        let update = move |record: &mut PatientRecord| apply_visit_paid(record, visit_id);
        let outcome = match self.apply(event.patient_id, Box::new(update)).await? {
            ProjectionOutcome::Unchanged => {
                self.classify_unchanged(event.patient_id, visit_id).await?
            }
            other => other,
        };
        self.finish(event.patient_id, PaymentType::VisitFee, &outcome);
        Ok(outcome)
    }

    #[tracing::instrument(
        skip(self, event),
        fields(patient_id = %event.patient_id, attempt_id = %event.payment_attempt_id)
    )]
    pub async fn initial_consultation_paid(
        &self,
        event: &InitialConsultationPaymentCompleted,
    ) -> Result<ProjectionOutcome> {
        let outcome = self
            .apply(event.patient_id, Box::new(apply_initial_consultation_paid))
            .await?;
        self.finish(event.patient_id, PaymentType::InitialConsultation, &outcome);
        Ok(outcome)
    }

    #[tracing::instrument(skip(self, event), fields(patient_id = %event.patient_id, session_id = %event.session_id))]
    pub async fn payment_initiated(&self, event: &PaymentInitiated) -> Result<ProjectionOutcome> {
        let outcome = self
            .apply(event.patient_id, Box::new(apply_payment_initiated))
            .await?;
        record_outcome("payment_initiated", &outcome);
        Ok(outcome)
    }

    async fn apply(
        &self,
        patient_id: PatientId,
        update: crate::RecordUpdate,
    ) -> Result<ProjectionOutcome> {
        match self.store.update(patient_id, update).await {
            Ok(change) if change.changed => Ok(ProjectionOutcome::Applied(change.record)),
            Ok(_) => Ok(ProjectionOutcome::Unchanged),
            Err(RecordsError::PatientNotFound(_)) => {
                tracing::warn!("payment event for unknown patient skipped");
                Ok(ProjectionOutcome::UnknownPatient)
            }
            Err(e) => Err(e),
        }
    }

    async fn classify_unchanged(
        &self,
        patient_id: PatientId,
        visit_id: VisitId,
    ) -> Result<ProjectionOutcome> {
        let known = self
            .store
            .get_record(patient_id)
            .await?
            .is_some_and(|record| record.visit(visit_id).is_some());
        if known {
            Ok(ProjectionOutcome::Unchanged)
        } else {
            tracing::warn!("payment event for unknown visit skipped");
            Ok(ProjectionOutcome::UnknownVisit)
        }
    }

    fn finish(&self, patient_id: PatientId, payment_type: PaymentType, outcome: &ProjectionOutcome) {
        record_outcome("payment_completed", outcome);

        let ProjectionOutcome::Applied(record) = outcome else {
            return;
        };
        tracing::info!(
            consultation_status = %record.patient.consultation_payment_status,
            "payment projected"
        );

        let notification = PaymentNotification::completed(payment_type, Utc::now());
        if let Err(e) = self.notifier.notify(patient_id, notification) {
            tracing::warn!(error = %e, "payment notification dropped");
        }
    }
}

fn record_outcome(event: &'static str, outcome: &ProjectionOutcome) {
    metrics::counter!(
        "projector_updates",
        "event" => event,
        "outcome" => outcome.label()
    )
    .increment(1);
}

#[async_trait]
impl EventHandler for PatientPaymentProjector {
    fn name(&self) -> &'static str {
        "PatientPaymentProjector"
    }

    fn topics(&self) -> &'static [&'static str] {
        &[
            topics::PAYMENT_INITIATED,
            topics::VISIT_PAYMENT_COMPLETED,
            topics::INITIAL_CONSULTATION_PAYMENT_COMPLETED,
        ]
    }

    async fn handle(&self, event: &EventEnvelope) -> std::result::Result<(), HandlerError> {
        match event.topic.as_str() {
            topics::VISIT_PAYMENT_COMPLETED => {
                let completed =
                    VisitPaymentCompleted::from_envelope(event).map_err(HandlerError::rejected)?;
                self.visit_payment_completed(&completed)
                    .await
                    .map_err(HandlerError::failed)?;
            }
            topics::INITIAL_CONSULTATION_PAYMENT_COMPLETED => {
                let paid = InitialConsultationPaymentCompleted::from_envelope(event)
                    .map_err(HandlerError::rejected)?;
                self.initial_consultation_paid(&paid)
                    .await
                    .map_err(HandlerError::failed)?;
            }
            topics::PAYMENT_INITIATED => {
                let initiated =
                    PaymentInitiated::from_envelope(event).map_err(HandlerError::rejected)?;
                self.payment_initiated(&initiated)
                    .await
                    .map_err(HandlerError::failed)?;
            }
            other => tracing::debug!(topic = other, "ignoring record"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use domain::{Appointment, Money, Patient, Visit};

    fn record(visits: &[(i64, u32, ConsultationPaymentStatus, Option<u32>)]) -> PatientRecord {
        let patient = Patient::new("Ada", Utc::now());
        let visits = visits
            .iter()
            .map(|&(id, day, status, appointment_day)| Visit {
                id: VisitId::new(id),
                patient_id: patient.id,
                visit_date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
                fee: Some(Money::from_cents(5000)),
                payment_status: status,
                appointment: appointment_day.map(|d| Appointment {
                    scheduled_at: Utc.with_ymd_and_hms(2025, 2, d, 10, 0, 0).unwrap(),
                    notes: None,
                }),
            })
            .collect();
        PatientRecord { patient, visits }
    }

    #[test]
    fn paying_latest_visit_makes_patient_paid() {
        use ConsultationPaymentStatus::*;
        let mut r = record(&[(1, 1, NotPaid, None), (2, 2, NotPaid, None)]);

        assert!(apply_visit_paid(&mut r, VisitId::new(2)));
        assert_eq!(r.visit(VisitId::new(2)).unwrap().payment_status, Paid);
        assert_eq!(r.patient.consultation_payment_status, Paid);
    }

    #[test]
    fn paying_earlier_visit_leaves_patient_unpaid() {
        use ConsultationPaymentStatus::*;
        let mut r = record(&[(1, 1, NotPaid, None), (2, 2, NotPaid, None)]);

        assert!(apply_visit_paid(&mut r, VisitId::new(1)));
        assert_eq!(r.patient.consultation_payment_status, NotPaid);
    }

    #[test]
    fn reapplying_is_a_noop() {
        use ConsultationPaymentStatus::*;
        let mut r = record(&[(1, 1, Paid, None)]);
        let before = r.clone();

        assert!(!apply_visit_paid(&mut r, VisitId::new(1)));
        assert!(!apply_visit_paid(&mut r, VisitId::new(99)));
        assert_eq!(r, before);
    }

    #[test]
    fn main_appointment_is_earliest_among_paid_visits() {
        use ConsultationPaymentStatus::*;
        let mut r = record(&[(1, 1, Paid, Some(20)), (2, 2, NotPaid, Some(5)), (3, 3, NotPaid, Some(1))]);

        assert!(apply_visit_paid(&mut r, VisitId::new(2)));
        let main = r.patient.main_appointment.clone().unwrap();
        assert_eq!(main.scheduled_at, Utc.with_ymd_and_hms(2025, 2, 5, 10, 0, 0).unwrap());
    }

    #[test]
    fn visit_without_appointment_keeps_main_appointment() {
        use ConsultationPaymentStatus::*;
        let mut r = record(&[(1, 1, NotPaid, None)]);
        let kept = Appointment {
            scheduled_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
            notes: Some("booked at the desk".to_string()),
        };
        r.patient.main_appointment = Some(kept.clone());

        assert!(apply_visit_paid(&mut r, VisitId::new(1)));
        assert_eq!(r.patient.main_appointment, Some(kept));
    }

    #[test]
    fn initiated_never_downgrades_paid() {
        let mut r = record(&[]);
        assert!(apply_payment_initiated(&mut r));
        assert_eq!(
            r.patient.consultation_payment_status,
            ConsultationPaymentStatus::PaymentPending
        );
        assert!(!apply_payment_initiated(&mut r));

        r.patient.consultation_payment_status = ConsultationPaymentStatus::Paid;
        assert!(!apply_payment_initiated(&mut r));
        assert_eq!(r.patient.consultation_payment_status, ConsultationPaymentStatus::Paid);
    }

    #[test]
    fn initial_consultation_paid_once() {
        let mut r = record(&[]);
        assert!(apply_initial_consultation_paid(&mut r));
        assert!(!apply_initial_consultation_paid(&mut r));
        assert_eq!(r.patient.consultation_payment_status, ConsultationPaymentStatus::Paid);
    }
}
