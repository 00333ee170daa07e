//! Minimal patient registration and visit recording.
//!
//! Just enough of the patient service to start the saga: a registered patient
//! can record visits, and every fee-bearing visit becomes a charge request.

use chrono::Utc;
use common::PatientId;
use domain::{Money, Patient, Visit, derive_consultation_status};

use crate::{
    ConsultationFeeOrchestrator, NewVisit, PatientRecord, RecordsError, Result,
    SharedPatientStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterPatient {
    pub full_name: String,
    /// Charged as the initial consultation when positive.
    pub initial_consultation_fee: Option<Money>,
}

pub struct PatientIntake {
    store: SharedPatientStore,
    orchestrator: ConsultationFeeOrchestrator,
}

impl PatientIntake {
    pub fn new(store: SharedPatientStore, orchestrator: ConsultationFeeOrchestrator) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    #[tracing::instrument(skip(self, request))]
    pub async fn register_patient(&self, request: RegisterPatient) -> Result<Patient> {
        let full_name = request.full_name.trim();
        if full_name.is_empty() {
            return Err(RecordsError::Validation("fullName must not be blank".to_string()));
        }
        check_fee(request.initial_consultation_fee)?;

        let patient = self
            .store
            .insert_patient(Patient::new(full_name, Utc::now()))
            .await?;
        tracing::info!(patient_id = %patient.id, "patient registered");

        if let Some(fee) = request.initial_consultation_fee {
            self.orchestrator.initial_consultation(patient.id, fee).await?;
        }
        Ok(patient)
    }

    /// Stores the visit, re-derives the patient's status, then requests the fee.
    #[tracing::instrument(skip(self, visit))]
    pub async fn record_visit(&self, patient_id: PatientId, visit: NewVisit) -> Result<Visit> {
        check_fee(visit.fee)?;

        let visit = self.store.add_visit(patient_id, visit).await?;
        self.store
            .update(
                patient_id,
                Box::new(|record: &mut PatientRecord| {
                    let status = derive_consultation_status(
                        record.patient.consultation_payment_status,
                        &record.visits,
                    );
                    let changed = status != record.patient.consultation_payment_status;
                    record.patient.consultation_payment_status = status;
                    changed
                }),
            )
            .await?;
        tracing::info!(visit_id = %visit.id, fee = ?visit.fee, "visit recorded");

        self.orchestrator.visit_recorded(&visit).await?;
        Ok(visit)
    }

    pub async fn get_record(&self, patient_id: PatientId) -> Result<PatientRecord> {
        self.store
            .get_record(patient_id)
            .await?
            .ok_or(RecordsError::PatientNotFound(patient_id))
    }
}

fn check_fee(fee: Option<Money>) -> Result<()> {
    match fee {
        Some(fee) if fee.cents() < 0 => Err(RecordsError::Validation(format!(
            "fee must not be negative, got {fee}"
        ))),
        _ => Ok(()),
    }
}
