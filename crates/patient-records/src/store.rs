//! Patient and visit records.
//!
//! The record store stands in for the patient service's database. The saga
//! only needs to read a patient together with its visits and to apply
//! read-modify-write updates to that pair atomically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use common::{PatientId, VisitId};
use domain::{Appointment, ConsultationPaymentStatus, Money, Patient, Visit};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{RecordsError, Result};

/// A patient with every visit recorded for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    pub patient: Patient,
    pub visits: Vec<Visit>,
}

impl PatientRecord {
    pub fn new(patient: Patient) -> Self {
        Self {
            patient,
            visits: Vec::new(),
        }
    }

    pub fn visit(&self, visit_id: VisitId) -> Option<&Visit> {
        self.visits.iter().find(|v| v.id == visit_id)
    }

    pub fn visit_mut(&mut self, visit_id: VisitId) -> Option<&mut Visit> {
        self.visits.iter_mut().find(|v| v.id == visit_id)
    }
}

/// A visit as submitted, before the store numbers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVisit {
    pub visit_date: NaiveDate,
    pub fee: Option<Money>,
    pub appointment: Option<Appointment>,
}

/// An in-place change to a record. Returns whether anything changed.
pub type RecordUpdate = Box<dyn FnOnce(&mut PatientRecord) -> bool + Send>;

/// The record after an update, and whether the update changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub record: PatientRecord,
    pub changed: bool,
}

/// Core trait for patient record store implementations.
#[async_trait]
pub trait PatientRecordStore: Send + Sync {
    /// Stores a newly registered patient.
    async fn insert_patient(&self, patient: Patient) -> Result<Patient>;

    async fn get_record(&self, patient_id: PatientId) -> Result<Option<PatientRecord>>;

    /// Records a visit and assigns its id.
    async fn add_visit(&self, patient_id: PatientId, visit: NewVisit) -> Result<Visit>;

    /// Applies `update` to the record atomically.
    ///
    /// `updated_at` is bumped only when the update reports a change.
    async fn update(&self, patient_id: PatientId, update: RecordUpdate) -> Result<RecordChange>;
}

/// Shared handle to a record store.
pub type SharedPatientStore = Arc<dyn PatientRecordStore>;

#[derive(Default)]
struct RecordsState {
    records: HashMap<PatientId, PatientRecord>,
    last_visit_id: i64,
}

/// In-memory record store.
#[derive(Clone, Default)]
pub struct InMemoryPatientStore {
    state: Arc<RwLock<RecordsState>>,
}

impl InMemoryPatientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn patient_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

#[async_trait]
impl PatientRecordStore for InMemoryPatientStore {
    async fn insert_patient(&self, patient: Patient) -> Result<Patient> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&patient.id) {
            return Err(RecordsError::Validation(format!(
                "patient {} already exists",
                patient.id
            )));
        }
        state
            .records
            .insert(patient.id, PatientRecord::new(patient.clone()));
        Ok(patient)
    }

    async fn get_record(&self, patient_id: PatientId) -> Result<Option<PatientRecord>> {
        Ok(self.state.read().await.records.get(&patient_id).cloned())
    }

    async fn add_visit(&self, patient_id: PatientId, visit: NewVisit) -> Result<Visit> {
        let mut state = self.state.write().await;
        if !state.records.contains_key(&patient_id) {
            return Err(RecordsError::PatientNotFound(patient_id));
        }

        state.last_visit_id += 1;
        let visit = Visit {
            id: VisitId::new(state.last_visit_id),
            patient_id,
            visit_date: visit.visit_date,
            fee: visit.fee,
            payment_status: ConsultationPaymentStatus::NotPaid,
            appointment: visit.appointment,
        };

        let record = state
            .records
            .get_mut(&patient_id)
            .ok_or(RecordsError::PatientNotFound(patient_id))?;
        record.visits.push(visit.clone());
        record.patient.updated_at = Utc::now();
        Ok(visit)
    }

    async fn update(&self, patient_id: PatientId, update: RecordUpdate) -> Result<RecordChange> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(&patient_id)
            .ok_or(RecordsError::PatientNotFound(patient_id))?;

        let changed = update(record);
        if changed {
            record.patient.updated_at = Utc::now().max(record.patient.updated_at);
        }
        Ok(RecordChange {
            record: record.clone(),
            changed,
        })
    }
}
