//! Patient intake and payment status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::NaiveDate;
use common::PatientId;
use domain::{Appointment, Money, Patient, Visit};
use patient_records::{NewVisit, PatientRecord, RegisterPatient};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPatientRequest {
    pub full_name: String,
    #[serde(default)]
    pub initial_consultation_fee: Option<Money>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordVisitRequest {
    pub visit_date: NaiveDate,
    #[serde(default)]
    pub fee: Option<Money>,
    #[serde(default)]
    pub appointment: Option<Appointment>,
}

/// POST /patients: register a patient.
#[tracing::instrument(skip(state, req))]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterPatientRequest>,
) -> Result<(StatusCode, Json<Patient>), ApiError> {
    let patient = state
        .intake
        .register_patient(RegisterPatient {
            full_name: req.full_name,
            initial_consultation_fee: req.initial_consultation_fee,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(patient)))
}

/// POST /patients/{id}/visits: record a visit; a positive fee requests a charge.
#[tracing::instrument(skip(state, req))]
pub async fn record_visit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RecordVisitRequest>,
) -> Result<(StatusCode, Json<Visit>), ApiError> {
    let patient_id = parse_patient_id(&id)?;
    let visit = state
        .intake
        .record_visit(
            patient_id,
            NewVisit {
                visit_date: req.visit_date,
                fee: req.fee,
                appointment: req.appointment,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(visit)))
}

/// GET /patients/{id}: the patient's payment projection.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PatientRecord>, ApiError> {
    let patient_id = parse_patient_id(&id)?;
    Ok(Json(state.intake.get_record(patient_id).await?))
}

/// GET /patients/{id}/payment-notification: consumes the pending notification.
#[tracing::instrument(skip(state))]
pub async fn take_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let patient_id = parse_patient_id(&id)?;
    Ok(match state.notifications.take(patient_id) {
        Some(notification) => Json(notification).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

fn parse_patient_id(id: &str) -> Result<PatientId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid patient id: {e}")))
}
