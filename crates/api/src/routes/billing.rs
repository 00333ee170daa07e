//! Checkout session and payment attempt endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use billing::{CheckoutSessionRequest, CheckoutSessionResponse};
use common::{PatientId, VisitId};
use domain::PaymentAttempt;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitCheckoutRequest {
    pub patient_id: PatientId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptsQuery {
    pub patient_id: Option<String>,
}

/// POST /billing/payments/initial-consultation/create-checkout-session
#[tracing::instrument(skip(state, req), fields(patient_id = %req.patient_id))]
pub async fn create_checkout_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckoutSessionRequest>,
) -> Result<Json<CheckoutSessionResponse>, ApiError> {
    metrics::counter!("checkout_requests", "kind" => "direct").increment(1);
    let session = state.checkout.create_checkout_session(req).await?;
    Ok(Json(session))
}

/// POST /billing/payments/visit/{visit_id}/create-checkout-session
#[tracing::instrument(skip(state, req), fields(patient_id = %req.patient_id))]
pub async fn create_visit_checkout_session(
    State(state): State<Arc<AppState>>,
    Path(visit_id): Path<i64>,
    Json(req): Json<VisitCheckoutRequest>,
) -> Result<Json<CheckoutSessionResponse>, ApiError> {
    metrics::counter!("checkout_requests", "kind" => "visit").increment(1);
    let session = state
        .checkout
        .create_visit_checkout_session(req.patient_id, VisitId::new(visit_id))
        .await?;
    Ok(Json(session))
}

/// GET /billing/payments/my-attempts?patientId=, newest first.
#[tracing::instrument(skip(state, query))]
pub async fn my_attempts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AttemptsQuery>,
) -> Result<Json<Vec<PaymentAttempt>>, ApiError> {
    let raw = query
        .patient_id
        .ok_or_else(|| ApiError::BadRequest("patientId is required".to_string()))?;
    let patient_id: PatientId = raw
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid patientId: {e}")))?;

    let attempts = state.attempts.list_for_patient(patient_id).await?;
    Ok(Json(attempts))
}
