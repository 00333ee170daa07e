//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use billing::BillingError;
use patient_records::RecordsError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Billing error.
    Billing(BillingError),
    /// Patient record error.
    Records(RecordsError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Billing(err) => billing_error_to_response(err),
            ApiError::Records(err) => records_error_to_response(err),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn billing_error_to_response(err: BillingError) -> (StatusCode, String) {
    match &err {
        BillingError::Validation(_) | BillingError::MalformedPayload(_) | BillingError::Signature(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        BillingError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        BillingError::Conflict(_) => (StatusCode::CONFLICT, err.to_string()),
        // The message is already the user-facing "try again later" text.
        BillingError::GatewayUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
        BillingError::Configuration(_)
        | BillingError::Domain(_)
        | BillingError::Database(_)
        | BillingError::EventBus(_)
        | BillingError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn records_error_to_response(err: RecordsError) -> (StatusCode, String) {
    match &err {
        RecordsError::PatientNotFound(_) | RecordsError::VisitNotFound { .. } => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        RecordsError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        RecordsError::Notification(_) | RecordsError::Domain(_) | RecordsError::EventBus(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        ApiError::Billing(err)
    }
}

impl From<RecordsError> for ApiError {
    fn from(err: RecordsError) -> Self {
        ApiError::Records(err)
    }
}
