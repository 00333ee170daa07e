//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub gateway_circuit: &'static str,
    pub webhooks_configured: bool,
}

/// GET /health: returns service health and the gateway breaker state.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        gateway_circuit: state.checkout.breaker().state().as_str(),
        webhooks_configured: state.webhooks.is_configured(),
    })
}
