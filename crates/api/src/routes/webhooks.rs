//! Gateway callback endpoint.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use billing::SIGNATURE_HEADER;

use crate::AppState;
use crate::error::ApiError;

/// POST /billing/stripe-webhooks: verifies and applies a gateway callback.
///
/// Every verified callback is acknowledged with `200 Received`, matched or
/// not, so the gateway never retries a business-side miss.
pub async fn receive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = state.webhooks.receive(&body, signature).await?;
    tracing::debug!(outcome = outcome.label(), "webhook acknowledged");
    Ok("Received")
}
