use std::time::Duration;

use async_trait::async_trait;
use common::GatewaySessionId;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{CheckoutGateway, CheckoutRequest, CheckoutSession, GatewayError};

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
    url: Option<String>,
}

/// Checkout gateway speaking the Stripe Checkout Sessions API.
#[derive(Debug, Clone)]
pub struct StripeCheckoutGateway {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl StripeCheckoutGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Rejected(format!("http client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn form(request: &CheckoutRequest) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("mode", "payment".to_string()),
            ("success_url", request.success_url.clone()),
            ("cancel_url", request.cancel_url.clone()),
            (
                "line_items[0][price_data][currency]",
                request.currency.as_str().to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                request.product_name.clone(),
            ),
            (
                "line_items[0][price_data][unit_amount]",
                request.amount.cents().to_string(),
            ),
            ("line_items[0][quantity]", request.quantity.to_string()),
            ("metadata[patientId]", request.patient_id.to_string()),
            ("metadata[paymentType]", request.payment_type.as_str().to_string()),
        ];
        if let Some(visit_id) = request.visit_id {
            form.push(("metadata[visitId]", visit_id.to_string()));
        }
        if let Some(reference) = request.client_reference_id {
            form.push(("client_reference_id", reference.to_string()));
        }
        form
    }
}

fn classify(status: StatusCode, body: &str) -> GatewayError {
    let detail: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        GatewayError::Transient(format!("HTTP {}: {detail}", status.as_u16()))
    } else {
        GatewayError::Rejected(format!("HTTP {}: {detail}", status.as_u16()))
    }
}

#[async_trait]
impl CheckoutGateway for StripeCheckoutGateway {
    #[tracing::instrument(skip(self, request), fields(patient_id = %request.patient_id))]
    async fn create_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError> {
        let response = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", request.idempotency_key.to_string())
            .form(&Self::form(request))
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            metrics::counter!("gateway_calls", "outcome" => "http_error").increment(1);
            return Err(classify(status, &body));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Rejected(format!("unexpected session response: {e}")))?;
        let checkout_url = session
            .url
            .ok_or_else(|| GatewayError::Rejected("session response has no url".to_string()))?;

        metrics::counter!("gateway_calls", "outcome" => "success").increment(1);
        Ok(CheckoutSession {
            session_id: GatewaySessionId::new(session.id),
            checkout_url,
        })
    }
}
