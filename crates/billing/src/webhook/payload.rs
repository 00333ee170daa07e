use std::collections::HashMap;

use serde::Deserialize;

use crate::{BillingError, Result};

/// Envelope of every gateway callback.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: GatewayEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEventData {
    pub object: serde_json::Value,
}

/// The checkout-session object carried by completion and expiry callbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// The callback kinds the saga reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    CheckoutCompleted,
    /// Delayed payment methods confirm later; handled like a completion.
    AsyncPaymentSucceeded,
    CheckoutExpired,
    Other(String),
}

impl WebhookEventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "checkout.session.async_payment_succeeded" => Self::AsyncPaymentSucceeded,
            "checkout.session.expired" => Self::CheckoutExpired,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, Self::CheckoutCompleted | Self::AsyncPaymentSucceeded)
    }

    /// Label used in logs and metrics.
    pub fn label(&self) -> &str {
        match self {
            Self::CheckoutCompleted => "checkout.session.completed",
            Self::AsyncPaymentSucceeded => "checkout.session.async_payment_succeeded",
            Self::CheckoutExpired => "checkout.session.expired",
            Self::Other(other) => other,
        }
    }
}

impl GatewayEvent {
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| BillingError::MalformedPayload(e.to_string()))
    }

    pub fn kind(&self) -> WebhookEventKind {
        WebhookEventKind::parse(&self.event_type)
    }

    pub fn checkout_session(&self) -> Result<CheckoutSessionObject> {
        CheckoutSessionObject::deserialize(&self.data.object)
            .map_err(|e| BillingError::MalformedPayload(format!("checkout session object: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completed_session() {
        let body = br#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_test_1",
                "client_reference_id": "3f1c3c0e-7f5e-4a8e-9d4c-1b2a3c4d5e6f",
                "metadata": {"patientId": "p", "visitId": "7"},
                "amount_total": 5000
            }}
        }"#;

        let event = GatewayEvent::parse(body).unwrap();
        assert_eq!(event.kind(), WebhookEventKind::CheckoutCompleted);

        let session = event.checkout_session().unwrap();
        assert_eq!(session.id, "cs_test_1");
        assert!(session.client_reference_id.is_some());
        assert_eq!(session.metadata.get("visitId").map(String::as_str), Some("7"));
    }

    #[test]
    fn unknown_kinds_are_kept() {
        assert_eq!(
            WebhookEventKind::parse("invoice.paid"),
            WebhookEventKind::Other("invoice.paid".to_string())
        );
        assert!(WebhookEventKind::parse("checkout.session.async_payment_succeeded").is_completion());
        assert!(!WebhookEventKind::parse("checkout.session.expired").is_completion());
    }

    #[test]
    fn malformed_body_is_rejected() {
        assert!(matches!(
            GatewayEvent::parse(b"not json"),
            Err(BillingError::MalformedPayload(_))
        ));
        assert!(matches!(
            GatewayEvent::parse(br#"{"id": "evt_1"}"#),
            Err(BillingError::MalformedPayload(_))
        ));
    }
}
