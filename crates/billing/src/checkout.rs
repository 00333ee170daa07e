//! Checkout session creation and attempt binding.

use std::sync::Arc;

use chrono::Utc;
use common::{GatewaySessionId, PatientId, VisitId};
use domain::{
    ChargeKey, Currency, DomainEventPublisher, Money, PaymentAttempt, PaymentInitiated,
    PaymentStatus, PaymentType,
};
use event_bus::SharedEventBus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::{CheckoutGateway, CheckoutRequest, CheckoutSession};
use crate::resilience::{CircuitBreaker, RetryPolicy};
use crate::{BillingError, InsertOutcome, Result, SharedAttemptStore};

/// Product name used for visit checkouts with no earlier attempt.
pub const FOLLOW_UP_PRODUCT_NAME: &str = "Follow-up Visit Payment";

const UNAVAILABLE_MESSAGE: &str = "Unable to create payment session at this time. Please try again later.";

/// Static inputs of the checkout flow.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Root of the success and cancel redirect URLs.
    pub frontend_base_url: String,
    pub default_currency: Currency,
    pub default_visit_fee: Money,
    /// Smallest amount the gateway accepts.
    pub minimum_charge: Money,
    /// Whether gateway credentials are present.
    pub gateway_configured: bool,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            frontend_base_url: "http://localhost:5173".to_string(),
            default_currency: Currency::usd(),
            default_visit_fee: Money::from_cents(5000),
            minimum_charge: Money::from_cents(50),
            gateway_configured: true,
        }
    }
}

/// Request body for opening a checkout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionRequest {
    pub patient_id: PatientId,
    #[serde(default)]
    pub visit_id: Option<VisitId>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub amount: Option<Money>,
    #[serde(default)]
    pub currency: Option<Currency>,
    #[serde(default)]
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionResponse {
    pub session_id: GatewaySessionId,
    pub checkout_url: String,
}

/// Opens hosted checkouts and links them to payment attempts.
///
/// The gateway call goes through bounded retry around a circuit breaker.
/// Nothing is written unless the gateway returned a session.
pub struct PaymentGatewayClient {
    store: SharedAttemptStore,
    bus: SharedEventBus,
    gateway: Arc<dyn CheckoutGateway>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    settings: CheckoutSettings,
}

impl PaymentGatewayClient {
    pub fn new(
        store: SharedAttemptStore,
        bus: SharedEventBus,
        gateway: Arc<dyn CheckoutGateway>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            store,
            bus,
            gateway,
            breaker,
            retry,
            settings,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn settings(&self) -> &CheckoutSettings {
        &self.settings
    }

    #[tracing::instrument(
        skip(self, request),
        fields(
            patient_id = %request.patient_id,
            visit_id = ?request.visit_id,
            session_id = tracing::field::Empty,
        )
    )]
    pub async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<CheckoutSessionResponse> {
        if !self.settings.gateway_configured {
            return Err(BillingError::Configuration(
                "payment gateway credentials are not configured".to_string(),
            ));
        }

        let amount = request
            .amount
            .ok_or_else(|| BillingError::Validation("amount is required".to_string()))?;
        if amount < self.settings.minimum_charge {
            return Err(BillingError::Validation(format!(
                "amount must be at least {}",
                self.settings.minimum_charge
            )));
        }

        let quantity = request.quantity.unwrap_or(1);
        if quantity == 0 {
            return Err(BillingError::Validation(
                "quantity must be at least 1".to_string(),
            ));
        }

        let product_name = request
            .product_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| PaymentType::default_product_name(request.visit_id));
        let currency = request
            .currency
            .unwrap_or_else(|| self.settings.default_currency.clone());

        self.open_and_bind(
            ChargeKey::new(request.patient_id, request.visit_id),
            amount,
            currency,
            product_name,
            quantity,
        )
        .await
    }

    /// Checkout for a visit, priced from its most recent attempt.
    #[tracing::instrument(skip(self))]
    pub async fn create_visit_checkout_session(
        &self,
        patient_id: PatientId,
        visit_id: VisitId,
    ) -> Result<CheckoutSessionResponse> {
        let latest = self.store.latest_for_visit(patient_id, visit_id).await?;

        let request = match latest {
            Some(attempt) if attempt.status == PaymentStatus::Completed => {
                return Err(BillingError::Conflict(format!(
                    "visit {visit_id} is already paid"
                )));
            }
            Some(attempt) => CheckoutSessionRequest {
                patient_id,
                visit_id: Some(visit_id),
                product_name: Some(attempt.product_name),
                amount: Some(attempt.amount),
                currency: Some(attempt.currency),
                quantity: Some(1),
            },
            None => {
                tracing::warn!("no attempt for visit, using the default visit fee");
                CheckoutSessionRequest {
                    patient_id,
                    visit_id: Some(visit_id),
                    product_name: Some(FOLLOW_UP_PRODUCT_NAME.to_string()),
                    amount: Some(self.settings.default_visit_fee),
                    currency: None,
                    quantity: Some(1),
                }
            }
        };

        self.create_checkout_session(request).await
    }

    async fn open_and_bind(
        &self,
        key: ChargeKey,
        amount: Money,
        currency: Currency,
        product_name: String,
        quantity: u32,
    ) -> Result<CheckoutSessionResponse> {
        let existing = self.store.find_active(key).await?;
        let (success_url, cancel_url) = self.redirect_urls(key.visit_id);

        let gateway_request = CheckoutRequest {
            patient_id: key.patient_id,
            visit_id: key.visit_id,
            payment_type: key.payment_type,
            product_name: product_name.clone(),
            amount,
            currency: currency.clone(),
            quantity,
            client_reference_id: existing.as_ref().map(|a| a.id),
            success_url,
            cancel_url,
            idempotency_key: Uuid::new_v4(),
        };

        let session = self.call_gateway(&gateway_request).await?;
        tracing::Span::current().record("session_id", session.session_id.as_str());

        let attempt = self
            .bind_session(key, &session.session_id, amount, &currency, &product_name)
            .await?;
        tracing::info!(
            attempt_id = %attempt.id,
            session_id = %session.session_id,
            "checkout session bound"
        );

        let initiated = PaymentInitiated {
            patient_id: key.patient_id,
            session_id: session.session_id.clone(),
            amount: attempt.amount,
            currency: attempt.currency.clone(),
            product_name: attempt.product_name.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.bus.publish_event(&initiated).await {
            tracing::warn!(error = %e, "failed to publish payment initiated event");
        }

        Ok(CheckoutSessionResponse {
            session_id: session.session_id,
            checkout_url: session.checkout_url,
        })
    }

    async fn call_gateway(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let started = std::time::Instant::now();
        let result = self
            .retry
            .run("create_checkout_session", || {
                self.breaker.call(|| self.gateway.create_session(request))
            })
            .await;
        metrics::histogram!("gateway_call_duration_seconds").record(started.elapsed().as_secs_f64());

        result.map_err(|e| {
            tracing::error!(error = %e, "checkout session creation failed");
            metrics::counter!("checkout_sessions_failed").increment(1);
            BillingError::GatewayUnavailable(UNAVAILABLE_MESSAGE.to_string())
        })
    }

    /// Moves the active attempt to `Pending` on the new session, or creates
    /// one directly in `Pending` when none is active.
    async fn bind_session(
        &self,
        key: ChargeKey,
        session: &GatewaySessionId,
        amount: Money,
        currency: &Currency,
        product_name: &str,
    ) -> Result<PaymentAttempt> {
        for _ in 0..3 {
            match self.store.find_active(key).await? {
                Some(active) => {
                    let previous = active.gateway_session_id.clone();
                    if let Some(bound) = self
                        .store
                        .attach_session(active.id, session.clone(), active.status)
                        .await?
                    {
                        if let Some(previous) = previous {
                            tracing::info!(%previous, "re-pointed pending attempt to a new session");
                        }
                        return Ok(bound);
                    }
                }
                None => {
                    tracing::warn!("no active attempt for charge, creating one in pending");
                    let attempt = PaymentAttempt::pending(
                        key,
                        amount,
                        currency.clone(),
                        product_name,
                        session.clone(),
                        Utc::now(),
                    );
                    match self.store.insert(attempt).await? {
                        InsertOutcome::Created(created) => {
                            metrics::counter!("payment_attempts_created", "source" => "checkout")
                                .increment(1);
                            return Ok(created);
                        }
                        InsertOutcome::ActiveExists(_) | InsertOutcome::DuplicateChargeRequest(_) => {}
                    }
                }
            }
        }

        Err(BillingError::Conflict(format!(
            "could not bind session {session} to an attempt"
        )))
    }

    fn redirect_urls(&self, visit_id: Option<VisitId>) -> (String, String) {
        let base = self.settings.frontend_base_url.trim_end_matches('/');
        let success = format!("{base}/payment/success?session_id={{CHECKOUT_SESSION_ID}}");
        let cancel = format!("{base}/payment/cancel");
        match visit_id {
            Some(visit_id) => (
                format!("{success}&visitId={visit_id}"),
                format!("{cancel}?visitId={visit_id}"),
            ),
            None => (success, cancel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, InMemoryCheckoutGateway};
    use crate::resilience::CircuitBreakerConfig;
    use crate::{InMemoryAttemptStore, PaymentAttemptStore};
    use domain::topics;
    use event_bus::InMemoryEventBus;

    struct Fixture {
        client: PaymentGatewayClient,
        store: InMemoryAttemptStore,
        gateway: InMemoryCheckoutGateway,
        bus: InMemoryEventBus,
    }

    fn fixture(settings: CheckoutSettings) -> Fixture {
        let store = InMemoryAttemptStore::new();
        let gateway = InMemoryCheckoutGateway::new();
        let bus = InMemoryEventBus::new(4);
        let client = PaymentGatewayClient::new(
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::new(gateway.clone()),
            CircuitBreaker::new("gateway", CircuitBreakerConfig::default()),
            RetryPolicy::default(),
            settings,
        );
        Fixture {
            client,
            store,
            gateway,
            bus,
        }
    }

    fn request(patient_id: PatientId, visit_id: Option<i64>) -> CheckoutSessionRequest {
        CheckoutSessionRequest {
            patient_id,
            visit_id: visit_id.map(VisitId::new),
            product_name: Some("Consultation".to_string()),
            amount: Some(Money::from_cents(5000)),
            currency: None,
            quantity: None,
        }
    }

    #[tokio::test]
    async fn binds_session_to_awaiting_attempt() {
        let f = fixture(CheckoutSettings::default());
        let patient = PatientId::new();
        let key = ChargeKey::new(patient, Some(VisitId::new(3)));
        let awaiting = PaymentAttempt::awaiting(
            key,
            Money::from_cents(5000),
            Currency::usd(),
            "Consultation Fee for Visit #3",
            Utc::now(),
        );
        f.store.insert(awaiting.clone()).await.unwrap();

        let response = f.client.create_checkout_session(request(patient, Some(3))).await.unwrap();

        let bound = f.store.get(awaiting.id).await.unwrap().unwrap();
        assert_eq!(bound.status, PaymentStatus::Pending);
        assert_eq!(bound.gateway_session_id, Some(response.session_id.clone()));
        assert_eq!(f.store.attempt_count().await, 1);

        let sent = &f.gateway.requests()[0];
        assert_eq!(sent.client_reference_id, Some(awaiting.id));
        assert!(sent.success_url.ends_with("session_id={CHECKOUT_SESSION_ID}&visitId=3"));
        assert!(sent.cancel_url.ends_with("/payment/cancel?visitId=3"));
    }

    #[tokio::test]
    async fn creates_pending_attempt_when_none_is_active() {
        let f = fixture(CheckoutSettings::default());
        let patient = PatientId::new();

        let response = f.client.create_checkout_session(request(patient, None)).await.unwrap();

        let attempt = f
            .store
            .find_by_session(&response.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, PaymentStatus::Pending);
        assert_eq!(attempt.payment_type, PaymentType::InitialConsultation);
        assert_eq!(f.gateway.requests()[0].client_reference_id, None);
        assert_eq!(f.bus.published(topics::PAYMENT_INITIATED).await.len(), 1);
    }

    #[tokio::test]
    async fn second_checkout_repoints_pending_attempt() {
        let f = fixture(CheckoutSettings::default());
        let patient = PatientId::new();

        let first = f.client.create_checkout_session(request(patient, Some(1))).await.unwrap();
        let second = f.client.create_checkout_session(request(patient, Some(1))).await.unwrap();
        assert_ne!(first.session_id, second.session_id);

        let attempts = f
            .store
            .attempts_for(ChargeKey::new(patient, Some(VisitId::new(1))))
            .await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].gateway_session_id, Some(second.session_id));
        assert_eq!(attempts[0].status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn validation_happens_before_the_gateway() {
        let f = fixture(CheckoutSettings::default());
        let patient = PatientId::new();

        let mut missing = request(patient, None);
        missing.amount = None;
        let mut tiny = request(patient, None);
        tiny.amount = Some(Money::from_cents(49));

        for req in [missing, tiny] {
            let err = f.client.create_checkout_session(req).await.unwrap_err();
            assert!(matches!(err, BillingError::Validation(_)));
        }
        assert_eq!(f.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn unconfigured_gateway_is_a_configuration_error() {
        let f = fixture(CheckoutSettings {
            gateway_configured: false,
            ..CheckoutSettings::default()
        });
        let err = f
            .client
            .create_checkout_session(request(PatientId::new(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_with_the_same_idempotency_key() {
        let f = fixture(CheckoutSettings::default());
        f.gateway.fail_next(GatewayError::Transient("timeout".to_string()));

        f.client
            .create_checkout_session(request(PatientId::new(), None))
            .await
            .unwrap();

        let requests = f.gateway.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].idempotency_key, requests[1].idempotency_key);
    }

    #[tokio::test]
    async fn rejected_request_leaves_attempts_untouched() {
        let f = fixture(CheckoutSettings::default());
        let patient = PatientId::new();
        let key = ChargeKey::new(patient, Some(VisitId::new(5)));
        let awaiting = PaymentAttempt::awaiting(
            key,
            Money::from_cents(5000),
            Currency::usd(),
            "fee",
            Utc::now(),
        );
        f.store.insert(awaiting.clone()).await.unwrap();
        f.gateway.fail_next(GatewayError::Rejected("invalid currency".to_string()));

        let err = f
            .client
            .create_checkout_session(request(patient, Some(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::GatewayUnavailable(_)));
        assert_eq!(f.gateway.call_count(), 1);
        assert_eq!(f.store.get(awaiting.id).await.unwrap().unwrap(), awaiting);
    }

    #[tokio::test]
    async fn visit_checkout_uses_latest_attempt_pricing() {
        let f = fixture(CheckoutSettings::default());
        let patient = PatientId::new();
        let key = ChargeKey::new(patient, Some(VisitId::new(9)));
        f.store
            .insert(PaymentAttempt::awaiting(
                key,
                Money::from_cents(7500),
                Currency::usd(),
                "Consultation Fee for Visit #9",
                Utc::now(),
            ))
            .await
            .unwrap();

        f.client
            .create_visit_checkout_session(patient, VisitId::new(9))
            .await
            .unwrap();

        let sent = &f.gateway.requests()[0];
        assert_eq!(sent.amount, Money::from_cents(7500));
        assert_eq!(sent.product_name, "Consultation Fee for Visit #9");
    }

    #[tokio::test]
    async fn visit_checkout_falls_back_to_default_fee() {
        let f = fixture(CheckoutSettings::default());
        f.client
            .create_visit_checkout_session(PatientId::new(), VisitId::new(4))
            .await
            .unwrap();

        let sent = &f.gateway.requests()[0];
        assert_eq!(sent.amount, Money::from_cents(5000));
        assert_eq!(sent.product_name, FOLLOW_UP_PRODUCT_NAME);
        assert_eq!(sent.payment_type, PaymentType::VisitFee);
    }

    #[tokio::test]
    async fn paid_visit_cannot_be_checked_out_again() {
        let f = fixture(CheckoutSettings::default());
        let patient = PatientId::new();
        let response = f.client.create_checkout_session(request(patient, Some(2))).await.unwrap();
        let attempt = f.store.find_by_session(&response.session_id).await.unwrap().unwrap();
        f.store.transition(attempt.id, PaymentStatus::Completed).await.unwrap();

        let err = f
            .client
            .create_visit_checkout_session(patient, VisitId::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }
}
