use chrono::Utc;
use common::{GatewaySessionId, PaymentAttemptId};
use domain::{CompletionEvent, DomainEventPublisher, PaymentAttempt, PaymentStatus, PaymentStatusUpdate};
use event_bus::SharedEventBus;

use super::payload::{CheckoutSessionObject, GatewayEvent, WebhookEventKind};
use super::signature::{DEFAULT_TOLERANCE_SECS, SignatureError, verify_signature};
use crate::{BillingError, Result, SharedAttemptStore};

/// Placeholder shipped in sample configuration; treated as unset.
const PLACEHOLDER_SECRET: &str = "your-webhook-secret-here";

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: Option<String>,
    pub tolerance_secs: i64,
}

impl WebhookSettings {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    fn usable_secret(&self) -> Option<&str> {
        self.secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != PLACEHOLDER_SECRET)
    }

    pub fn is_configured(&self) -> bool {
        self.usable_secret().is_some()
    }
}

/// What a verified callback did. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The attempt moved to `Completed` and a completion event was published.
    Completed(PaymentAttempt),
    AlreadyCompleted(PaymentAttemptId),
    /// The attempt was already `Completed` but its completion event had not
    /// been published; it was published now.
    CompletionRepublished(PaymentAttempt),
    /// The attempt moved from `Pending` to `Expired`.
    Expired(PaymentAttempt),
    /// Expiry for an attempt not in `Pending`; left untouched.
    ExpiryIgnored {
        attempt_id: PaymentAttemptId,
        status: PaymentStatus,
    },
    /// Completion for an attempt that already ended otherwise.
    CompletionRejected {
        attempt_id: PaymentAttemptId,
        status: PaymentStatus,
    },
    /// No attempt matched the callback.
    Unmatched,
    /// A callback kind the saga does not react to.
    Ignored(String),
}

impl WebhookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Completed(_) => "completed",
            WebhookOutcome::AlreadyCompleted(_) => "already_completed",
            WebhookOutcome::CompletionRepublished(_) => "completion_republished",
            WebhookOutcome::Expired(_) => "expired",
            WebhookOutcome::ExpiryIgnored { .. } => "expiry_ignored",
            WebhookOutcome::CompletionRejected { .. } => "completion_rejected",
            WebhookOutcome::Unmatched => "unmatched",
            WebhookOutcome::Ignored(_) => "ignored",
        }
    }
}

/// Verifies gateway callbacks and applies them to payment attempts.
///
/// Transitions are status-guarded writes, so concurrent or repeated
/// deliveries of the same callback produce at most one transition and at
/// most one completion event.
pub struct WebhookReceiver {
    store: SharedAttemptStore,
    bus: SharedEventBus,
    settings: WebhookSettings,
}

impl WebhookReceiver {
    pub fn new(store: SharedAttemptStore, bus: SharedEventBus, settings: WebhookSettings) -> Self {
        if !settings.is_configured() {
            tracing::error!("webhook secret is not configured; gateway callbacks will be refused");
        }
        Self {
            store,
            bus,
            settings,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.is_configured()
    }

    #[tracing::instrument(
        skip_all,
        fields(
            event_kind = tracing::field::Empty,
            session_id = tracing::field::Empty,
            attempt_id = tracing::field::Empty,
        )
    )]
    pub async fn receive(&self, body: &[u8], signature: Option<&str>) -> Result<WebhookOutcome> {
        let secret = self.settings.usable_secret().ok_or_else(|| {
            BillingError::Configuration("webhook secret is not configured".to_string())
        })?;
        let header = signature.ok_or(SignatureError::MissingHeader)?;

        if let Err(e) = verify_signature(
            header,
            body,
            secret,
            self.settings.tolerance_secs,
            Utc::now().timestamp(),
        ) {
            tracing::warn!(error = %e, "webhook signature rejected");
            metrics::counter!("webhooks_rejected", "reason" => "signature").increment(1);
            return Err(e.into());
        }

        let event = GatewayEvent::parse(body)?;
        let kind = event.kind();
        let span = tracing::Span::current();
        span.record("event_kind", kind.label());

        let outcome = match &kind {
            WebhookEventKind::CheckoutCompleted | WebhookEventKind::AsyncPaymentSucceeded => {
                let session = event.checkout_session()?;
                span.record("session_id", session.id.as_str());
                self.complete(&session).await?
            }
            WebhookEventKind::CheckoutExpired => {
                let session = event.checkout_session()?;
                span.record("session_id", session.id.as_str());
                self.expire(&session).await?
            }
            WebhookEventKind::Other(other) => {
                tracing::debug!(gateway_event_id = %event.id, "ignoring webhook kind");
                WebhookOutcome::Ignored(other.clone())
            }
        };

        tracing::info!(outcome = outcome.label(), "webhook processed");
        metrics::counter!(
            "webhooks_received",
            "kind" => kind.label().to_string(),
            "outcome" => outcome.label()
        )
        .increment(1);
        Ok(outcome)
    }

    /// Client reference (the attempt id) first, then the session id.
    async fn resolve_for_completion(
        &self,
        session: &CheckoutSessionObject,
    ) -> Result<Option<PaymentAttempt>> {
        if let Some(reference) = session.client_reference_id.as_deref() {
            match reference.parse::<PaymentAttemptId>() {
                Ok(id) => {
                    if let Some(attempt) = self.store.get(id).await? {
                        return Ok(Some(attempt));
                    }
                }
                Err(_) => {
                    tracing::debug!(reference, "client reference is not an attempt id");
                }
            }
        }

        self.store
            .find_by_session(&GatewaySessionId::new(session.id.clone()))
            .await
    }

    async fn complete(&self, session: &CheckoutSessionObject) -> Result<WebhookOutcome> {
        let Some(attempt) = self.resolve_for_completion(session).await? else {
            return Ok(self.unmatched(session));
        };
        tracing::Span::current().record("attempt_id", tracing::field::display(attempt.id));

        if attempt.status == PaymentStatus::Completed {
            return self.already_completed(attempt).await;
        }

        let Some(updated) = self.store.transition(attempt.id, PaymentStatus::Completed).await? else {
            // Another delivery won the guarded write, or the attempt ended
            // otherwise. A winner owns the completion event; if its publish
            // fails, the gateway's retry of that delivery republishes.
            let status = self
                .store
                .get(attempt.id)
                .await?
                .map(|a| a.status)
                .unwrap_or(attempt.status);
            if status == PaymentStatus::Completed {
                return Ok(WebhookOutcome::AlreadyCompleted(attempt.id));
            }
            tracing::warn!(%status, "completion for an attempt that cannot complete");
            return Ok(WebhookOutcome::CompletionRejected {
                attempt_id: attempt.id,
                status,
            });
        };

        self.publish_completion(&updated).await?;
        tracing::info!(amount = %updated.amount, "payment completed");
        metrics::counter!("payment_attempts_completed").increment(1);

        self.publish_status_update(&updated).await;
        Ok(WebhookOutcome::Completed(updated))
    }

    /// A completed attempt whose completion event never reached the bus gets
    /// it now; otherwise the delivery is a duplicate.
    async fn already_completed(&self, attempt: PaymentAttempt) -> Result<WebhookOutcome> {
        if attempt.completion_published_at.is_some() {
            tracing::info!("attempt already completed");
            return Ok(WebhookOutcome::AlreadyCompleted(attempt.id));
        }

        tracing::warn!("completed attempt has no published completion event, publishing it");
        self.publish_completion(&attempt).await?;
        metrics::counter!("completion_events_republished").increment(1);
        self.publish_status_update(&attempt).await;
        Ok(WebhookOutcome::CompletionRepublished(attempt))
    }

    /// Publishes the completion event, then records that it went out. If the
    /// publish fails the error reaches the gateway, whose retry lands in
    /// [`already_completed`](Self::already_completed).
    async fn publish_completion(&self, attempt: &PaymentAttempt) -> Result<()> {
        let completion = CompletionEvent::for_attempt(attempt, Utc::now());
        self.bus.publish(completion.to_envelope()?).await?;
        self.store.mark_completion_published(attempt.id).await?;
        tracing::debug!(event_type = completion.event_type(), "completion event published");
        Ok(())
    }

    async fn expire(&self, session: &CheckoutSessionObject) -> Result<WebhookOutcome> {
        let session_id = GatewaySessionId::new(session.id.clone());
        let Some(attempt) = self.store.find_by_session(&session_id).await? else {
            return Ok(self.unmatched(session));
        };
        tracing::Span::current().record("attempt_id", tracing::field::display(attempt.id));

        if attempt.status != PaymentStatus::Pending {
            tracing::info!(status = %attempt.status, "expiry ignored");
            return Ok(WebhookOutcome::ExpiryIgnored {
                attempt_id: attempt.id,
                status: attempt.status,
            });
        }

        match self.store.transition(attempt.id, PaymentStatus::Expired).await? {
            Some(updated) => {
                tracing::info!("payment session expired");
                self.publish_status_update(&updated).await;
                Ok(WebhookOutcome::Expired(updated))
            }
            None => {
                let status = self
                    .store
                    .get(attempt.id)
                    .await?
                    .map(|a| a.status)
                    .unwrap_or(attempt.status);
                Ok(WebhookOutcome::ExpiryIgnored {
                    attempt_id: attempt.id,
                    status,
                })
            }
        }
    }

    fn unmatched(&self, session: &CheckoutSessionObject) -> WebhookOutcome {
        tracing::warn!(
            session_id = %session.id,
            client_reference_id = ?session.client_reference_id,
            metadata = ?session.metadata,
            "no payment attempt matches webhook"
        );
        metrics::counter!("webhooks_unmatched").increment(1);
        WebhookOutcome::Unmatched
    }

    /// Observers only; a failure here must not undo the acknowledged transition.
    async fn publish_status_update(&self, attempt: &PaymentAttempt) {
        let Some(update) = PaymentStatusUpdate::for_attempt(attempt, Utc::now()) else {
            return;
        };
        if let Err(e) = self.bus.publish_event(&update).await {
            tracing::warn!(error = %e, status = %attempt.status, "failed to publish status update");
        }
    }
}
