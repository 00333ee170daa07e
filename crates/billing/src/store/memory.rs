use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{GatewaySessionId, PatientId, PaymentAttemptId, VisitId};
use domain::{ChargeKey, PaymentAttempt, PaymentStatus};
use tokio::sync::RwLock;

use super::{InsertOutcome, PaymentAttemptStore, charge_request_matches};
use crate::{BillingError, Result};

/// In-memory attempt store implementation for testing.
///
/// Every check-then-write runs under a single write lock, which gives the
/// same guarantees the PostgreSQL unique indexes and guarded updates give.
#[derive(Clone, Default)]
pub struct InMemoryAttemptStore {
    attempts: Arc<RwLock<HashMap<PaymentAttemptId, PaymentAttempt>>>,
}

impl InMemoryAttemptStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of attempts stored.
    pub async fn attempt_count(&self) -> usize {
        self.attempts.read().await.len()
    }

    /// Returns every attempt for the key, in any status.
    pub async fn attempts_for(&self, key: ChargeKey) -> Vec<PaymentAttempt> {
        self.attempts
            .read()
            .await
            .values()
            .filter(|a| a.key() == key)
            .cloned()
            .collect()
    }
}

fn session_taken(
    attempts: &HashMap<PaymentAttemptId, PaymentAttempt>,
    session: &GatewaySessionId,
    except: PaymentAttemptId,
) -> bool {
    attempts
        .values()
        .any(|a| a.id != except && a.gateway_session_id.as_ref() == Some(session))
}

#[async_trait]
impl PaymentAttemptStore for InMemoryAttemptStore {
    async fn insert(&self, attempt: PaymentAttempt) -> Result<InsertOutcome> {
        let mut attempts = self.attempts.write().await;

        if let Some(existing) = attempts
            .values()
            .find(|a| charge_request_matches(a, attempt.charge_request_id))
        {
            return Ok(InsertOutcome::DuplicateChargeRequest(existing.clone()));
        }

        if attempt.status.is_active()
            && let Some(existing) = attempts
                .values()
                .find(|a| a.status.is_active() && a.key() == attempt.key())
        {
            return Ok(InsertOutcome::ActiveExists(existing.clone()));
        }

        if let Some(session) = &attempt.gateway_session_id
            && session_taken(&attempts, session, attempt.id)
        {
            return Err(BillingError::Conflict(format!(
                "gateway session {session} is already bound"
            )));
        }

        attempts.insert(attempt.id, attempt.clone());
        Ok(InsertOutcome::Created(attempt))
    }

    async fn get(&self, id: PaymentAttemptId) -> Result<Option<PaymentAttempt>> {
        Ok(self.attempts.read().await.get(&id).cloned())
    }

    async fn find_by_session(&self, session: &GatewaySessionId) -> Result<Option<PaymentAttempt>> {
        Ok(self
            .attempts
            .read()
            .await
            .values()
            .find(|a| a.gateway_session_id.as_ref() == Some(session))
            .cloned())
    }

    async fn find_active(&self, key: ChargeKey) -> Result<Option<PaymentAttempt>> {
        Ok(self
            .attempts
            .read()
            .await
            .values()
            .find(|a| a.status.is_active() && a.key() == key)
            .cloned())
    }

    async fn list_for_patient(&self, patient_id: PatientId) -> Result<Vec<PaymentAttempt>> {
        let attempts = self.attempts.read().await;
        let mut list: Vec<_> = attempts
            .values()
            .filter(|a| a.patient_id == patient_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn latest_for_visit(
        &self,
        patient_id: PatientId,
        visit_id: VisitId,
    ) -> Result<Option<PaymentAttempt>> {
        Ok(self
            .attempts
            .read()
            .await
            .values()
            .filter(|a| a.patient_id == patient_id && a.visit_id == Some(visit_id))
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn attach_session(
        &self,
        id: PaymentAttemptId,
        session: GatewaySessionId,
        expected: PaymentStatus,
    ) -> Result<Option<PaymentAttempt>> {
        let mut attempts = self.attempts.write().await;

        if session_taken(&attempts, &session, id) {
            return Err(BillingError::Conflict(format!(
                "gateway session {session} is already bound"
            )));
        }

        let Some(attempt) = attempts.get_mut(&id) else {
            return Ok(None);
        };
        if attempt.status != expected {
            return Ok(None);
        }
        attempt.attach_session(session, Utc::now())?;
        Ok(Some(attempt.clone()))
    }

    async fn transition(
        &self,
        id: PaymentAttemptId,
        to: PaymentStatus,
    ) -> Result<Option<PaymentAttempt>> {
        let mut attempts = self.attempts.write().await;
        let Some(attempt) = attempts.get_mut(&id) else {
            return Ok(None);
        };
        if !attempt.status.can_transition_to(to) {
            return Ok(None);
        }
        attempt.transition_to(to, Utc::now())?;
        Ok(Some(attempt.clone()))
    }

    async fn mark_completion_published(&self, id: PaymentAttemptId) -> Result<()> {
        let mut attempts = self.attempts.write().await;
        if let Some(attempt) = attempts.get_mut(&id)
            && attempt.status == PaymentStatus::Completed
            && attempt.completion_published_at.is_none()
        {
            attempt.completion_published_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Currency, Money};
    use uuid::Uuid;

    fn awaiting(key: ChargeKey) -> PaymentAttempt {
        PaymentAttempt::awaiting(
            key,
            Money::from_cents(5000),
            Currency::usd(),
            "Consultation Fee",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn duplicate_charge_request_is_detected_after_completion() {
        let store = InMemoryAttemptStore::new();
        let key = ChargeKey::new(PatientId::new(), Some(VisitId::new(1)));
        let request = Uuid::new_v4();

        let first = awaiting(key).with_charge_request(request);
        store.insert(first.clone()).await.unwrap();
        store
            .transition(first.id, PaymentStatus::Completed)
            .await
            .unwrap()
            .unwrap();

        let again = awaiting(key).with_charge_request(request);
        let outcome = store.insert(again).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::DuplicateChargeRequest(ref a) if a.id == first.id));
        assert_eq!(store.attempt_count().await, 1);
    }

    #[tokio::test]
    async fn terminal_attempt_frees_the_charge_key() {
        let store = InMemoryAttemptStore::new();
        let key = ChargeKey::new(PatientId::new(), None);

        let first = awaiting(key);
        store.insert(first.clone()).await.unwrap();
        store
            .attach_session(first.id, GatewaySessionId::new("cs_1"), PaymentStatus::AwaitingPayment)
            .await
            .unwrap();
        store.transition(first.id, PaymentStatus::Expired).await.unwrap();

        assert!(store.insert(awaiting(key)).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn attach_session_is_status_guarded() {
        let store = InMemoryAttemptStore::new();
        let attempt = awaiting(ChargeKey::new(PatientId::new(), None));
        store.insert(attempt.clone()).await.unwrap();

        let stale = store
            .attach_session(attempt.id, GatewaySessionId::new("cs_1"), PaymentStatus::Pending)
            .await
            .unwrap();
        assert!(stale.is_none());

        let bound = store
            .attach_session(attempt.id, GatewaySessionId::new("cs_1"), PaymentStatus::AwaitingPayment)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bound.status, PaymentStatus::Pending);
        assert_eq!(
            store
                .find_by_session(&GatewaySessionId::new("cs_1"))
                .await
                .unwrap()
                .map(|a| a.id),
            Some(attempt.id)
        );
    }

    #[tokio::test]
    async fn session_ids_are_unique() {
        let store = InMemoryAttemptStore::new();
        let a = awaiting(ChargeKey::new(PatientId::new(), None));
        let b = awaiting(ChargeKey::new(PatientId::new(), None));
        store.insert(a.clone()).await.unwrap();
        store.insert(b.clone()).await.unwrap();

        store
            .attach_session(a.id, GatewaySessionId::new("cs_same"), PaymentStatus::AwaitingPayment)
            .await
            .unwrap();
        let err = store
            .attach_session(b.id, GatewaySessionId::new("cs_same"), PaymentStatus::AwaitingPayment)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn expiry_is_refused_for_awaiting_attempt() {
        let store = InMemoryAttemptStore::new();
        let attempt = awaiting(ChargeKey::new(PatientId::new(), None));
        store.insert(attempt.clone()).await.unwrap();

        assert!(
            store
                .transition(attempt.id, PaymentStatus::Expired)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store.get(attempt.id).await.unwrap().unwrap().status,
            PaymentStatus::AwaitingPayment
        );
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = InMemoryAttemptStore::new();
        let patient = PatientId::new();

        let mut older = awaiting(ChargeKey::new(patient, Some(VisitId::new(1))));
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = awaiting(ChargeKey::new(patient, Some(VisitId::new(2))));
        store.insert(older.clone()).await.unwrap();
        store.insert(newer.clone()).await.unwrap();

        let ids: Vec<_> = store
            .list_for_patient(patient)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }
}
