use async_trait::async_trait;
use common::{GatewaySessionId, PatientId, PaymentAttemptId, VisitId};
use domain::{ChargeKey, PaymentAttempt, PaymentStatus};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{InsertOutcome, PaymentAttemptStore};
use crate::{BillingError, Result};

const COLUMNS: &str = "id, patient_id, visit_id, gateway_session_id, amount_cents, currency, \
     product_name, payment_type, status, charge_request_id, completion_published_at, \
     created_at, updated_at";

/// PostgreSQL-backed attempt store.
///
/// The partial unique index `unique_active_attempt` and the unique session
/// and charge-request columns carry the invariants. Status changes are
/// single `UPDATE ... WHERE status = ANY(...)` statements.
#[derive(Clone)]
pub struct PostgresAttemptStore {
    pool: PgPool,
}

impl PostgresAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_attempt(row: PgRow) -> Result<PaymentAttempt> {
        let currency: String = row.try_get("currency")?;
        let payment_type: String = row.try_get("payment_type")?;
        let status: String = row.try_get("status")?;

        Ok(PaymentAttempt {
            id: PaymentAttemptId::from_uuid(row.try_get::<Uuid, _>("id")?),
            patient_id: PatientId::from_uuid(row.try_get::<Uuid, _>("patient_id")?),
            visit_id: row.try_get::<Option<i64>, _>("visit_id")?.map(VisitId::new),
            gateway_session_id: row
                .try_get::<Option<String>, _>("gateway_session_id")?
                .map(GatewaySessionId::new),
            amount: domain::Money::from_cents(row.try_get("amount_cents")?),
            currency: currency.parse()?,
            product_name: row.try_get("product_name")?,
            payment_type: payment_type.parse()?,
            status: status.parse()?,
            charge_request_id: row.try_get("charge_request_id")?,
            completion_published_at: row.try_get("completion_published_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn find_by_charge_request(&self, charge_request_id: Uuid) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM payment_attempts WHERE charge_request_id = $1"
        ))
        .bind(charge_request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_attempt).transpose()
    }
}

fn session_conflict(e: sqlx::Error, session: &GatewaySessionId) -> BillingError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return BillingError::Conflict(format!("gateway session {session} is already bound"));
    }
    BillingError::Database(e)
}

#[async_trait]
impl PaymentAttemptStore for PostgresAttemptStore {
    async fn insert(&self, attempt: PaymentAttempt) -> Result<InsertOutcome> {
        // A conflicting row can disappear between the insert and the lookup
        // (an active attempt completing), so give the insert a few tries.
        for _ in 0..3 {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO payment_attempts ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT DO NOTHING
                RETURNING {COLUMNS}
                "#
            ))
            .bind(attempt.id.as_uuid())
            .bind(attempt.patient_id.as_uuid())
            .bind(attempt.visit_id.map(|v| v.as_i64()))
            .bind(attempt.gateway_session_id.as_ref().map(|s| s.as_str()))
            .bind(attempt.amount.cents())
            .bind(attempt.currency.as_str())
            .bind(&attempt.product_name)
            .bind(attempt.payment_type.as_str())
            .bind(attempt.status.as_str())
            .bind(attempt.charge_request_id)
            .bind(attempt.completion_published_at)
            .bind(attempt.created_at)
            .bind(attempt.updated_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                return Ok(InsertOutcome::Created(Self::row_to_attempt(row)?));
            }

            if let Some(request) = attempt.charge_request_id
                && let Some(existing) = self.find_by_charge_request(request).await?
            {
                return Ok(InsertOutcome::DuplicateChargeRequest(existing));
            }

            if attempt.status.is_active()
                && let Some(existing) = self.find_active(attempt.key()).await?
            {
                return Ok(InsertOutcome::ActiveExists(existing));
            }

            if let Some(session) = &attempt.gateway_session_id
                && self.find_by_session(session).await?.is_some()
            {
                return Err(BillingError::Conflict(format!(
                    "gateway session {session} is already bound"
                )));
            }
        }

        Err(BillingError::Conflict(format!(
            "payment attempt {} could not be inserted",
            attempt.id
        )))
    }

    async fn get(&self, id: PaymentAttemptId) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM payment_attempts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_attempt).transpose()
    }

    async fn find_by_session(&self, session: &GatewaySessionId) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM payment_attempts WHERE gateway_session_id = $1"
        ))
        .bind(session.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_attempt).transpose()
    }

    async fn find_active(&self, key: ChargeKey) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM payment_attempts
            WHERE patient_id = $1
              AND visit_id IS NOT DISTINCT FROM $2
              AND payment_type = $3
              AND status IN ('AWAITING_PAYMENT', 'PENDING')
            "#
        ))
        .bind(key.patient_id.as_uuid())
        .bind(key.visit_id.map(|v| v.as_i64()))
        .bind(key.payment_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_attempt).transpose()
    }

    async fn list_for_patient(&self, patient_id: PatientId) -> Result<Vec<PaymentAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM payment_attempts WHERE patient_id = $1 ORDER BY created_at DESC"
        ))
        .bind(patient_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_attempt).collect()
    }

    async fn latest_for_visit(
        &self,
        patient_id: PatientId,
        visit_id: VisitId,
    ) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM payment_attempts
            WHERE patient_id = $1 AND visit_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(patient_id.as_uuid())
        .bind(visit_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_attempt).transpose()
    }

    async fn attach_session(
        &self,
        id: PaymentAttemptId,
        session: GatewaySessionId,
        expected: PaymentStatus,
    ) -> Result<Option<PaymentAttempt>> {
        if !expected.is_active() {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE payment_attempts
            SET gateway_session_id = $2,
                status = 'PENDING',
                updated_at = GREATEST(updated_at, NOW())
            WHERE id = $1 AND status = $3
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(session.as_str())
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| session_conflict(e, &session))?;

        row.map(Self::row_to_attempt).transpose()
    }

    async fn transition(
        &self,
        id: PaymentAttemptId,
        to: PaymentStatus,
    ) -> Result<Option<PaymentAttempt>> {
        let sources: Vec<String> = PaymentStatus::allowed_sources(to)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        if sources.is_empty() {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE payment_attempts
            SET status = $2,
                updated_at = GREATEST(updated_at, NOW())
            WHERE id = $1 AND status = ANY($3)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(sources)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_attempt).transpose()
    }

    async fn mark_completion_published(&self, id: PaymentAttemptId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE payment_attempts
            SET completion_published_at = NOW()
            WHERE id = $1 AND status = 'COMPLETED' AND completion_published_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
