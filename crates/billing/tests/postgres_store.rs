//! PostgreSQL attempt store tests
//!
//! These tests start a PostgreSQL container and are ignored by default.
//! Run with:
//!
//! ```bash
//! cargo test -p billing --test postgres_store -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use billing::{BillingError, InsertOutcome, PaymentAttemptStore, PostgresAttemptStore};
use chrono::Utc;
use common::{GatewaySessionId, PatientId, VisitId};
use domain::{ChargeKey, Currency, Money, PaymentAttempt, PaymentStatus};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/002_create_payment_attempts.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresAttemptStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE payment_attempts")
        .execute(&pool)
        .await
        .unwrap();

    PostgresAttemptStore::new(pool)
}

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
#[ignore = "requires docker"]
async fn round_trips_an_attempt() {
    let store = get_test_store().await;
    let attempt = awaiting(ChargeKey::new(PatientId::new(), Some(VisitId::new(3))));

    store.insert(attempt.clone()).await.unwrap();
    let loaded = store.get(attempt.id).await.unwrap().unwrap();

    assert_eq!(loaded.id, attempt.id);
    assert_eq!(loaded.amount, attempt.amount);
    assert_eq!(loaded.visit_id, Some(VisitId::new(3)));
    assert_eq!(loaded.status, PaymentStatus::AwaitingPayment);
    assert_eq!(loaded.product_name, "Consultation Fee");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn partial_index_allows_one_active_attempt() {
    let store = get_test_store().await;
    let key = ChargeKey::new(PatientId::new(), None);

    let first = awaiting(key);
    assert!(store.insert(first.clone()).await.unwrap().is_created());

    let outcome = store.insert(awaiting(key)).await.unwrap();
    assert!(matches!(outcome, InsertOutcome::ActiveExists(ref a) if a.id == first.id));

    store
        .attach_session(first.id, GatewaySessionId::new("cs_1"), PaymentStatus::AwaitingPayment)
        .await
        .unwrap()
        .unwrap();
    store.transition(first.id, PaymentStatus::Completed).await.unwrap().unwrap();

    assert!(store.insert(awaiting(key)).await.unwrap().is_created());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn concurrent_inserts_create_one_active_attempt() {
    let store = Arc::new(get_test_store().await);
    let key = ChargeKey::new(PatientId::new(), Some(VisitId::new(1)));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move { store.insert(awaiting(key)).await }));
    }

    let mut created = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().is_created() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn charge_request_id_is_remembered_after_completion() {
    let store = get_test_store().await;
    let key = ChargeKey::new(PatientId::new(), Some(VisitId::new(2)));
    let request = Uuid::new_v4();

    let first = awaiting(key).with_charge_request(request);
    store.insert(first.clone()).await.unwrap();
    store.transition(first.id, PaymentStatus::Completed).await.unwrap();

    let outcome = store
        .insert(awaiting(key).with_charge_request(request))
        .await
        .unwrap();
    assert!(matches!(outcome, InsertOutcome::DuplicateChargeRequest(ref a) if a.id == first.id));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn transitions_are_status_guarded() {
    let store = get_test_store().await;
    let attempt = awaiting(ChargeKey::new(PatientId::new(), None));
    store.insert(attempt.clone()).await.unwrap();

    // Expiry needs a pending attempt.
    assert!(store.transition(attempt.id, PaymentStatus::Expired).await.unwrap().is_none());
    // Nothing produces FAILED.
    assert!(store.transition(attempt.id, PaymentStatus::Failed).await.unwrap().is_none());

    let completed = store
        .transition(attempt.id, PaymentStatus::Completed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, PaymentStatus::Completed);
    assert!(completed.updated_at >= attempt.updated_at);

    assert!(store.transition(attempt.id, PaymentStatus::Completed).await.unwrap().is_none());
    assert!(store.transition(attempt.id, PaymentStatus::Expired).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn completion_publication_is_recorded_once() {
    let store = get_test_store().await;
    let attempt = awaiting(ChargeKey::new(PatientId::new(), None));
    store.insert(attempt.clone()).await.unwrap();

    // Only completed attempts carry the marker.
    store.mark_completion_published(attempt.id).await.unwrap();
    let awaiting = store.get(attempt.id).await.unwrap().unwrap();
    assert!(awaiting.completion_published_at.is_none());

    let completed = store
        .transition(attempt.id, PaymentStatus::Completed)
        .await
        .unwrap()
        .unwrap();
    store.mark_completion_published(attempt.id).await.unwrap();
    let marked = store.get(attempt.id).await.unwrap().unwrap();
    let first_mark = marked.completion_published_at.unwrap();
    assert_eq!(marked.updated_at, completed.updated_at);

    store.mark_completion_published(attempt.id).await.unwrap();
    let again = store.get(attempt.id).await.unwrap().unwrap();
    assert_eq!(again.completion_published_at, Some(first_mark));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn session_ids_are_unique() {
    let store = get_test_store().await;
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
#[ignore = "requires docker"]
async fn latest_for_visit_and_listing_are_newest_first() {
    let store = get_test_store().await;
    let patient = PatientId::new();

    let mut older = awaiting(ChargeKey::new(patient, Some(VisitId::new(1))));
    older.created_at = Utc::now() - chrono::Duration::minutes(10);
    older.updated_at = older.created_at;
    store.insert(older.clone()).await.unwrap();
    store.transition(older.id, PaymentStatus::Completed).await.unwrap();

    let newer = awaiting(ChargeKey::new(patient, Some(VisitId::new(1))));
    store.insert(newer.clone()).await.unwrap();

    let latest = store
        .latest_for_visit(patient, VisitId::new(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.id, newer.id);

    let ids: Vec<_> = store
        .list_for_patient(patient)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(ids, vec![newer.id, older.id]);
}
