use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Delivery, EventEnvelope, EventId, Offset, Result,
    bus::{EventBus, check_partition, partition_for},
};

/// PostgreSQL-backed bus implementation.
///
/// Each topic partition is an append-only log in `bus_events`. Offsets are
/// assigned densely under a transaction-scoped advisory lock on the
/// partition, so a consumer never observes a gap that later fills in.
#[derive(Clone)]
pub struct PostgresEventBus {
    pool: PgPool,
    partitions: u32,
}

impl PostgresEventBus {
    /// Creates a new PostgreSQL bus.
    pub fn new(pool: PgPool, partitions: u32) -> Self {
        Self {
            pool,
            partitions: partitions.max(1),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_delivery(row: PgRow) -> Result<Delivery> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(Delivery {
            envelope: EventEnvelope {
                event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
                event_type: row.try_get("event_type")?,
                topic: row.try_get("topic")?,
                key: row.try_get("event_key")?,
                timestamp: row.try_get("timestamp")?,
                payload: row.try_get("payload")?,
                metadata,
            },
            partition: row.try_get::<i32, _>("partition")? as u32,
            offset: Offset::new(row.try_get("partition_offset")?),
        })
    }
}

#[async_trait]
impl EventBus for PostgresEventBus {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, envelope: EventEnvelope) -> Result<(u32, Offset)> {
        envelope.validate()?;

        let partition = partition_for(&envelope.key, self.partitions);
        let metadata_json = serde_json::to_value(&envelope.metadata)?;

        let mut tx = self.pool.begin().await?;

        // Serialize writers of the same partition until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), $2)")
            .bind(&envelope.topic)
            .bind(partition as i32)
            .execute(&mut *tx)
            .await?;

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(partition_offset) + 1, 0) FROM bus_events WHERE topic = $1 AND partition = $2",
        )
        .bind(&envelope.topic)
        .bind(partition as i32)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO bus_events (event_id, topic, partition, partition_offset, event_key, event_type, timestamp, payload, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(envelope.event_id.as_uuid())
        .bind(&envelope.topic)
        .bind(partition as i32)
        .bind(next)
        .bind(&envelope.key)
        .bind(&envelope.event_type)
        .bind(envelope.timestamp)
        .bind(&envelope.payload)
        .bind(metadata_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::counter!("bus_events_published", "topic" => envelope.topic.clone()).increment(1);
        Ok((partition, Offset::new(next)))
    }

    async fn poll(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        max: usize,
    ) -> Result<Vec<Delivery>> {
        check_partition(partition, self.partitions)?;

        let rows = sqlx::query(
            r#"
            SELECT e.event_id, e.topic, e.partition, e.partition_offset, e.event_key,
                   e.event_type, e.timestamp, e.payload, e.metadata
            FROM bus_events e
            WHERE e.topic = $1
              AND e.partition = $2
              AND e.partition_offset >= COALESCE(
                  (SELECT next_offset FROM bus_consumer_offsets
                   WHERE consumer_group = $3 AND topic = $1 AND partition = $2),
                  0)
            ORDER BY e.partition_offset ASC
            LIMIT $4
            "#,
        )
        .bind(topic)
        .bind(partition as i32)
        .bind(group)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_delivery).collect()
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, next: Offset) -> Result<()> {
        check_partition(partition, self.partitions)?;

        sqlx::query(
            r#"
            INSERT INTO bus_consumer_offsets (consumer_group, topic, partition, next_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (consumer_group, topic, partition) DO UPDATE SET
                next_offset = GREATEST(bus_consumer_offsets.next_offset, EXCLUDED.next_offset),
                updated_at = NOW()
            "#,
        )
        .bind(group)
        .bind(topic)
        .bind(partition as i32)
        .bind(next.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Offset> {
        check_partition(partition, self.partitions)?;

        let next: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM bus_consumer_offsets WHERE consumer_group = $1 AND topic = $2 AND partition = $3",
        )
        .bind(group)
        .bind(topic)
        .bind(partition as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(next.map(Offset::new).unwrap_or_default())
    }
}
