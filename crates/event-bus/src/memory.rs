use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    Delivery, EventEnvelope, Offset, Result,
    bus::{EventBus, check_partition, partition_for},
};

type PartitionKey = (String, u32);
type GroupKey = (String, String, u32);

#[derive(Default)]
struct BusState {
    logs: HashMap<PartitionKey, Vec<EventEnvelope>>,
    offsets: HashMap<GroupKey, Offset>,
    // Publish order across all partitions, for test inspection.
    journal: Vec<EventEnvelope>,
}

/// In-memory bus implementation for tests and single-process runs.
///
/// Same delivery semantics as the PostgreSQL bus, minus durability across
/// restarts.
#[derive(Clone)]
pub struct InMemoryEventBus {
    state: Arc<RwLock<BusState>>,
    partitions: u32,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InMemoryEventBus {
    /// Creates an empty bus with the given partition count (minimum 1).
    pub fn new(partitions: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState::default())),
            partitions: partitions.max(1),
        }
    }

    /// Returns the total number of records published.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.journal.len()
    }

    /// Returns every record published to `topic`, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<EventEnvelope> {
        self.state
            .read()
            .await
            .journal
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Resets a group's offsets on `topic` so every record is delivered again.
    pub async fn rewind(&self, group: &str, topic: &str) {
        let mut state = self.state.write().await;
        state
            .offsets
            .retain(|(g, t, _), _| !(g == group && t == topic));
    }

    /// Clears all records and offsets.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.logs.clear();
        state.offsets.clear();
        state.journal.clear();
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn publish(&self, envelope: EventEnvelope) -> Result<(u32, Offset)> {
        envelope.validate()?;

        let partition = partition_for(&envelope.key, self.partitions);
        let mut state = self.state.write().await;
        state.journal.push(envelope.clone());

        metrics::counter!("bus_events_published", "topic" => envelope.topic.clone()).increment(1);
        let log = state
            .logs
            .entry((envelope.topic.clone(), partition))
            .or_default();
        let offset = Offset::new(log.len() as i64);
        log.push(envelope);

        Ok((partition, offset))
    }

    async fn poll(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        max: usize,
    ) -> Result<Vec<Delivery>> {
        check_partition(partition, self.partitions)?;

        let state = self.state.read().await;
        let start = state
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or_default();

        let Some(log) = state.logs.get(&(topic.to_string(), partition)) else {
            return Ok(Vec::new());
        };

        Ok(log
            .iter()
            .enumerate()
            .skip(start.as_i64().max(0) as usize)
            .take(max)
            .map(|(index, envelope)| Delivery {
                envelope: envelope.clone(),
                partition,
                offset: Offset::new(index as i64),
            })
            .collect())
    }

    async fn commit(&self, group: &str, topic: &str, partition: u32, next: Offset) -> Result<()> {
        check_partition(partition, self.partitions)?;

        let mut state = self.state.write().await;
        let entry = state
            .offsets
            .entry((group.to_string(), topic.to_string(), partition))
            .or_default();
        if next > *entry {
            *entry = next;
        }
        Ok(())
    }

    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Offset> {
        check_partition(partition, self.partitions)?;

        Ok(self
            .state
            .read()
            .await
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or_default())
    }
}
