use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{EventEnvelope, Result};

/// Position of a record within one partition of a topic.
///
/// Offsets are dense within a partition and start at zero. A committed offset
/// names the next record the group has not yet processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(i64);

impl Offset {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The first offset of every partition.
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns the offset that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record handed to a consumer, with the coordinates needed to commit it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    pub partition: u32,
    pub offset: Offset,
}

/// Core trait for bus implementations.
///
/// Delivery is at-least-once. A record stays visible to a consumer group until
/// the group commits an offset past it.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Number of partitions every topic is split into.
    fn partitions(&self) -> u32;

    /// Durably appends a record to its topic.
    ///
    /// The partition is derived from the envelope key. Returns the coordinates
    /// the record was stored at.
    async fn publish(&self, envelope: EventEnvelope) -> Result<(u32, Offset)>;

    /// Fetches up to `max` records at or after the group's committed offset.
    async fn poll(
        &self,
        group: &str,
        topic: &str,
        partition: u32,
        max: usize,
    ) -> Result<Vec<Delivery>>;

    /// Records that the group has processed every record before `next`.
    ///
    /// Commits never move an offset backwards.
    async fn commit(&self, group: &str, topic: &str, partition: u32, next: Offset) -> Result<()>;

    /// Returns the group's committed offset for a partition.
    async fn committed(&self, group: &str, topic: &str, partition: u32) -> Result<Offset>;
}

/// Shared handle to any bus implementation.
pub type SharedEventBus = Arc<dyn EventBus>;

/// Maps a partition key to a partition using 32-bit FNV-1a.
///
/// The mapping is stable across processes so the in-memory and PostgreSQL
/// buses agree on placement.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    if partitions <= 1 {
        return 0;
    }
    let hash = key
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME));
    hash % partitions
}

pub(crate) fn check_partition(partition: u32, partitions: u32) -> Result<()> {
    if partition >= partitions {
        return Err(crate::EventBusError::UnknownPartition {
            partition,
            partitions,
        });
    }
    Ok(())
}
