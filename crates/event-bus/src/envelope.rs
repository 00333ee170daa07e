use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{EventBusError, Result};

/// Unique identifier for a published record.
///
/// Redelivery hands out the same id again, so consumers can use it as an
/// idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A record on the bus: a serialized event plus its routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this record.
    pub event_id: EventId,

    /// The type of the event (e.g., "VisitPaymentCompleted").
    pub event_type: String,

    /// Topic the record is published to.
    pub topic: String,

    /// Partition key. Records with the same key keep their relative order.
    pub key: String,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the event.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Deserializes the payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Checks the fields every bus implementation relies on.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(EventBusError::InvalidEnvelope("topic is empty".to_string()));
        }
        if self.key.trim().is_empty() {
            return Err(EventBusError::InvalidEnvelope("key is empty".to_string()));
        }
        if self.event_type.trim().is_empty() {
            return Err(EventBusError::InvalidEnvelope(
                "event_type is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    topic: Option<String>,
    key: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the envelope, failing if a required field was never set.
    pub fn build(self) -> Result<EventEnvelope> {
        let missing = |field: &str| EventBusError::InvalidEnvelope(format!("{field} is required"));
        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type.ok_or_else(|| missing("event_type"))?,
            topic: self.topic.ok_or_else(|| missing("topic"))?,
            key: self.key.ok_or_else(|| missing("key"))?,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload.ok_or_else(|| missing("payload"))?,
            metadata: self.metadata,
        })
    }
}
