//! Event bus shared by every service boundary.
//!
//! Records are published to a topic under a partition key. Records that share
//! a key land on the same partition and are delivered in publish order.
//! Consumer groups track a committed offset per partition. A record is
//! redelivered until a consumer commits past it, so handlers must be
//! idempotent.

pub mod bus;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod postgres;

pub use bus::{Delivery, EventBus, Offset, SharedEventBus, partition_for};
pub use consumer::{ConsumeReport, EventConsumer, EventHandler, HandlerError};
pub use envelope::{EventEnvelope, EventEnvelopeBuilder, EventId};
pub use error::{EventBusError, Result};
pub use memory::InMemoryEventBus;
pub use postgres::PostgresEventBus;
