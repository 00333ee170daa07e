use thiserror::Error;

/// Errors that can occur when publishing to or consuming from the bus.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The envelope is missing a required field or has an empty one.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A partition outside the bus's configured range was requested.
    #[error("Partition {partition} out of range (bus has {partitions})")]
    UnknownPartition { partition: u32, partitions: u32 },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
