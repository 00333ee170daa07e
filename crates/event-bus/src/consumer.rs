//! Consumer loop that feeds bus records to registered handlers.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::watch;

use crate::{EventEnvelope, Result, SharedEventBus};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error handlers report back to the consumer.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The record can never be handled, such as a payload that does not
    /// decode. The consumer logs it and commits past it.
    #[error("record rejected: {0}")]
    Rejected(BoxError),

    /// Handling failed for now; the record stays uncommitted and is
    /// redelivered.
    #[error("{0}")]
    Failed(BoxError),
}

impl HandlerError {
    pub fn rejected(err: impl Into<BoxError>) -> Self {
        HandlerError::Rejected(err.into())
    }

    pub fn failed(err: impl Into<BoxError>) -> Self {
        HandlerError::Failed(err.into())
    }
}

/// A subscriber that reacts to records on one or more topics.
///
/// Handlers see every record at least once, and may see a record again after
/// a failure or restart, so `handle` must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns the name of this handler, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Topics this handler subscribes to.
    fn topics(&self) -> &'static [&'static str];

    /// Handles a single record. Returning an error leaves it uncommitted.
    async fn handle(&self, event: &EventEnvelope) -> std::result::Result<(), HandlerError>;
}

/// Counts from one pass over the subscribed partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    /// Records handled and committed.
    pub delivered: usize,
    /// Records whose handling failed; their partitions stop for this pass.
    pub failed: usize,
    /// Records skipped as unprocessable and committed past.
    pub rejected: usize,
}

impl ConsumeReport {
    fn merge(self, other: Self) -> Self {
        Self {
            delivered: self.delivered + other.delivered,
            failed: self.failed + other.failed,
            rejected: self.rejected + other.rejected,
        }
    }
}

/// Drives a consumer group over the bus.
///
/// Partitions are drained concurrently. Within a partition records are
/// handled strictly in offset order, and the offset is committed only after
/// every interested handler succeeded.
pub struct EventConsumer {
    bus: SharedEventBus,
    group: String,
    handlers: Vec<Arc<dyn EventHandler>>,
    batch_size: usize,
}

impl EventConsumer {
    /// Creates a consumer for `group` with no handlers.
    pub fn new(bus: SharedEventBus, group: impl Into<String>) -> Self {
        Self {
            bus,
            group: group.into(),
            handlers: Vec::new(),
            batch_size: 64,
        }
    }

    /// Sets the maximum number of records fetched per partition per pass.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Registers a handler with this consumer.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Union of all handler subscriptions, sorted.
    pub fn topics(&self) -> Vec<&'static str> {
        self.handlers
            .iter()
            .flat_map(|h| h.topics().iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Polls every subscribed partition once and handles what it finds.
    #[tracing::instrument(skip(self), fields(group = %self.group))]
    pub async fn run_once(&self) -> Result<ConsumeReport> {
        let partitions = self.bus.partitions();
        let work = self.topics().into_iter().flat_map(|topic| {
            (0..partitions).map(move |partition| self.drain_partition(topic, partition))
        });

        let mut report = ConsumeReport::default();
        for result in join_all(work).await {
            report = report.merge(result?);
        }
        Ok(report)
    }

    /// Repeats [`run_once`](Self::run_once) until a pass makes no progress.
    pub async fn drain(&self) -> Result<ConsumeReport> {
        let mut total = ConsumeReport::default();
        loop {
            let report = self.run_once().await?;
            total = total.merge(report);
            if report.delivered == 0 && report.rejected == 0 {
                return Ok(total);
            }
        }
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            group = %self.group,
            topics = ?self.topics(),
            "consumer started"
        );

        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        tracing::error!(group = %self.group, error = %e, "consumer pass failed");
                        metrics::counter!("bus_consumer_errors", "group" => self.group.clone())
                            .increment(1);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(group = %self.group, "consumer stopped");
    }

    async fn drain_partition(&self, topic: &'static str, partition: u32) -> Result<ConsumeReport> {
        let batch = self
            .bus
            .poll(&self.group, topic, partition, self.batch_size)
            .await?;

        let mut report = ConsumeReport::default();
        for delivery in batch {
            match self.dispatch(&delivery.envelope).await {
                Ok(()) => {
                    metrics::counter!("bus_events_consumed", "topic" => topic).increment(1);
                    report.delivered += 1;
                }
                Err(HandlerError::Rejected(e)) => {
                    tracing::error!(
                        group = %self.group,
                        topic,
                        partition,
                        offset = %delivery.offset,
                        event_id = %delivery.envelope.event_id,
                        event_type = %delivery.envelope.event_type,
                        error = %e,
                        "unprocessable record skipped"
                    );
                    metrics::counter!("bus_records_rejected", "topic" => topic).increment(1);
                    report.rejected += 1;
                }
                Err(HandlerError::Failed(e)) => {
                    tracing::warn!(
                        group = %self.group,
                        topic,
                        partition,
                        offset = %delivery.offset,
                        event_type = %delivery.envelope.event_type,
                        error = %e,
                        "handler failed, record left for redelivery"
                    );
                    metrics::counter!("bus_handler_failures", "topic" => topic).increment(1);
                    report.failed += 1;
                    break;
                }
            }

            self.bus
                .commit(&self.group, topic, partition, delivery.offset.next())
                .await?;
        }
        Ok(report)
    }

    /// A rejection by one handler does not keep the others from seeing the
    /// record; any failure stops dispatch at once.
    async fn dispatch(&self, event: &EventEnvelope) -> std::result::Result<(), HandlerError> {
        let mut rejected = None;
        for handler in &self.handlers {
            if !handler.topics().contains(&event.topic.as_str()) {
                continue;
            }
            match handler.handle(event).await {
                Ok(()) => {}
                Err(HandlerError::Rejected(e)) => {
                    tracing::debug!(handler = handler.name(), error = %e, "handler rejected record");
                    if rejected.is_none() {
                        rejected = Some(HandlerError::Rejected(e));
                    }
                }
                Err(failed) => return Err(failed),
            }
        }
        rejected.map_or(Ok(()), Err)
    }
}
