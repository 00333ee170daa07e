//! Payment notifications waiting for the patient's client to pick them up.
//!
//! Notifications are best-effort UX state. They live in a bounded cache keyed
//! by patient, expire after a TTL, and are removed when read.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::PatientId;
use dashmap::DashMap;
use domain::{PaymentStatus, PaymentType};
use serde::Serialize;
use tokio::time::Instant;

use crate::Result;

/// What the patient's client is told about a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentNotification {
    pub status: PaymentStatus,
    pub payment_type: PaymentType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl PaymentNotification {
    pub fn completed(payment_type: PaymentType, timestamp: DateTime<Utc>) -> Self {
        let message = match payment_type {
            PaymentType::InitialConsultation => "Your initial consultation payment was received.",
            PaymentType::VisitFee => "Your visit payment was received.",
        };
        Self {
            status: PaymentStatus::Completed,
            payment_type,
            message: message.to_string(),
            timestamp,
        }
    }
}

/// Sink for payment notifications.
pub trait PaymentNotifier: Send + Sync {
    fn notify(&self, patient_id: PatientId, notification: PaymentNotification) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct NotificationSettings {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            capacity: 10_000,
        }
    }
}

struct Entry {
    notification: PaymentNotification,
    stored_at: Instant,
}

/// Bounded TTL cache holding the latest notification per patient.
///
/// When full, expired entries are dropped first, then the oldest entry.
pub struct NotificationCache {
    entries: DashMap<PatientId, Entry>,
    settings: NotificationSettings,
}

impl NotificationCache {
    pub fn new(settings: NotificationSettings) -> Self {
        Self {
            entries: DashMap::new(),
            settings: NotificationSettings {
                capacity: settings.capacity.max(1),
                ..settings
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores `notification`, replacing any earlier one for the patient.
    pub fn put(&self, patient_id: PatientId, notification: PaymentNotification) {
        if !self.entries.contains_key(&patient_id) && self.entries.len() >= self.settings.capacity {
            self.purge_expired();
            if self.entries.len() >= self.settings.capacity {
                self.evict_oldest();
            }
        }

        self.entries.insert(
            patient_id,
            Entry {
                notification,
                stored_at: Instant::now(),
            },
        );
    }

    /// Removes and returns the patient's notification if it has not expired.
    pub fn take(&self, patient_id: PatientId) -> Option<PaymentNotification> {
        let (_, entry) = self.entries.remove(&patient_id)?;
        (!self.is_expired(&entry)).then_some(entry.notification)
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let ttl = self.settings.ttl;
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
    }

    fn is_expired(&self, entry: &Entry) -> bool {
        entry.stored_at.elapsed() >= self.settings.ttl
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.stored_at)
            .map(|entry| *entry.key());
        if let Some(patient_id) = oldest {
            self.entries.remove(&patient_id);
            metrics::counter!("notifications_evicted").increment(1);
        }
    }
}

impl Default for NotificationCache {
    fn default() -> Self {
        Self::new(NotificationSettings::default())
    }
}

impl PaymentNotifier for NotificationCache {
    fn notify(&self, patient_id: PatientId, notification: PaymentNotification) -> Result<()> {
        tracing::debug!(%patient_id, status = %notification.status, "payment notification stored");
        self.put(patient_id, notification);
        Ok(())
    }
}
