//! Patient and visit records as seen by the payment projection.
//!
//! A visit refers to its patient by id. Patients are fetched on demand from
//! the record store; there is no owned object graph between them.

use chrono::{DateTime, NaiveDate, Utc};
use common::{PatientId, VisitId};
use serde::{Deserialize, Serialize};

use crate::Money;

/// Payment status of a patient, and of each individual visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsultationPaymentStatus {
    #[default]
    NotPaid,
    PaymentPending,
    Paid,
}

impl ConsultationPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationPaymentStatus::NotPaid => "NOT_PAID",
            ConsultationPaymentStatus::PaymentPending => "PAYMENT_PENDING",
            ConsultationPaymentStatus::Paid => "PAID",
        }
    }
}

impl std::fmt::Display for ConsultationPaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled appointment attached to a visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub id: VisitId,
    pub patient_id: PatientId,
    pub visit_date: NaiveDate,
    pub fee: Option<Money>,
    pub payment_status: ConsultationPaymentStatus,
    pub appointment: Option<Appointment>,
}

impl Visit {
    /// True if the visit carries a positive fee.
    pub fn is_fee_bearing(&self) -> bool {
        self.fee.is_some_and(|fee| fee.is_positive())
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == ConsultationPaymentStatus::Paid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: PatientId,
    pub full_name: String,
    pub consultation_payment_status: ConsultationPaymentStatus,
    /// Earliest appointment among the patient's paid visits.
    pub main_appointment: Option<Appointment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn new(full_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: PatientId::new(),
            full_name: full_name.into(),
            consultation_payment_status: ConsultationPaymentStatus::NotPaid,
            main_appointment: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The most recently dated fee-bearing visit. Ties go to the higher visit id.
pub fn last_fee_visit<'a>(visits: impl IntoIterator<Item = &'a Visit>) -> Option<&'a Visit> {
    visits
        .into_iter()
        .filter(|v| v.is_fee_bearing())
        .max_by_key(|v| (v.visit_date, v.id))
}

/// Patient-level status under the last-fee-visit rule.
///
/// Only the most recently dated fee-bearing visit counts; earlier paid visits
/// do not make the patient PAID. A pending checkout stays pending until that
/// visit is paid. Without fee-bearing visits the current status is kept.
pub fn derive_consultation_status<'a>(
    current: ConsultationPaymentStatus,
    visits: impl IntoIterator<Item = &'a Visit>,
) -> ConsultationPaymentStatus {
    match last_fee_visit(visits) {
        None => current,
        Some(visit) if visit.is_paid() => ConsultationPaymentStatus::Paid,
        Some(_) if current == ConsultationPaymentStatus::PaymentPending => {
            ConsultationPaymentStatus::PaymentPending
        }
        Some(_) => ConsultationPaymentStatus::NotPaid,
    }
}

/// Earliest-dated appointment among paid visits.
pub fn earliest_paid_appointment<'a>(
    visits: impl IntoIterator<Item = &'a Visit>,
) -> Option<Appointment> {
    visits
        .into_iter()
        .filter(|v| v.is_paid())
        .filter_map(|v| v.appointment.as_ref())
        .min_by_key(|a| a.scheduled_at)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn visit(
        id: i64,
        date: (i32, u32, u32),
        fee: Option<i64>,
        status: ConsultationPaymentStatus,
    ) -> Visit {
        Visit {
            id: VisitId::new(id),
            patient_id: PatientId::new(),
            visit_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            fee: fee.map(Money::from_cents),
            payment_status: status,
            appointment: None,
        }
    }

    fn at(day: u32) -> Appointment {
        Appointment {
            scheduled_at: Utc.with_ymd_and_hms(2025, 3, day, 9, 0, 0).unwrap(),
            notes: None,
        }
    }

    #[test]
    fn later_unpaid_visit_wins_over_earlier_paid_visit() {
        let visits = [
            visit(1, (2025, 1, 10), Some(5000), ConsultationPaymentStatus::Paid),
            visit(2, (2025, 2, 10), Some(5000), ConsultationPaymentStatus::NotPaid),
        ];
        assert_eq!(
            derive_consultation_status(ConsultationPaymentStatus::Paid, &visits),
            ConsultationPaymentStatus::NotPaid
        );
    }

    #[test]
    fn paid_latest_visit_makes_patient_paid() {
        let visits = [
            visit(1, (2025, 1, 10), Some(5000), ConsultationPaymentStatus::NotPaid),
            visit(2, (2025, 2, 10), Some(5000), ConsultationPaymentStatus::Paid),
        ];
        assert_eq!(
            derive_consultation_status(ConsultationPaymentStatus::NotPaid, &visits),
            ConsultationPaymentStatus::Paid
        );
    }

    #[test]
    fn free_visits_are_ignored() {
        let visits = [
            visit(1, (2025, 1, 10), Some(5000), ConsultationPaymentStatus::Paid),
            visit(2, (2025, 2, 10), None, ConsultationPaymentStatus::NotPaid),
            visit(3, (2025, 3, 10), Some(0), ConsultationPaymentStatus::NotPaid),
        ];
        assert_eq!(last_fee_visit(&visits).unwrap().id, VisitId::new(1));
    }

    #[test]
    fn same_day_tie_goes_to_higher_id() {
        let visits = [
            visit(7, (2025, 1, 10), Some(5000), ConsultationPaymentStatus::Paid),
            visit(8, (2025, 1, 10), Some(5000), ConsultationPaymentStatus::NotPaid),
        ];
        assert_eq!(last_fee_visit(&visits).unwrap().id, VisitId::new(8));
    }

    #[test]
    fn pending_survives_until_latest_visit_paid() {
        let visits = [visit(1, (2025, 1, 10), Some(5000), ConsultationPaymentStatus::NotPaid)];
        assert_eq!(
            derive_consultation_status(ConsultationPaymentStatus::PaymentPending, &visits),
            ConsultationPaymentStatus::PaymentPending
        );
    }

    #[test]
    fn no_fee_visits_keeps_current() {
        assert_eq!(
            derive_consultation_status(ConsultationPaymentStatus::Paid, std::iter::empty()),
            ConsultationPaymentStatus::Paid
        );
    }

    #[test]
    fn main_appointment_is_earliest_paid() {
        let mut early_unpaid = visit(1, (2025, 1, 1), Some(5000), ConsultationPaymentStatus::NotPaid);
        early_unpaid.appointment = Some(at(1));
        let mut later_paid = visit(2, (2025, 1, 2), Some(5000), ConsultationPaymentStatus::Paid);
        later_paid.appointment = Some(at(20));
        let mut earlier_paid = visit(3, (2025, 1, 3), Some(5000), ConsultationPaymentStatus::Paid);
        earlier_paid.appointment = Some(at(5));

        let visits = [early_unpaid, later_paid, earlier_paid];
        assert_eq!(earliest_paid_appointment(&visits), Some(at(5)));
    }

    #[test]
    fn main_appointment_cleared_without_paid_appointments() {
        let mut v = visit(1, (2025, 1, 1), Some(5000), ConsultationPaymentStatus::NotPaid);
        v.appointment = Some(at(1));
        assert_eq!(earliest_paid_appointment(&[v]), None);
    }
}
