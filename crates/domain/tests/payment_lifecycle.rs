//! Integration tests for the payment attempt state machine.
//!
//! These walk every short sequence of status changes and check the
//! invariants that must hold no matter what order callbacks arrive in.

use chrono::Utc;
use common::{GatewaySessionId, PatientId, VisitId};
use domain::{ChargeKey, Currency, Money, PaymentAttempt, PaymentStatus};

fn fresh() -> PaymentAttempt {
    PaymentAttempt::awaiting(
        ChargeKey::new(PatientId::new(), Some(VisitId::new(1))),
        Money::from_cents(5000),
        Currency::usd(),
        "Consultation Fee for Visit #1",
        Utc::now(),
    )
}

/// Every sequence of up to three requested statuses, starting from each
/// reachable state.
fn sequences() -> Vec<Vec<PaymentStatus>> {
    let mut out = vec![Vec::new()];
    for _ in 0..3 {
        let mut next = Vec::new();
        for seq in &out {
            for status in PaymentStatus::ALL {
                let mut extended = seq.clone();
                extended.push(status);
                next.push(extended);
            }
        }
        out.extend(next);
    }
    out
}

fn apply_all(attempt: &mut PaymentAttempt, seq: &[PaymentStatus]) {
    for &to in seq {
        if to == PaymentStatus::Pending {
            let _ = attempt.attach_session(GatewaySessionId::new("cs_seq"), Utc::now());
        } else {
            let _ = attempt.transition_to(to, Utc::now());
        }
    }
}

#[test]
fn completed_is_never_left() {
    for seq in sequences() {
        let mut attempt = fresh();
        attempt
            .transition_to(PaymentStatus::Completed, Utc::now())
            .unwrap();
        apply_all(&mut attempt, &seq);
        assert_eq!(attempt.status, PaymentStatus::Completed, "sequence {seq:?}");
    }
}

#[test]
fn failed_is_unreachable() {
    for seq in sequences() {
        let mut attempt = fresh();
        apply_all(&mut attempt, &seq);
        assert_ne!(attempt.status, PaymentStatus::Failed, "sequence {seq:?}");
    }
}

#[test]
fn expired_implies_a_session_was_attached() {
    for seq in sequences() {
        let mut attempt = fresh();
        apply_all(&mut attempt, &seq);
        if attempt.status == PaymentStatus::Expired {
            assert!(attempt.gateway_session_id.is_some(), "sequence {seq:?}");
        }
    }
}

#[test]
fn updated_at_never_decreases() {
    for seq in sequences() {
        let mut attempt = fresh();
        let mut last = attempt.updated_at;
        for &to in &seq {
            apply_all(&mut attempt, &[to]);
            assert!(attempt.updated_at >= last);
            last = attempt.updated_at;
        }
    }
}
