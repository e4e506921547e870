use crate::model::*;

use super::error::DenyReason;

/// Outcome of an access-gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny(DenyReason),
}

/// Pure gate predicate. Owner access is granted only inside a live
/// trial or a live paid period; everything else is denied with a reason
/// naming how the subscription lapsed.
pub fn evaluate(sub: &Subscription, now: Ms) -> Access {
    match sub.status {
        SubscriptionStatus::Trial => match sub.trial_ends_at {
            Some(t) if now <= t => Access::Allow,
            _ => Access::Deny(DenyReason::TrialExpired),
        },
        SubscriptionStatus::Active => {
            if now <= sub.current_period_end {
                Access::Allow
            } else if sub.cancel_at_period_end {
                Access::Deny(DenyReason::Cancelled)
            } else {
                Access::Deny(DenyReason::PeriodExpired)
            }
        }
        SubscriptionStatus::Cancelled => Access::Deny(DenyReason::Cancelled),
        SubscriptionStatus::Expired => {
            // A record that never saw a payment lapsed out of its trial.
            if sub.trial_ends_at.is_some() {
                Access::Deny(DenyReason::TrialExpired)
            } else {
                Access::Deny(DenyReason::PeriodExpired)
            }
        }
    }
}

/// Whether the lazy status rewrite must fire for this record: the
/// stored status still says live, but the window is behind `now`.
pub fn lapse_due(sub: &Subscription, now: Ms) -> bool {
    match sub.status {
        SubscriptionStatus::Trial => sub.trial_ends_at.is_some_and(|t| now > t),
        SubscriptionStatus::Active => now > sub.current_period_end,
        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => false,
    }
}

/// Apply a lapse to the record. A scheduled cancellation resolves to
/// `Cancelled`; a trial or paid period that simply ran out resolves to
/// `Expired`. Deterministic from prior state — used by journal replay.
pub fn apply_lapse(sub: &mut Subscription) {
    sub.status = if sub.cancel_at_period_end {
        SubscriptionStatus::Cancelled
    } else {
        SubscriptionStatus::Expired
    };
}

/// Apply a payment-confirmed activation: fresh one-period window, trial
/// marker and any scheduled cancellation cleared.
pub fn apply_activation(sub: &mut Subscription, period_start: Ms, period_end: Ms) {
    sub.status = SubscriptionStatus::Active;
    sub.current_period_start = period_start;
    sub.current_period_end = period_end;
    sub.trial_ends_at = None;
    sub.cancel_at_period_end = false;
}
