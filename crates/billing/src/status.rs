//! Subscription state resolver
//!
//! Status is a pure projection of the subscription's timestamp fields plus a
//! supplied "now" — never read back from a stored column for automated
//! decisions, so it is correct even when no sweep has run yet. The admin
//! `status_override` is layered on top for manual exceptions.

use tenantry_shared::{Subscription, SubscriptionStatus};
use time::OffsetDateTime;

/// Derive the status from the timestamp tuple. First match wins:
///
/// 1. trial end set and in the future          → trialing
/// 2. canceled and period still open or running → canceled (access retained)
/// 3. no end, or end in the future              → active
/// 4. end passed but inside the grace window    → past_due
/// 5. otherwise                                 → expired
pub fn resolve_status(
    now: OffsetDateTime,
    trial_ends_at: Option<OffsetDateTime>,
    canceled_at: Option<OffsetDateTime>,
    ends_at: Option<OffsetDateTime>,
    grace_period_ends_at: Option<OffsetDateTime>,
) -> SubscriptionStatus {
    if trial_ends_at.is_some_and(|t| t > now) {
        return SubscriptionStatus::Trialing;
    }
    let period_open = match ends_at {
        None => true,
        Some(end) => end > now,
    };
    if canceled_at.is_some() && period_open {
        return SubscriptionStatus::Canceled;
    }
    if period_open {
        return SubscriptionStatus::Active;
    }
    if grace_period_ends_at.is_some_and(|g| g > now) {
        return SubscriptionStatus::PastDue;
    }
    SubscriptionStatus::Expired
}

/// Resolved status with the admin override applied when present.
pub fn effective_status(subscription: &Subscription, now: OffsetDateTime) -> SubscriptionStatus {
    if let Some(overridden) = subscription.status_override {
        return overridden;
    }
    resolve_status(
        now,
        subscription.trial_ends_at,
        subscription.canceled_at,
        subscription.ends_at,
        subscription.grace_period_ends_at,
    )
}

/// Whether the subscription currently permits system usage.
pub fn has_valid_access(subscription: &Subscription, now: OffsetDateTime) -> bool {
    effective_status(subscription, now).has_access()
}
