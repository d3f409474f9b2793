//! Billing event log
//!
//! Every exposed lifecycle effect is appended to `billing_events` through
//! the logger here. Appending is best-effort: a failed write is logged at
//! `warn!` and never fails the business operation that produced it.

use std::sync::Arc;

use tenantry_shared::{Clock, TenantId};
use uuid::Uuid;

use crate::store::{EventStore, NewBillingEvent, Store};

/// Kinds of lifecycle events the billing core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventKind {
    SubscriptionCreated,
    TrialStarted,
    SubscriptionRenewed,
    SubscriptionCanceled,
    SubscriptionResumed,
    SubscriptionEnded,
    TrialEnded,
    PlanChanged,
    PlanChangeScheduled,
    PlanChangeCancelled,
    CheckoutCompleted,
    CheckoutFailed,
    CheckoutExpired,
    CheckoutCancelled,
    AddonPurchased,
    AddonRenewed,
    AddonExpired,
    RenewalReminder,
    TrialEndingReminder,
    AddonExpiryReminder,
    PaymentRefunded,
}

impl BillingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated => "subscription_created",
            Self::TrialStarted => "trial_started",
            Self::SubscriptionRenewed => "subscription_renewed",
            Self::SubscriptionCanceled => "subscription_canceled",
            Self::SubscriptionResumed => "subscription_resumed",
            Self::SubscriptionEnded => "subscription_ended",
            Self::TrialEnded => "trial_ended",
            Self::PlanChanged => "plan_changed",
            Self::PlanChangeScheduled => "plan_change_scheduled",
            Self::PlanChangeCancelled => "plan_change_cancelled",
            Self::CheckoutCompleted => "checkout_completed",
            Self::CheckoutFailed => "checkout_failed",
            Self::CheckoutExpired => "checkout_expired",
            Self::CheckoutCancelled => "checkout_cancelled",
            Self::AddonPurchased => "addon_purchased",
            Self::AddonRenewed => "addon_renewed",
            Self::AddonExpired => "addon_expired",
            Self::RenewalReminder => "renewal_reminder",
            Self::TrialEndingReminder => "trial_ending_reminder",
            Self::AddonExpiryReminder => "addon_expiry_reminder",
            Self::PaymentRefunded => "payment_refunded",
        }
    }
}

impl std::fmt::Display for BillingEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only writer for the billing activity log
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append an event. Failures are warned about, never propagated.
    pub async fn log(
        &self,
        tenant_id: TenantId,
        kind: BillingEventKind,
        subject_id: Option<Uuid>,
        payload: serde_json::Value,
    ) {
        let event = NewBillingEvent {
            tenant_id,
            kind: kind.as_str().to_string(),
            subject_id,
            payload,
            created_at: self.clock.now(),
        };
        if let Err(e) = self.store.append_event(event).await {
            tracing::warn!(
                tenant_id = %tenant_id,
                kind = %kind,
                error = %e,
                "Failed to append billing event"
            );
        }
    }
}
