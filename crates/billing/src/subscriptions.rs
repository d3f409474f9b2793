//! Subscription management
//!
//! Creation, renewal, cancellation and access checks. Every operation loads
//! the aggregate, validates tenant ownership against it, and mutates through
//! a single atomic store call. The one-current-subscription-per-tenant
//! invariant is kept by superseding the previous current row inside the
//! creation transaction.

use std::sync::Arc;

use tenantry_shared::{Clock, Plan, PlanPrice, Subscription, TenantId};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventKind, BillingEventLogger};
use crate::notify::NotificationSink;
use crate::status;
use crate::store::{
    CatalogStore, NewSubscription, Store, SubscriptionRenewal, SubscriptionStore,
};

/// Grace horizon for a period ending at `ends_at`, from the plan's grace
/// length. Open-ended subscriptions and zero-grace plans get none.
pub(crate) fn grace_period_ends(
    plan: &Plan,
    ends_at: Option<OffsetDateTime>,
) -> Option<OffsetDateTime> {
    match ends_at {
        Some(end) if plan.grace_period_days > 0 => {
            Some(end + Duration::days(i64::from(plan.grace_period_days)))
        }
        _ => None,
    }
}

/// Subscription lifecycle service
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: BillingEventLogger,
    notify: Arc<dyn NotificationSink>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        events: BillingEventLogger,
        notify: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            notify,
        }
    }

    async fn load_price_and_plan(&self, plan_price_id: Uuid) -> BillingResult<(PlanPrice, Plan)> {
        let price = self
            .store
            .plan_price(plan_price_id)
            .await?
            .ok_or(BillingError::NotFound("Plan price"))?;
        let plan = self
            .store
            .plan(price.plan_id)
            .await?
            .ok_or(BillingError::NotFound("Plan"))?;
        Ok((price, plan))
    }

    async fn load_owned(
        &self,
        tenant_id: TenantId,
        subscription_id: Uuid,
    ) -> BillingResult<Subscription> {
        let sub = self
            .store
            .subscription(subscription_id)
            .await?
            .ok_or(BillingError::NotFound("Subscription"))?;
        if sub.tenant_id != tenant_id {
            return Err(BillingError::Validation(
                "Subscription does not belong to this tenant".to_string(),
            ));
        }
        Ok(sub)
    }

    /// Start a trial subscription. Requires the price to carry trial days;
    /// any previous current subscription is superseded atomically.
    pub async fn start_trial(
        &self,
        tenant_id: TenantId,
        plan_price_id: Uuid,
    ) -> BillingResult<Subscription> {
        let (price, plan) = self.load_price_and_plan(plan_price_id).await?;
        if plan.is_archived {
            return Err(BillingError::Validation(
                "Plan is archived and cannot be subscribed to".to_string(),
            ));
        }
        if price.trial_days <= 0 {
            return Err(BillingError::Validation(
                "Plan price has no trial period".to_string(),
            ));
        }

        let now = self.clock.now();
        let trial_ends_at = now + Duration::days(i64::from(price.trial_days));
        let ends_at = Some(price.period_end(now));
        let grace = grace_period_ends(&plan, ends_at);

        let sub = self
            .store
            .create_current_subscription(NewSubscription {
                tenant_id,
                plan_price_id,
                starts_at: now,
                ends_at,
                trial_ends_at: Some(trial_ends_at),
                grace_period_ends_at: grace,
            })
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %sub.id,
            plan_price_id = %plan_price_id,
            trial_ends_at = %trial_ends_at,
            "Trial subscription started"
        );
        self.events
            .log(
                tenant_id,
                BillingEventKind::TrialStarted,
                Some(sub.id),
                serde_json::json!({
                    "plan_price_id": plan_price_id,
                    "trial_ends_at": trial_ends_at.to_string(),
                }),
            )
            .await;
        self.notify
            .notify(
                tenant_id,
                BillingEventKind::TrialStarted.as_str(),
                serde_json::json!({ "subscription_id": sub.id }),
            )
            .await;
        Ok(sub)
    }

    /// Create a paid subscription; the checkout-callback path after payment
    /// for a `NewSubscription` target succeeded.
    pub async fn activate_paid(
        &self,
        tenant_id: TenantId,
        plan_price_id: Uuid,
    ) -> BillingResult<Subscription> {
        let (price, plan) = self.load_price_and_plan(plan_price_id).await?;
        if plan.is_archived {
            return Err(BillingError::Validation(
                "Plan is archived and cannot be subscribed to".to_string(),
            ));
        }

        let now = self.clock.now();
        let ends_at = Some(price.period_end(now));
        let grace = grace_period_ends(&plan, ends_at);

        let sub = self
            .store
            .create_current_subscription(NewSubscription {
                tenant_id,
                plan_price_id,
                starts_at: now,
                ends_at,
                trial_ends_at: None,
                grace_period_ends_at: grace,
            })
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %sub.id,
            plan_price_id = %plan_price_id,
            "Paid subscription created"
        );
        self.events
            .log(
                tenant_id,
                BillingEventKind::SubscriptionCreated,
                Some(sub.id),
                serde_json::json!({ "plan_price_id": plan_price_id }),
            )
            .await;
        self.notify
            .notify(
                tenant_id,
                BillingEventKind::SubscriptionCreated.as_str(),
                serde_json::json!({ "subscription_id": sub.id }),
            )
            .await;
        Ok(sub)
    }

    /// Extend the subscription one billing period.
    ///
    /// An early renewal anchors at the old `ends_at` so the billing day is
    /// kept; a lapsed renewal anchors at "now". Clears any cancellation
    /// marker.
    pub async fn renew(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let sub = self
            .store
            .subscription(subscription_id)
            .await?
            .ok_or(BillingError::NotFound("Subscription"))?;
        if !sub.is_current() {
            return Err(BillingError::InvalidState(
                "Cannot renew a superseded subscription".to_string(),
            ));
        }
        let Some(old_ends_at) = sub.ends_at else {
            return Err(BillingError::Validation(
                "Open-ended subscription has no period to renew".to_string(),
            ));
        };
        let (price, plan) = self.load_price_and_plan(sub.plan_price_id).await?;

        let now = self.clock.now();
        let anchor = if old_ends_at > now { old_ends_at } else { now };
        let new_ends_at = Some(price.period_end(anchor));
        let grace = grace_period_ends(&plan, new_ends_at);

        let renewed = self
            .store
            .renew_subscription(SubscriptionRenewal {
                subscription_id,
                new_ends_at,
                new_grace_ends_at: grace,
            })
            .await?;
        if !renewed {
            return Err(BillingError::ConcurrentModification);
        }

        tracing::info!(
            tenant_id = %sub.tenant_id,
            subscription_id = %subscription_id,
            new_ends_at = ?new_ends_at,
            "Subscription renewed"
        );
        self.events
            .log(
                sub.tenant_id,
                BillingEventKind::SubscriptionRenewed,
                Some(subscription_id),
                serde_json::json!({
                    "old_ends_at": old_ends_at.to_string(),
                    "new_ends_at": new_ends_at.map(|t| t.to_string()),
                }),
            )
            .await;
        self.notify
            .notify(
                sub.tenant_id,
                BillingEventKind::SubscriptionRenewed.as_str(),
                serde_json::json!({ "subscription_id": subscription_id }),
            )
            .await;

        self.store
            .subscription(subscription_id)
            .await?
            .ok_or(BillingError::NotFound("Subscription"))
    }

    /// Mark the subscription canceled; access continues until the period
    /// ends (the resolver keeps it in the valid-access set until then).
    pub async fn cancel(&self, tenant_id: TenantId, subscription_id: Uuid) -> BillingResult<()> {
        let sub = self.load_owned(tenant_id, subscription_id).await?;
        if sub.canceled_at.is_some() {
            return Err(BillingError::Validation(
                "Subscription is already canceled".to_string(),
            ));
        }

        let now = self.clock.now();
        self.store
            .set_cancellation(subscription_id, Some(now))
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription_id,
            "Subscription canceled"
        );
        self.events
            .log(
                tenant_id,
                BillingEventKind::SubscriptionCanceled,
                Some(subscription_id),
                serde_json::json!({ "ends_at": sub.ends_at.map(|t| t.to_string()) }),
            )
            .await;
        self.notify
            .notify(
                tenant_id,
                BillingEventKind::SubscriptionCanceled.as_str(),
                serde_json::json!({ "subscription_id": subscription_id }),
            )
            .await;
        Ok(())
    }

    /// Undo a cancellation before the period runs out.
    pub async fn resume(&self, tenant_id: TenantId, subscription_id: Uuid) -> BillingResult<()> {
        let sub = self.load_owned(tenant_id, subscription_id).await?;
        if sub.canceled_at.is_none() {
            return Err(BillingError::Validation(
                "Subscription is not canceled".to_string(),
            ));
        }
        let now = self.clock.now();
        if sub.ends_at.is_some_and(|end| end <= now) {
            return Err(BillingError::InvalidState(
                "Subscription period has already ended".to_string(),
            ));
        }

        self.store.set_cancellation(subscription_id, None).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription_id,
            "Subscription resumed"
        );
        self.events
            .log(
                tenant_id,
                BillingEventKind::SubscriptionResumed,
                Some(subscription_id),
                serde_json::json!({}),
            )
            .await;
        Ok(())
    }

    /// Whether the tenant's current subscription permits system usage.
    pub async fn has_valid_access(&self, tenant_id: TenantId) -> BillingResult<bool> {
        let Some(sub) = self.store.current_subscription_for_tenant(tenant_id).await? else {
            return Ok(false);
        };
        Ok(status::has_valid_access(&sub, self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantry_shared::ProrationBehavior;
    use time::macros::datetime;

    fn plan(grace_days: i32) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "Pro".to_string(),
            grace_period_days: grace_days,
            upgrade_behavior: ProrationBehavior::Immediate,
            downgrade_behavior: ProrationBehavior::EndOfPeriod,
            is_archived: false,
            created_at: datetime!(2025-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_grace_period_from_plan_days() {
        let end = datetime!(2025-06-30 00:00 UTC);
        assert_eq!(
            grace_period_ends(&plan(5), Some(end)),
            Some(datetime!(2025-07-05 00:00 UTC))
        );
    }

    #[test]
    fn test_no_grace_for_zero_days_or_open_ended() {
        let end = datetime!(2025-06-30 00:00 UTC);
        assert_eq!(grace_period_ends(&plan(0), Some(end)), None);
        assert_eq!(grace_period_ends(&plan(5), None), None);
    }
}
