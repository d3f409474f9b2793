//! Plan change engine
//!
//! State machine over a subscription's plan-change intent. Which path a
//! change takes is decided by direction (price comparison) and the current
//! plan's proration behavior for that direction: immediate upgrades go
//! through a checkout and only swap after payment confirms; immediate
//! downgrades swap straight away without charging; end-of-period changes
//! park the target in `next_plan_price_id` for the scheduler to apply at the
//! period boundary.

use std::sync::Arc;

use tenantry_shared::{Clock, PlanPrice, ProrationBehavior, Subscription, TenantId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventKind, BillingEventLogger};
use crate::notify::NotificationSink;
use crate::proration::{self, ProrationQuote};
use crate::status;
use crate::store::{CatalogStore, PlanSwap, Store, SubscriptionStore};
use crate::subscriptions::grace_period_ends;

/// How a requested plan change was handled
#[derive(Debug, Clone)]
pub enum PlanChangeDecision {
    /// Immediate upgrade: the caller must collect `quote.final_amount`
    /// through a checkout; the swap happens on payment confirmation
    CheckoutRequired { quote: ProrationQuote },
    /// Deferred to the period boundary; the scheduler applies it
    Scheduled { effective_at: OffsetDateTime },
    /// Immediate downgrade: swapped now, nothing charged
    Applied,
}

/// Summary of one scheduler pass over due scheduled changes
#[derive(Debug, Clone, Default)]
pub struct ApplyChangesSummary {
    pub applied: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Plan change orchestration service
#[derive(Clone)]
pub struct PlanChangeService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: BillingEventLogger,
    notify: Arc<dyn NotificationSink>,
}

impl PlanChangeService {
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

    async fn current_subscription(&self, tenant_id: TenantId) -> BillingResult<Subscription> {
        self.store
            .current_subscription_for_tenant(tenant_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)
    }

    /// Validate a change target and load everything the decision needs.
    async fn load_change(
        &self,
        sub: &Subscription,
        new_plan_price_id: Uuid,
    ) -> BillingResult<(PlanPrice, PlanPrice)> {
        if new_plan_price_id == sub.plan_price_id {
            return Err(BillingError::Validation(
                "Subscription is already on this plan price".to_string(),
            ));
        }
        let current_price = self
            .store
            .plan_price(sub.plan_price_id)
            .await?
            .ok_or(BillingError::NotFound("Plan price"))?;
        let new_price = self
            .store
            .plan_price(new_plan_price_id)
            .await?
            .ok_or(BillingError::NotFound("Plan price"))?;
        let target_plan = self
            .store
            .plan(new_price.plan_id)
            .await?
            .ok_or(BillingError::NotFound("Plan"))?;
        if target_plan.is_archived {
            return Err(BillingError::Validation(
                "Target plan is archived".to_string(),
            ));
        }
        if new_price.currency != sub.effective_currency(&current_price) {
            return Err(BillingError::Validation(format!(
                "Currency mismatch: subscription is billed in {}, target price is in {}",
                sub.effective_currency(&current_price),
                new_price.currency
            )));
        }
        Ok((current_price, new_price))
    }

    /// Display/preview quote for changing to `new_plan_price_id`.
    pub async fn preview(
        &self,
        tenant_id: TenantId,
        new_plan_price_id: Uuid,
    ) -> BillingResult<ProrationQuote> {
        let sub = self.current_subscription(tenant_id).await?;
        let (current_price, new_price) = self.load_change(&sub, new_plan_price_id).await?;
        proration::calculate(&sub, &current_price, &new_price, self.clock.now())
    }

    /// Decide and (where possible) execute a plan change request.
    pub async fn request_change(
        &self,
        tenant_id: TenantId,
        new_plan_price_id: Uuid,
    ) -> BillingResult<PlanChangeDecision> {
        let now = self.clock.now();
        let sub = self.current_subscription(tenant_id).await?;
        if !status::has_valid_access(&sub, now) {
            return Err(BillingError::InvalidState(
                "Subscription has expired; renew instead of changing plan".to_string(),
            ));
        }
        let (current_price, new_price) = self.load_change(&sub, new_plan_price_id).await?;
        let current_plan = self
            .store
            .plan(current_price.plan_id)
            .await?
            .ok_or(BillingError::NotFound("Plan"))?;

        let is_upgrade = new_price.price > sub.effective_price(&current_price);
        // The plan the tenant is on governs how they may leave it.
        let behavior = if is_upgrade {
            current_plan.upgrade_behavior
        } else {
            current_plan.downgrade_behavior
        };

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %sub.id,
            new_plan_price_id = %new_plan_price_id,
            is_upgrade = is_upgrade,
            behavior = %behavior,
            "Plan change requested"
        );

        match (is_upgrade, behavior) {
            (true, ProrationBehavior::Immediate) => {
                let quote = proration::calculate(&sub, &current_price, &new_price, now)?;
                Ok(PlanChangeDecision::CheckoutRequired { quote })
            }
            (_, ProrationBehavior::EndOfPeriod) => {
                let Some(ends_at) = sub.ends_at else {
                    return Err(BillingError::Validation(
                        "Open-ended subscription has no period boundary to schedule against"
                            .to_string(),
                    ));
                };
                let previous = self
                    .store
                    .set_next_plan_price(sub.id, Some(new_plan_price_id))
                    .await?;
                if let Some(previous) = previous {
                    tracing::warn!(
                        subscription_id = %sub.id,
                        previous_target = %previous,
                        new_target = %new_plan_price_id,
                        "Overwriting existing scheduled plan change"
                    );
                }
                self.events
                    .log(
                        tenant_id,
                        BillingEventKind::PlanChangeScheduled,
                        Some(sub.id),
                        serde_json::json!({
                            "new_plan_price_id": new_plan_price_id,
                            "effective_at": ends_at.to_string(),
                            "is_upgrade": is_upgrade,
                        }),
                    )
                    .await;
                Ok(PlanChangeDecision::Scheduled {
                    effective_at: ends_at,
                })
            }
            (false, ProrationBehavior::Immediate) => {
                // Downgrades never charge and never refund automatically.
                self.swap_now(&sub, &new_price, now).await?;
                Ok(PlanChangeDecision::Applied)
            }
        }
    }

    /// Clear a scheduled change. Clearing when none is set is a silent
    /// no-op.
    pub async fn cancel_scheduled(&self, tenant_id: TenantId) -> BillingResult<()> {
        let sub = self.current_subscription(tenant_id).await?;
        if sub.next_plan_price_id.is_none() {
            return Ok(());
        }
        let previous = self.store.set_next_plan_price(sub.id, None).await?;
        if let Some(previous) = previous {
            tracing::info!(
                tenant_id = %tenant_id,
                subscription_id = %sub.id,
                cleared_target = %previous,
                "Scheduled plan change cancelled"
            );
            self.events
                .log(
                    tenant_id,
                    BillingEventKind::PlanChangeCancelled,
                    Some(sub.id),
                    serde_json::json!({ "cleared_target": previous }),
                )
                .await;
        }
        Ok(())
    }

    /// Swap after a paid immediate upgrade; invoked by the checkout-callback
    /// handler once the gateway confirmed the charge.
    pub async fn complete_paid_change(
        &self,
        subscription_id: Uuid,
        new_plan_price_id: Uuid,
    ) -> BillingResult<()> {
        let sub = self
            .store
            .subscription(subscription_id)
            .await?
            .ok_or(BillingError::NotFound("Subscription"))?;
        let new_price = self
            .store
            .plan_price(new_plan_price_id)
            .await?
            .ok_or(BillingError::NotFound("Plan price"))?;
        self.swap_now(&sub, &new_price, self.clock.now()).await
    }

    /// Atomic swap to `new_price` with the new period anchored at `from`.
    async fn swap_now(
        &self,
        sub: &Subscription,
        new_price: &PlanPrice,
        from: OffsetDateTime,
    ) -> BillingResult<()> {
        let new_plan = self
            .store
            .plan(new_price.plan_id)
            .await?
            .ok_or(BillingError::NotFound("Plan"))?;
        let new_ends_at = Some(new_price.period_end(from));
        let swapped = self
            .store
            .swap_plan(PlanSwap {
                subscription_id: sub.id,
                new_plan_price_id: new_price.id,
                new_ends_at,
                new_grace_ends_at: grace_period_ends(&new_plan, new_ends_at),
                expected_next: None,
            })
            .await?;
        if !swapped {
            return Err(BillingError::ConcurrentModification);
        }

        tracing::info!(
            tenant_id = %sub.tenant_id,
            subscription_id = %sub.id,
            from_plan_price = %sub.plan_price_id,
            to_plan_price = %new_price.id,
            new_ends_at = ?new_ends_at,
            "Plan swapped"
        );
        self.events
            .log(
                sub.tenant_id,
                BillingEventKind::PlanChanged,
                Some(sub.id),
                serde_json::json!({
                    "from_plan_price_id": sub.plan_price_id,
                    "to_plan_price_id": new_price.id,
                    "new_ends_at": new_ends_at.map(|t| t.to_string()),
                }),
            )
            .await;
        self.notify
            .notify(
                sub.tenant_id,
                BillingEventKind::PlanChanged.as_str(),
                serde_json::json!({ "subscription_id": sub.id }),
            )
            .await;
        Ok(())
    }

    /// Apply every scheduled change whose period boundary has passed.
    ///
    /// The new period anchors at the old `ends_at`, not "now", so a late
    /// sweep causes no period drift. The swap is guarded on the stored
    /// target still matching; a lost race counts as skipped, not an error.
    pub async fn apply_due_changes(&self) -> BillingResult<ApplyChangesSummary> {
        let now = self.clock.now();
        let due = self.store.due_scheduled_changes(now).await?;
        let mut summary = ApplyChangesSummary::default();

        for sub in due {
            let (Some(next_id), Some(old_ends_at)) = (sub.next_plan_price_id, sub.ends_at) else {
                // The range query guarantees both; a mismatch is a stale read.
                summary.skipped += 1;
                continue;
            };
            match self.apply_one(&sub, next_id, old_ends_at).await {
                Ok(true) => summary.applied += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        next_plan_price_id = %next_id,
                        error = %e,
                        "Failed to apply scheduled plan change; skipping record"
                    );
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn apply_one(
        &self,
        sub: &Subscription,
        next_id: Uuid,
        old_ends_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let new_price = self
            .store
            .plan_price(next_id)
            .await?
            .ok_or(BillingError::NotFound("Plan price"))?;
        let new_plan = self
            .store
            .plan(new_price.plan_id)
            .await?
            .ok_or(BillingError::NotFound("Plan"))?;

        let new_ends_at = Some(new_price.period_end(old_ends_at));
        let swapped = self
            .store
            .swap_plan(PlanSwap {
                subscription_id: sub.id,
                new_plan_price_id: next_id,
                new_ends_at,
                new_grace_ends_at: grace_period_ends(&new_plan, new_ends_at),
                expected_next: Some(next_id),
            })
            .await?;
        if !swapped {
            // Already applied or retargeted since the scan; no-op.
            return Ok(false);
        }

        tracing::info!(
            tenant_id = %sub.tenant_id,
            subscription_id = %sub.id,
            to_plan_price = %next_id,
            new_ends_at = ?new_ends_at,
            "Scheduled plan change applied"
        );
        self.events
            .log(
                sub.tenant_id,
                BillingEventKind::PlanChanged,
                Some(sub.id),
                serde_json::json!({
                    "from_plan_price_id": sub.plan_price_id,
                    "to_plan_price_id": next_id,
                    "scheduled": true,
                    "new_ends_at": new_ends_at.map(|t| t.to_string()),
                }),
            )
            .await;
        self.notify
            .notify(
                sub.tenant_id,
                BillingEventKind::PlanChanged.as_str(),
                serde_json::json!({ "subscription_id": sub.id }),
            )
            .await;
        Ok(true)
    }
}
