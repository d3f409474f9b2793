//! Lifecycle scheduler operations
//!
//! Idempotent batch sweeps the worker runs on independent cadences. Every
//! at-most-once guarantee here is backed by the effect ledger: the scan is
//! at-least-once (re-running over the same date window is expected), and the
//! ledger's atomic insert-or-ignore decides which run owns the side effect.
//! Per-record failures are counted and logged, never abort the batch, and no
//! sweep depends on the execution order of another.

use std::sync::Arc;

use tenantry_shared::{Clock, Subscription, TenantId};
use time::{Date, Duration, OffsetDateTime, Time};
use uuid::Uuid;

use crate::addons::AddonService;
use crate::error::BillingResult;
use crate::events::{BillingEventKind, BillingEventLogger};
use crate::notify::NotificationSink;
use crate::plan_change::{ApplyChangesSummary, PlanChangeService};
use crate::store::{
    AddonStore, CheckoutStore, EffectKey, EffectLedger, EventStore, Store, SubscriptionStore,
};
use crate::usage::{UsageResetSummary, UsageService};

/// Outcome counters for one sweep run
#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    pub processed: usize,
    pub errors: usize,
}

/// Counters for the retention sweep
#[derive(Debug, Clone, Default)]
pub struct RetentionSummary {
    pub events_anonymized: u64,
    pub ledger_rows_pruned: u64,
}

/// Start of the UTC calendar day containing `t`.
fn day_start(t: OffsetDateTime) -> OffsetDateTime {
    t.replace_time(Time::MIDNIGHT)
}

/// Batch lifecycle service
#[derive(Clone)]
pub struct LifecycleService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: BillingEventLogger,
    notify: Arc<dyn NotificationSink>,
    plan_change: PlanChangeService,
    addons: AddonService,
    usage: UsageService,
    reminder_offsets_days: Vec<i64>,
    ledger_ttl_days: i64,
    event_retention_days: i64,
}

impl LifecycleService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        events: BillingEventLogger,
        notify: Arc<dyn NotificationSink>,
        plan_change: PlanChangeService,
        addons: AddonService,
        usage: UsageService,
        reminder_offsets_days: Vec<i64>,
        ledger_ttl_days: i64,
        event_retention_days: i64,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            notify,
            plan_change,
            addons,
            usage,
            reminder_offsets_days,
            ledger_ttl_days,
            event_retention_days,
        }
    }

    /// Transition pending checkouts past their expiry. The `pending`-only
    /// guard lives in the store; completed/cancelled/failed rows are never
    /// touched, and a duplicate run finds nothing to transition.
    pub async fn expire_checkouts(&self) -> BillingResult<SweepSummary> {
        let expired = self.store.expire_due_checkouts(self.clock.now()).await?;
        let summary = SweepSummary {
            processed: expired.len(),
            errors: 0,
        };

        for checkout in expired {
            tracing::info!(
                tenant_id = %checkout.tenant_id,
                checkout_id = %checkout.id,
                merchant_order_id = %checkout.merchant_order_id,
                "Checkout expired"
            );
            self.events
                .log(
                    checkout.tenant_id,
                    BillingEventKind::CheckoutExpired,
                    Some(checkout.id),
                    serde_json::json!({ "expired_at": checkout.expires_at.to_string() }),
                )
                .await;
        }
        Ok(summary)
    }

    /// Emit one `subscription_ended` event per subscription whose period
    /// ended during the previous UTC day.
    pub async fn flag_ended_subscriptions(&self) -> BillingResult<SweepSummary> {
        let now = self.clock.now();
        let window_end = day_start(now);
        let window_start = window_end - Duration::days(1);
        let subs = self
            .store
            .subscriptions_ending_within(window_start, window_end)
            .await?;
        self.emit_ended(
            subs,
            window_start.date(),
            BillingEventKind::SubscriptionEnded,
        )
        .await
    }

    /// Emit one `trial_ended` event per trial that ended during the
    /// previous UTC day.
    pub async fn flag_ended_trials(&self) -> BillingResult<SweepSummary> {
        let now = self.clock.now();
        let window_end = day_start(now);
        let window_start = window_end - Duration::days(1);
        let subs = self
            .store
            .trials_ending_within(window_start, window_end)
            .await?;
        self.emit_ended(subs, window_start.date(), BillingEventKind::TrialEnded)
            .await
    }

    async fn emit_ended(
        &self,
        subs: Vec<Subscription>,
        window_day: Date,
        kind: BillingEventKind,
    ) -> BillingResult<SweepSummary> {
        let mut summary = SweepSummary::default();
        for sub in subs {
            match self
                .effect_once(sub.tenant_id, sub.id, kind, window_day, None)
                .await
            {
                Ok(true) => summary.processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        kind = %kind,
                        error = %e,
                        "Failed to flag ended subscription; skipping record"
                    );
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Apply scheduled plan changes whose period boundary has passed.
    pub async fn apply_scheduled_changes(&self) -> BillingResult<ApplyChangesSummary> {
        self.plan_change.apply_due_changes().await
    }

    /// Send renewal, trial-ending, and addon-expiry reminders for each
    /// configured day offset, at most once per (entity, offset, day).
    pub async fn send_reminders(&self) -> BillingResult<SweepSummary> {
        let now = self.clock.now();
        let today = day_start(now);
        let mut summary = SweepSummary::default();

        for &offset in &self.reminder_offsets_days {
            let window_start = today + Duration::days(offset);
            let window_end = window_start + Duration::days(1);

            let ending = self
                .store
                .subscriptions_ending_within(window_start, window_end)
                .await?;
            for sub in ending {
                self.reminder_once(
                    &mut summary,
                    sub.tenant_id,
                    sub.id,
                    BillingEventKind::RenewalReminder,
                    offset,
                    today.date(),
                )
                .await;
            }

            let trials = self
                .store
                .trials_ending_within(window_start, window_end)
                .await?;
            for sub in trials {
                self.reminder_once(
                    &mut summary,
                    sub.tenant_id,
                    sub.id,
                    BillingEventKind::TrialEndingReminder,
                    offset,
                    today.date(),
                )
                .await;
            }

            let addons = self
                .store
                .addons_expiring_within(window_start, window_end)
                .await?;
            for row in addons {
                self.reminder_once(
                    &mut summary,
                    row.tenant_id,
                    row.id,
                    BillingEventKind::AddonExpiryReminder,
                    offset,
                    today.date(),
                )
                .await;
            }
        }
        Ok(summary)
    }

    async fn reminder_once(
        &self,
        summary: &mut SweepSummary,
        tenant_id: TenantId,
        subject_id: Uuid,
        kind: BillingEventKind,
        offset: i64,
        window_day: Date,
    ) {
        match self
            .effect_once(tenant_id, subject_id, kind, window_day, Some(offset))
            .await
        {
            Ok(true) => summary.processed += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    subject_id = %subject_id,
                    kind = %kind,
                    offset_days = offset,
                    error = %e,
                    "Failed to send reminder; skipping record"
                );
                summary.errors += 1;
            }
        }
    }

    /// Claim the effect in the ledger; only the claiming run emits the
    /// event and notification. Returns whether this run owned the effect.
    async fn effect_once(
        &self,
        tenant_id: TenantId,
        subject_id: Uuid,
        kind: BillingEventKind,
        window_day: Date,
        offset_days: Option<i64>,
    ) -> BillingResult<bool> {
        let ledger_kind = match offset_days {
            Some(offset) => format!("{}_{}d", kind.as_str(), offset),
            None => kind.as_str().to_string(),
        };
        let owned = self
            .store
            .record_effect_once(EffectKey {
                subject_id,
                kind: ledger_kind,
                window: window_day,
            })
            .await?;
        if !owned {
            return Ok(false);
        }

        let payload = serde_json::json!({
            "subject_id": subject_id,
            "offset_days": offset_days,
            "window_day": window_day.to_string(),
        });
        self.events
            .log(tenant_id, kind, Some(subject_id), payload.clone())
            .await;
        self.notify.notify(tenant_id, kind.as_str(), payload).await;
        Ok(true)
    }

    /// Reset metered usage cycles that have ended.
    pub async fn reset_usage_cycles(&self) -> BillingResult<UsageResetSummary> {
        self.usage.reset_due().await
    }

    /// Deactivate expired addon holdings.
    pub async fn deactivate_expired_addons(&self) -> BillingResult<SweepSummary> {
        let result = self.addons.deactivate_due().await?;
        Ok(SweepSummary {
            processed: result.deactivated,
            errors: result.errors,
        })
    }

    /// Age-threshold retention: anonymize old billing events and prune
    /// expired effect-ledger rows. Both are pure time-threshold deletions
    /// and safe to re-run.
    pub async fn retention_sweep(&self) -> BillingResult<RetentionSummary> {
        let now = self.clock.now();
        let events_anonymized = self
            .store
            .anonymize_events_before(now - Duration::days(self.event_retention_days))
            .await?;
        let ledger_cutoff = (now - Duration::days(self.ledger_ttl_days)).date();
        let ledger_rows_pruned = self.store.prune_effects_before(ledger_cutoff).await?;
        Ok(RetentionSummary {
            events_anonymized,
            ledger_rows_pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_day_start_truncates_to_utc_midnight() {
        assert_eq!(
            day_start(datetime!(2025-06-15 17:42:09 UTC)),
            datetime!(2025-06-15 00:00 UTC)
        );
        assert_eq!(
            day_start(datetime!(2025-06-15 00:00 UTC)),
            datetime!(2025-06-15 00:00 UTC)
        );
    }
}
