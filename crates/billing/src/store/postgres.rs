//! Postgres persistence
//!
//! Implements every repository trait on a single pool. Guarded transitions
//! put the state check and the update in one statement so concurrent callers
//! serialize on the row; multi-row invariants (one current subscription per
//! tenant, payment-with-completion) are kept inside transactions.

use sqlx::types::Json;
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use tenantry_shared::{
    Addon, Checkout, Payment, Plan, PlanPrice, Subscription, Tenant, TenantAddon, TenantId,
    TenantUsage,
};

use crate::error::{BillingError, BillingResult};
use crate::store::{
    AddonPurchaseRecord, AddonRenewalRecord, AddonStore, CatalogStore, CheckoutCompletion,
    CheckoutStore, EffectKey, EffectLedger, EventStore, NewBillingEvent, NewCheckout,
    NewSubscription, PaymentRefund, PlanSwap, SubscriptionRenewal, SubscriptionStore, TenantStore,
    UsageCycleReset, UsageDelta, UsageStore,
};

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl TenantStore for PgStore {
    async fn tenant(&self, id: TenantId) -> BillingResult<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tenant)
    }
}

#[async_trait::async_trait]
impl CatalogStore for PgStore {
    async fn plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    async fn plan_price(&self, id: Uuid) -> BillingResult<Option<PlanPrice>> {
        let price = sqlx::query_as::<_, PlanPrice>("SELECT * FROM plan_prices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(price)
    }

    async fn addon(&self, id: Uuid) -> BillingResult<Option<Addon>> {
        let addon = sqlx::query_as::<_, Addon>("SELECT * FROM addons WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(addon)
    }
}

#[async_trait::async_trait]
impl SubscriptionStore for PgStore {
    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn current_subscription_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE tenant_id = $1 AND superseded_at IS NULL",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn create_current_subscription(
        &self,
        new: NewSubscription,
    ) -> BillingResult<Subscription> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        // Retire the previous current row in the same transaction so the
        // partial unique index never sees two current subscriptions.
        sqlx::query(
            r#"
            UPDATE subscriptions SET superseded_at = $2, updated_at = NOW()
            WHERE tenant_id = $1 AND superseded_at IS NULL
            "#,
        )
        .bind(new.tenant_id)
        .bind(new.starts_at)
        .execute(&mut *tx)
        .await?;

        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions
                (id, tenant_id, plan_price_id, starts_at, ends_at, trial_ends_at,
                 grace_period_ends_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(new.plan_price_id)
        .bind(new.starts_at)
        .bind(new.ends_at)
        .bind(new.trial_ends_at)
        .bind(new.grace_period_ends_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(sub)
    }

    async fn swap_plan(&self, swap: PlanSwap) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_price_id = $2,
                next_plan_price_id = NULL,
                ends_at = $3,
                grace_period_ends_at = $4,
                updated_at = NOW()
            WHERE id = $1
              AND superseded_at IS NULL
              AND ($5::uuid IS NULL OR next_plan_price_id = $5)
            "#,
        )
        .bind(swap.subscription_id)
        .bind(swap.new_plan_price_id)
        .bind(swap.new_ends_at)
        .bind(swap.new_grace_ends_at)
        .bind(swap.expected_next)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_next_plan_price(
        &self,
        subscription_id: Uuid,
        next: Option<Uuid>,
    ) -> BillingResult<Option<Uuid>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let previous: Option<Option<Uuid>> = sqlx::query_scalar(
            r#"
            SELECT next_plan_price_id FROM subscriptions
            WHERE id = $1 AND superseded_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(previous) = previous else {
            return Err(BillingError::SubscriptionNotFound);
        };

        sqlx::query(
            "UPDATE subscriptions SET next_plan_price_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(next)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(previous)
    }

    async fn renew_subscription(&self, renewal: SubscriptionRenewal) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                ends_at = $2,
                grace_period_ends_at = $3,
                canceled_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND superseded_at IS NULL
            "#,
        )
        .bind(renewal.subscription_id)
        .bind(renewal.new_ends_at)
        .bind(renewal.new_grace_ends_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_cancellation(
        &self,
        subscription_id: Uuid,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET canceled_at = $2, updated_at = NOW() \
             WHERE id = $1 AND superseded_at IS NULL",
        )
        .bind(subscription_id)
        .bind(canceled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_scheduled_changes(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE superseded_at IS NULL
              AND next_plan_price_id IS NOT NULL
              AND ends_at IS NOT NULL
              AND ends_at <= $1
            ORDER BY ends_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn subscriptions_ending_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE superseded_at IS NULL AND ends_at >= $1 AND ends_at < $2
            ORDER BY ends_at
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn trials_ending_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE superseded_at IS NULL AND trial_ends_at >= $1 AND trial_ends_at < $2
            ORDER BY trial_ends_at
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }
}

#[async_trait::async_trait]
impl CheckoutStore for PgStore {
    async fn create_checkout(&self, new: NewCheckout) -> BillingResult<Checkout> {
        let checkout = sqlx::query_as::<_, Checkout>(
            r#"
            INSERT INTO checkouts
                (id, tenant_id, merchant_order_id, kind, target, amount,
                 proration_credit, final_amount, currency, status, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.tenant_id)
        .bind(&new.merchant_order_id)
        .bind(new.kind)
        .bind(Json(&new.target))
        .bind(new.amount)
        .bind(new.proration_credit)
        .bind(new.final_amount)
        .bind(&new.currency)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(checkout)
    }

    async fn checkout(&self, id: Uuid) -> BillingResult<Option<Checkout>> {
        let checkout = sqlx::query_as::<_, Checkout>("SELECT * FROM checkouts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(checkout)
    }

    async fn checkout_by_merchant_order(
        &self,
        merchant_order_id: &str,
    ) -> BillingResult<Option<Checkout>> {
        let checkout =
            sqlx::query_as::<_, Checkout>("SELECT * FROM checkouts WHERE merchant_order_id = $1")
                .bind(merchant_order_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(checkout)
    }

    async fn claim_checkout(&self, merchant_order_id: &str) -> BillingResult<Option<Checkout>> {
        // Single-statement pending-only claim: concurrent callbacks for the
        // same order serialize on the row lock and only the first matches,
        // so a duplicate can never run provisioning alongside the winner.
        let checkout = sqlx::query_as::<_, Checkout>(
            r#"
            UPDATE checkouts SET status = 'processing', updated_at = NOW()
            WHERE merchant_order_id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(merchant_order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(checkout)
    }

    async fn release_checkout_claim(&self, checkout_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE checkouts SET status = 'pending', updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(checkout_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_checkout(&self, completion: CheckoutCompletion) -> BillingResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let checkout = sqlx::query_as::<_, Checkout>(
            r#"
            UPDATE checkouts SET
                status = 'completed',
                gateway_reference = $2,
                completed_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING *
            "#,
        )
        .bind(completion.checkout_id)
        .bind(&completion.gateway_reference)
        .bind(completion.completed_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(checkout) = checkout else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO payments
                (id, tenant_id, checkout_id, amount, currency, gateway_reference, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(checkout.tenant_id)
        .bind(checkout.id)
        .bind(checkout.final_amount)
        .bind(&checkout.currency)
        .bind(&completion.gateway_reference)
        .bind(completion.completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(true)
    }

    async fn fail_checkout(&self, checkout_id: Uuid, reason: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE checkouts SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(checkout_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_checkout(&self, checkout_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE checkouts SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(checkout_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_due_checkouts(&self, now: OffsetDateTime) -> BillingResult<Vec<Checkout>> {
        let expired = sqlx::query_as::<_, Checkout>(
            r#"
            UPDATE checkouts SET status = 'expired', updated_at = NOW()
            WHERE status = 'pending' AND expires_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(expired)
    }

    async fn payment_for_checkout(&self, checkout_id: Uuid) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE checkout_id = $1")
            .bind(checkout_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn mark_payment_refunded(&self, refund: PaymentRefund) -> BillingResult<bool> {
        // The refundable check rides in the WHERE clause so concurrent
        // refunds cannot overshoot the captured amount.
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                refunded_amount = refunded_amount + $2,
                refunded_at = $3
            WHERE id = $1 AND refunded_amount + $2 <= amount
            "#,
        )
        .bind(refund.payment_id)
        .bind(refund.amount)
        .bind(refund.refunded_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl AddonStore for PgStore {
    async fn tenant_addon(&self, id: Uuid) -> BillingResult<Option<TenantAddon>> {
        let row = sqlx::query_as::<_, TenantAddon>("SELECT * FROM tenant_addons WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn tenant_addon_for(
        &self,
        tenant_id: TenantId,
        addon_id: Uuid,
    ) -> BillingResult<Option<TenantAddon>> {
        let row = sqlx::query_as::<_, TenantAddon>(
            "SELECT * FROM tenant_addons WHERE tenant_id = $1 AND addon_id = $2",
        )
        .bind(tenant_id)
        .bind(addon_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_addon_purchase(
        &self,
        purchase: AddonPurchaseRecord,
    ) -> BillingResult<TenantAddon> {
        // An active holding absorbs the quantity and keeps its term; an
        // inactive one restarts with the purchased term.
        let row = sqlx::query_as::<_, TenantAddon>(
            r#"
            INSERT INTO tenant_addons
                (id, tenant_id, addon_id, quantity, started_at, expires_at, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE)
            ON CONFLICT (tenant_id, addon_id) DO UPDATE SET
                quantity = CASE WHEN tenant_addons.is_active
                    THEN tenant_addons.quantity + EXCLUDED.quantity
                    ELSE EXCLUDED.quantity END,
                started_at = CASE WHEN tenant_addons.is_active
                    THEN tenant_addons.started_at
                    ELSE EXCLUDED.started_at END,
                expires_at = CASE WHEN tenant_addons.is_active
                    THEN tenant_addons.expires_at
                    ELSE EXCLUDED.expires_at END,
                is_active = TRUE,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(purchase.tenant_id)
        .bind(purchase.addon_id)
        .bind(purchase.quantity)
        .bind(purchase.started_at)
        .bind(purchase.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(row)
    }

    async fn renew_tenant_addon(&self, renewal: AddonRenewalRecord) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_addons SET expires_at = $2, is_active = TRUE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(renewal.tenant_addon_id)
        .bind(renewal.new_expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_due_addons(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantAddon>> {
        let rows = sqlx::query_as::<_, TenantAddon>(
            r#"
            UPDATE tenant_addons SET is_active = FALSE, updated_at = NOW()
            WHERE is_active AND expires_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn addons_expiring_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<TenantAddon>> {
        let rows = sqlx::query_as::<_, TenantAddon>(
            r#"
            SELECT * FROM tenant_addons
            WHERE is_active AND expires_at >= $1 AND expires_at < $2
            ORDER BY expires_at
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait::async_trait]
impl UsageStore for PgStore {
    async fn record_usage(&self, update: UsageDelta) -> BillingResult<TenantUsage> {
        let row = sqlx::query_as::<_, TenantUsage>(
            r#"
            INSERT INTO tenant_usages (id, tenant_id, feature, used, cycle_ends_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, feature) DO UPDATE SET
                used = tenant_usages.used + EXCLUDED.used,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(update.tenant_id)
        .bind(&update.feature)
        .bind(update.delta)
        .bind(update.default_cycle_ends_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(row)
    }

    async fn usage_due_for_reset(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantUsage>> {
        let rows = sqlx::query_as::<_, TenantUsage>(
            "SELECT * FROM tenant_usages WHERE cycle_ends_at <= $1 ORDER BY cycle_ends_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn reset_usage_cycle(&self, reset: UsageCycleReset) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_usages SET used = 0, cycle_ends_at = $3, updated_at = NOW()
            WHERE id = $1 AND cycle_ends_at = $2
            "#,
        )
        .bind(reset.usage_id)
        .bind(reset.expected_cycle_ends_at)
        .bind(reset.new_cycle_ends_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl EffectLedger for PgStore {
    async fn record_effect_once(&self, effect: EffectKey) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO effect_ledger (subject_id, kind, window_day)
            VALUES ($1, $2, $3)
            ON CONFLICT (subject_id, kind, window_day) DO NOTHING
            "#,
        )
        .bind(effect.subject_id)
        .bind(&effect.kind)
        .bind(effect.window)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune_effects_before(&self, cutoff: Date) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM effect_ledger WHERE window_day < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl EventStore for PgStore {
    async fn append_event(&self, event: NewBillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (id, tenant_id, kind, subject_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.tenant_id)
        .bind(&event.kind)
        .bind(event.subject_id)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn anonymize_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE billing_events SET payload = '{}'::jsonb
            WHERE created_at < $1 AND payload <> '{}'::jsonb
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
