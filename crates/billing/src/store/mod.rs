//! Repository traits
//!
//! Storage-agnostic persistence seams for the billing core. Each method is
//! an atomic per-aggregate operation: guarded updates report whether they
//! matched so callers can distinguish "applied" from "already done" without
//! a second round trip. `postgres` provides the production implementation;
//! tests supply an in-memory one.

pub mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use tenantry_shared::{
    Addon, Checkout, CheckoutKind, CheckoutTarget, Payment, Plan, PlanPrice, Subscription, Tenant,
    TenantAddon, TenantId, TenantUsage,
};

use crate::error::BillingResult;

pub use postgres::PgStore;

// =============================================================================
// Tenants & Catalog
// =============================================================================

/// Tenant lookups
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn tenant(&self, id: TenantId) -> BillingResult<Option<Tenant>>;
}

/// Read-only plan/price/addon catalog.
///
/// Catalog rows are managed outside the lifecycle core (migrations, admin
/// tooling); prices are immutable once referenced.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn plan(&self, id: Uuid) -> BillingResult<Option<Plan>>;
    async fn plan_price(&self, id: Uuid) -> BillingResult<Option<PlanPrice>>;
    async fn addon(&self, id: Uuid) -> BillingResult<Option<Addon>>;
}

// =============================================================================
// Subscriptions
// =============================================================================

/// New current subscription for a tenant
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub tenant_id: TenantId,
    pub plan_price_id: Uuid,
    pub starts_at: OffsetDateTime,
    pub ends_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
}

/// Atomic plan swap.
///
/// Always sets the new price, clears the scheduled target, and rewrites the
/// period fields together so a crash cannot leave them inconsistent. With
/// `expected_next` set the swap only applies while the stored scheduled
/// target still matches — the idempotency guard for the scheduler path.
#[derive(Debug, Clone)]
pub struct PlanSwap {
    pub subscription_id: Uuid,
    pub new_plan_price_id: Uuid,
    pub new_ends_at: Option<OffsetDateTime>,
    pub new_grace_ends_at: Option<OffsetDateTime>,
    pub expected_next: Option<Uuid>,
}

/// Period extension for a renewal; also clears any cancellation marker
#[derive(Debug, Clone)]
pub struct SubscriptionRenewal {
    pub subscription_id: Uuid,
    pub new_ends_at: Option<OffsetDateTime>,
    pub new_grace_ends_at: Option<OffsetDateTime>,
}

/// Subscription repository
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// The tenant's current (non-superseded) subscription, if any
    async fn current_subscription_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>>;

    /// Insert a new current subscription, superseding any previous current
    /// row for the tenant in the same transaction
    async fn create_current_subscription(
        &self,
        new: NewSubscription,
    ) -> BillingResult<Subscription>;

    /// Guarded atomic swap; returns false when the guard did not match
    async fn swap_plan(&self, swap: PlanSwap) -> BillingResult<bool>;

    /// Set or clear the scheduled change target; returns the previous target
    async fn set_next_plan_price(
        &self,
        subscription_id: Uuid,
        next: Option<Uuid>,
    ) -> BillingResult<Option<Uuid>>;

    /// Extend the period after a paid renewal
    async fn renew_subscription(&self, renewal: SubscriptionRenewal) -> BillingResult<bool>;

    /// Set (cancel) or clear (resume) the cancellation marker
    async fn set_cancellation(
        &self,
        subscription_id: Uuid,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<()>;

    /// Current subscriptions with a scheduled change whose period has passed
    async fn due_scheduled_changes(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    /// Current subscriptions with `ends_at` in `[from, to)`
    async fn subscriptions_ending_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Current subscriptions with `trial_ends_at` in `[from, to)`
    async fn trials_ending_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;
}

// =============================================================================
// Checkouts & Payments
// =============================================================================

/// New pending checkout
#[derive(Debug, Clone)]
pub struct NewCheckout {
    pub tenant_id: TenantId,
    pub merchant_order_id: String,
    pub kind: CheckoutKind,
    pub target: CheckoutTarget,
    pub amount: Decimal,
    pub proration_credit: Decimal,
    pub final_amount: Decimal,
    pub currency: String,
    pub expires_at: OffsetDateTime,
}

/// Terminal completion of a claimed checkout; the payment row is written in
/// the same transaction from the checkout's own amounts
#[derive(Debug, Clone)]
pub struct CheckoutCompletion {
    pub checkout_id: Uuid,
    pub gateway_reference: String,
    pub completed_at: OffsetDateTime,
}

/// Refund bookkeeping against a captured payment
#[derive(Debug, Clone)]
pub struct PaymentRefund {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub refunded_at: OffsetDateTime,
}

/// Checkout repository
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    async fn create_checkout(&self, new: NewCheckout) -> BillingResult<Checkout>;

    async fn checkout(&self, id: Uuid) -> BillingResult<Option<Checkout>>;

    async fn checkout_by_merchant_order(
        &self,
        merchant_order_id: &str,
    ) -> BillingResult<Option<Checkout>>;

    /// Atomically claim a checkout for callback processing: transitions
    /// `pending` → `processing` and returns the claimed row, or None when
    /// the checkout is missing, already claimed, or terminal. The state
    /// check and update happen in one statement, so of two concurrent
    /// callbacks for the same order exactly one wins the claim.
    async fn claim_checkout(&self, merchant_order_id: &str) -> BillingResult<Option<Checkout>>;

    /// `processing` → `pending`: releases a claim after provisioning fails
    /// so a later gateway retry can claim again. Returns false when the
    /// checkout is not in `processing`.
    async fn release_checkout_claim(&self, checkout_id: Uuid) -> BillingResult<bool>;

    /// `processing` → `completed` plus the payment row, in one transaction;
    /// returns false when the checkout was not in `processing`
    async fn complete_checkout(&self, completion: CheckoutCompletion) -> BillingResult<bool>;

    /// `processing` → `failed` with a human-readable reason
    async fn fail_checkout(&self, checkout_id: Uuid, reason: &str) -> BillingResult<bool>;

    /// `pending`/`processing` → `cancelled`
    async fn cancel_checkout(&self, checkout_id: Uuid) -> BillingResult<bool>;

    /// `pending` past `expires_at` → `expired`; returns the transitioned rows
    /// so lifecycle events fire exactly once per transition
    async fn expire_due_checkouts(&self, now: OffsetDateTime) -> BillingResult<Vec<Checkout>>;

    async fn payment_for_checkout(&self, checkout_id: Uuid) -> BillingResult<Option<Payment>>;

    /// Accumulate a refund on a payment; returns false when the payment is
    /// missing or the amount exceeds the refundable remainder
    async fn mark_payment_refunded(&self, refund: PaymentRefund) -> BillingResult<bool>;
}

// =============================================================================
// Addons
// =============================================================================

/// Addon purchase application.
///
/// One row per (tenant, addon): an active row absorbs the quantity and keeps
/// its expiry; an inactive or missing row is (re)started with the given term.
#[derive(Debug, Clone)]
pub struct AddonPurchaseRecord {
    pub tenant_id: TenantId,
    pub addon_id: Uuid,
    pub quantity: i32,
    pub started_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// Term extension for an existing tenant addon
#[derive(Debug, Clone)]
pub struct AddonRenewalRecord {
    pub tenant_addon_id: Uuid,
    pub new_expires_at: OffsetDateTime,
}

/// Tenant addon repository
#[async_trait]
pub trait AddonStore: Send + Sync {
    async fn tenant_addon(&self, id: Uuid) -> BillingResult<Option<TenantAddon>>;

    async fn tenant_addon_for(
        &self,
        tenant_id: TenantId,
        addon_id: Uuid,
    ) -> BillingResult<Option<TenantAddon>>;

    async fn upsert_addon_purchase(
        &self,
        purchase: AddonPurchaseRecord,
    ) -> BillingResult<TenantAddon>;

    /// Extend the term and reactivate; returns false when the row is missing
    async fn renew_tenant_addon(&self, renewal: AddonRenewalRecord) -> BillingResult<bool>;

    /// Active addons past `expires_at` → inactive; returns the transitioned
    /// rows
    async fn deactivate_due_addons(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantAddon>>;

    /// Active addons with `expires_at` in `[from, to)`
    async fn addons_expiring_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<TenantAddon>>;
}

// =============================================================================
// Usage
// =============================================================================

/// Consumption increment; creates the counter with `default_cycle_ends_at`
/// when no row exists yet
#[derive(Debug, Clone)]
pub struct UsageDelta {
    pub tenant_id: TenantId,
    pub feature: String,
    pub delta: i64,
    pub default_cycle_ends_at: OffsetDateTime,
}

/// Watermark-guarded cycle reset
#[derive(Debug, Clone)]
pub struct UsageCycleReset {
    pub usage_id: Uuid,
    pub expected_cycle_ends_at: OffsetDateTime,
    pub new_cycle_ends_at: OffsetDateTime,
}

/// Metered usage repository
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record_usage(&self, update: UsageDelta) -> BillingResult<TenantUsage>;

    async fn usage_due_for_reset(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantUsage>>;

    /// Zero the counter and advance the watermark; guarded by the expected
    /// watermark so concurrent sweeps cannot double-advance. Returns false
    /// when the guard did not match.
    async fn reset_usage_cycle(&self, reset: UsageCycleReset) -> BillingResult<bool>;
}

// =============================================================================
// Effect Ledger & Events
// =============================================================================

/// Idempotency key for an at-most-once lifecycle effect
#[derive(Debug, Clone)]
pub struct EffectKey {
    pub subject_id: Uuid,
    pub kind: String,
    /// Calendar day the effect belongs to (UTC)
    pub window: Date,
}

/// Explicit idempotency ledger backing every at-most-once guarantee in the
/// lifecycle scheduler
#[async_trait]
pub trait EffectLedger: Send + Sync {
    /// Insert-or-ignore; true when this call recorded the effect (the caller
    /// owns the side effect), false when it was already recorded
    async fn record_effect_once(&self, effect: EffectKey) -> BillingResult<bool>;

    /// Drop ledger rows with a window before `cutoff`; returns the count
    async fn prune_effects_before(&self, cutoff: Date) -> BillingResult<u64>;
}

/// Append-only billing activity record
#[derive(Debug, Clone)]
pub struct NewBillingEvent {
    pub tenant_id: TenantId,
    pub kind: String,
    pub subject_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Billing event log
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, event: NewBillingEvent) -> BillingResult<()>;

    /// Strip payloads from events older than `cutoff` (retention
    /// anonymization); returns the affected count
    async fn anonymize_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;
}

// =============================================================================
// Aggregate Store
// =============================================================================

/// Everything the billing services need from persistence
pub trait Store:
    TenantStore
    + CatalogStore
    + SubscriptionStore
    + CheckoutStore
    + AddonStore
    + UsageStore
    + EffectLedger
    + EventStore
{
}

impl<T> Store for T where
    T: TenantStore
        + CatalogStore
        + SubscriptionStore
        + CheckoutStore
        + AddonStore
        + UsageStore
        + EffectLedger
        + EventStore
{
}
