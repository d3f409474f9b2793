//! Shared test doubles for the billing integration tests: an in-memory
//! store mirroring the guarded-transition semantics of the Postgres
//! implementation, a settable clock, a scriptable gateway, and a recording
//! notification sink.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use tenantry_billing::gateway::{
    sign_callback, BuyerInfo, ParsedCallback, PaymentGateway, PaymentToken, RefundReceipt,
};
use tenantry_billing::store::{
    AddonPurchaseRecord, AddonRenewalRecord, AddonStore, CatalogStore, CheckoutCompletion,
    CheckoutStore, EffectKey, EffectLedger, EventStore, NewBillingEvent, NewCheckout,
    NewSubscription, PaymentRefund, PlanSwap, Store, SubscriptionRenewal, SubscriptionStore,
    TenantStore, UsageCycleReset, UsageDelta, UsageStore,
};
use tenantry_billing::{
    BillingConfig, BillingError, BillingResult, BillingService, GatewayConfig, NotificationSink,
};
use tenantry_shared::{
    Addon, BillingInterval, Checkout, CheckoutStatus, Clock, Payment, Plan, PlanPrice,
    ProrationBehavior, Subscription, Tenant, TenantAddon, TenantId, TenantUsage,
};

pub const CALLBACK_SECRET: &str = "cbsec_test";

// =============================================================================
// Mock Clock
// =============================================================================

/// Settable clock; tests move time instead of sleeping.
pub struct MockClock {
    now: Mutex<OffsetDateTime>,
}

impl MockClock {
    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// Mock Gateway
// =============================================================================

/// Gateway double: signs/verifies with the test secret, hands out a fixed
/// token, and records refund calls. `fail_refunds` scripts refund failure.
pub struct MockGateway {
    pub fail_refunds: AtomicBool,
    pub refund_calls: Mutex<Vec<(String, Decimal)>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            fail_refunds: AtomicBool::new(false),
            refund_calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_token(
        &self,
        _checkout: &Checkout,
        _buyer: &BuyerInfo,
    ) -> BillingResult<PaymentToken> {
        Ok(PaymentToken {
            token: "tok_test".to_string(),
            iframe_url: None,
        })
    }

    fn verify_callback(&self, payload: &[u8], signature: &str) -> bool {
        sign_callback(CALLBACK_SECRET, payload) == signature
    }

    fn parse_callback(&self, payload: &[u8]) -> BillingResult<ParsedCallback> {
        Ok(serde_json::from_slice(payload)?)
    }

    async fn refund(
        &self,
        merchant_order_id: &str,
        amount: Decimal,
    ) -> BillingResult<RefundReceipt> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(BillingError::RefundFailed("gateway rejected".to_string()));
        }
        self.refund_calls
            .lock()
            .unwrap()
            .push((merchant_order_id.to_string(), amount));
        Ok(RefundReceipt {
            reference: format!("re_{}", merchant_order_id),
        })
    }
}

/// Build a signed callback body the way the gateway would send it.
pub fn signed_callback(body: serde_json::Value) -> (Vec<u8>, String) {
    let payload = serde_json::to_vec(&body).unwrap();
    let signature = sign_callback(CALLBACK_SECRET, &payload);
    (payload, signature)
}

pub fn success_callback(merchant_order_id: &str, amount: Decimal) -> (Vec<u8>, String) {
    signed_callback(serde_json::json!({
        "merchant_order_id": merchant_order_id,
        "success": true,
        "amount": amount,
        "currency": "USD",
        "reference": format!("txn_{}", merchant_order_id),
        "failure_reason": null,
    }))
}

pub fn failure_callback(merchant_order_id: &str, reason: &str) -> (Vec<u8>, String) {
    signed_callback(serde_json::json!({
        "merchant_order_id": merchant_order_id,
        "success": false,
        "amount": "0",
        "currency": "USD",
        "reference": format!("txn_{}", merchant_order_id),
        "failure_reason": reason,
    }))
}

// =============================================================================
// Recording Sink
// =============================================================================

#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<(TenantId, String)>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, tenant_id: TenantId, event_kind: &str, _payload: serde_json::Value) {
        self.sent
            .lock()
            .unwrap()
            .push((tenant_id, event_kind.to_string()));
    }
}

impl RecordingSink {
    pub fn count_of(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| k == kind)
            .count()
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Default)]
struct State {
    tenants: HashMap<TenantId, Tenant>,
    plans: HashMap<Uuid, Plan>,
    prices: HashMap<Uuid, PlanPrice>,
    addons: HashMap<Uuid, Addon>,
    subscriptions: HashMap<Uuid, Subscription>,
    checkouts: HashMap<Uuid, Checkout>,
    payments: HashMap<Uuid, Payment>,
    tenant_addons: HashMap<Uuid, TenantAddon>,
    usages: HashMap<Uuid, TenantUsage>,
    ledger: HashSet<(Uuid, String, Date)>,
    events: Vec<NewBillingEvent>,
}

/// In-memory store with the same guarded-transition semantics as the
/// Postgres implementation.
pub struct InMemoryStore {
    clock: Arc<MockClock>,
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<MockClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    // ---- seeding -----------------------------------------------------------

    pub fn seed_tenant(&self) -> TenantId {
        let tenant = Tenant {
            id: TenantId::new(),
            name: "Acme Corp".to_string(),
            billing_email: "billing@acme.example".to_string(),
            currency: "USD".to_string(),
            created_at: self.clock.now(),
        };
        let id = tenant.id;
        self.with(|s| s.tenants.insert(id, tenant));
        id
    }

    pub fn seed_plan(
        &self,
        grace_period_days: i32,
        upgrade_behavior: ProrationBehavior,
        downgrade_behavior: ProrationBehavior,
    ) -> Uuid {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "Pro".to_string(),
            grace_period_days,
            upgrade_behavior,
            downgrade_behavior,
            is_archived: false,
            created_at: self.clock.now(),
        };
        let id = plan.id;
        self.with(|s| s.plans.insert(id, plan));
        id
    }

    pub fn archive_plan(&self, plan_id: Uuid) {
        self.with(|s| {
            if let Some(plan) = s.plans.get_mut(&plan_id) {
                plan.is_archived = true;
            }
        });
    }

    pub fn seed_price(
        &self,
        plan_id: Uuid,
        interval: BillingInterval,
        interval_count: i32,
        price: Decimal,
        trial_days: i32,
    ) -> Uuid {
        let price = PlanPrice {
            id: Uuid::new_v4(),
            plan_id,
            interval,
            interval_count,
            price,
            currency: "USD".to_string(),
            trial_days,
            created_at: self.clock.now(),
        };
        let id = price.id;
        self.with(|s| s.prices.insert(id, price));
        id
    }

    pub fn seed_price_in_currency(
        &self,
        plan_id: Uuid,
        price: Decimal,
        currency: &str,
    ) -> Uuid {
        let price = PlanPrice {
            id: Uuid::new_v4(),
            plan_id,
            interval: BillingInterval::Month,
            interval_count: 1,
            price,
            currency: currency.to_string(),
            trial_days: 0,
            created_at: self.clock.now(),
        };
        let id = price.id;
        self.with(|s| s.prices.insert(id, price));
        id
    }

    pub fn seed_addon(
        &self,
        price: Decimal,
        interval: BillingInterval,
        interval_count: i32,
    ) -> Uuid {
        let addon = Addon {
            id: Uuid::new_v4(),
            name: "Extra Seats".to_string(),
            price,
            currency: "USD".to_string(),
            interval,
            interval_count,
            created_at: self.clock.now(),
        };
        let id = addon.id;
        self.with(|s| s.addons.insert(id, addon));
        id
    }

    // ---- inspection --------------------------------------------------------

    pub fn subscription_now(&self, id: Uuid) -> Subscription {
        self.with(|s| s.subscriptions.get(&id).cloned().unwrap())
    }

    pub fn checkout_now(&self, id: Uuid) -> Checkout {
        self.with(|s| s.checkouts.get(&id).cloned().unwrap())
    }

    pub fn payment_count(&self) -> usize {
        self.with(|s| s.payments.len())
    }

    pub fn event_count(&self, kind: &str) -> usize {
        self.with(|s| s.events.iter().filter(|e| e.kind == kind).count())
    }

    pub fn ledger_len(&self) -> usize {
        self.with(|s| s.ledger.len())
    }
}

#[async_trait]
impl TenantStore for InMemoryStore {
    async fn tenant(&self, id: TenantId) -> BillingResult<Option<Tenant>> {
        Ok(self.with(|s| s.tenants.get(&id).cloned()))
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.with(|s| s.plans.get(&id).cloned()))
    }

    async fn plan_price(&self, id: Uuid) -> BillingResult<Option<PlanPrice>> {
        Ok(self.with(|s| s.prices.get(&id).cloned()))
    }

    async fn addon(&self, id: Uuid) -> BillingResult<Option<Addon>> {
        Ok(self.with(|s| s.addons.get(&id).cloned()))
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.with(|s| s.subscriptions.get(&id).cloned()))
    }

    async fn current_subscription_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.with(|s| {
            s.subscriptions
                .values()
                .find(|sub| sub.tenant_id == tenant_id && sub.superseded_at.is_none())
                .cloned()
        }))
    }

    async fn create_current_subscription(
        &self,
        new: NewSubscription,
    ) -> BillingResult<Subscription> {
        Ok(self.with(|s| {
            for sub in s.subscriptions.values_mut() {
                if sub.tenant_id == new.tenant_id && sub.superseded_at.is_none() {
                    sub.superseded_at = Some(new.starts_at);
                    sub.updated_at = new.starts_at;
                }
            }
            let sub = Subscription {
                id: Uuid::new_v4(),
                tenant_id: new.tenant_id,
                plan_price_id: new.plan_price_id,
                next_plan_price_id: None,
                starts_at: new.starts_at,
                ends_at: new.ends_at,
                trial_ends_at: new.trial_ends_at,
                canceled_at: None,
                grace_period_ends_at: new.grace_period_ends_at,
                custom_price: None,
                custom_currency: None,
                status_override: None,
                superseded_at: None,
                created_at: new.starts_at,
                updated_at: new.starts_at,
            };
            s.subscriptions.insert(sub.id, sub.clone());
            sub
        }))
    }

    async fn swap_plan(&self, swap: PlanSwap) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(sub) = s.subscriptions.get_mut(&swap.subscription_id) else {
                return false;
            };
            if sub.superseded_at.is_some() {
                return false;
            }
            if let Some(expected) = swap.expected_next {
                if sub.next_plan_price_id != Some(expected) {
                    return false;
                }
            }
            sub.plan_price_id = swap.new_plan_price_id;
            sub.next_plan_price_id = None;
            sub.ends_at = swap.new_ends_at;
            sub.grace_period_ends_at = swap.new_grace_ends_at;
            true
        }))
    }

    async fn set_next_plan_price(
        &self,
        subscription_id: Uuid,
        next: Option<Uuid>,
    ) -> BillingResult<Option<Uuid>> {
        self.with(|s| {
            let Some(sub) = s.subscriptions.get_mut(&subscription_id) else {
                return Err(BillingError::SubscriptionNotFound);
            };
            if sub.superseded_at.is_some() {
                return Err(BillingError::SubscriptionNotFound);
            }
            let previous = sub.next_plan_price_id;
            sub.next_plan_price_id = next;
            Ok(previous)
        })
    }

    async fn renew_subscription(&self, renewal: SubscriptionRenewal) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(sub) = s.subscriptions.get_mut(&renewal.subscription_id) else {
                return false;
            };
            if sub.superseded_at.is_some() {
                return false;
            }
            sub.ends_at = renewal.new_ends_at;
            sub.grace_period_ends_at = renewal.new_grace_ends_at;
            sub.canceled_at = None;
            true
        }))
    }

    async fn set_cancellation(
        &self,
        subscription_id: Uuid,
        canceled_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        self.with(|s| {
            if let Some(sub) = s.subscriptions.get_mut(&subscription_id) {
                if sub.superseded_at.is_none() {
                    sub.canceled_at = canceled_at;
                }
            }
        });
        Ok(())
    }

    async fn due_scheduled_changes(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        Ok(self.with(|s| {
            s.subscriptions
                .values()
                .filter(|sub| {
                    sub.superseded_at.is_none()
                        && sub.next_plan_price_id.is_some()
                        && sub.ends_at.is_some_and(|end| end <= now)
                })
                .cloned()
                .collect()
        }))
    }

    async fn subscriptions_ending_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self.with(|s| {
            s.subscriptions
                .values()
                .filter(|sub| {
                    sub.superseded_at.is_none()
                        && sub.ends_at.is_some_and(|end| end >= from && end < to)
                })
                .cloned()
                .collect()
        }))
    }

    async fn trials_ending_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(self.with(|s| {
            s.subscriptions
                .values()
                .filter(|sub| {
                    sub.superseded_at.is_none()
                        && sub.trial_ends_at.is_some_and(|end| end >= from && end < to)
                })
                .cloned()
                .collect()
        }))
    }
}

#[async_trait]
impl CheckoutStore for InMemoryStore {
    async fn create_checkout(&self, new: NewCheckout) -> BillingResult<Checkout> {
        let now = self.clock.now();
        Ok(self.with(|s| {
            let checkout = Checkout {
                id: Uuid::new_v4(),
                tenant_id: new.tenant_id,
                merchant_order_id: new.merchant_order_id,
                kind: new.kind,
                target: sqlx::types::Json(new.target),
                amount: new.amount,
                proration_credit: new.proration_credit,
                final_amount: new.final_amount,
                currency: new.currency,
                status: CheckoutStatus::Pending,
                failure_reason: None,
                gateway_reference: None,
                expires_at: new.expires_at,
                completed_at: None,
                created_at: now,
                updated_at: now,
            };
            s.checkouts.insert(checkout.id, checkout.clone());
            checkout
        }))
    }

    async fn checkout(&self, id: Uuid) -> BillingResult<Option<Checkout>> {
        Ok(self.with(|s| s.checkouts.get(&id).cloned()))
    }

    async fn checkout_by_merchant_order(
        &self,
        merchant_order_id: &str,
    ) -> BillingResult<Option<Checkout>> {
        Ok(self.with(|s| {
            s.checkouts
                .values()
                .find(|c| c.merchant_order_id == merchant_order_id)
                .cloned()
        }))
    }

    async fn claim_checkout(&self, merchant_order_id: &str) -> BillingResult<Option<Checkout>> {
        Ok(self.with(|s| {
            let checkout = s
                .checkouts
                .values_mut()
                .find(|c| c.merchant_order_id == merchant_order_id)?;
            if checkout.status != CheckoutStatus::Pending {
                return None;
            }
            checkout.status = CheckoutStatus::Processing;
            Some(checkout.clone())
        }))
    }

    async fn release_checkout_claim(&self, checkout_id: Uuid) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(checkout) = s.checkouts.get_mut(&checkout_id) else {
                return false;
            };
            if checkout.status != CheckoutStatus::Processing {
                return false;
            }
            checkout.status = CheckoutStatus::Pending;
            true
        }))
    }

    async fn complete_checkout(&self, completion: CheckoutCompletion) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(checkout) = s.checkouts.get_mut(&completion.checkout_id) else {
                return false;
            };
            if checkout.status != CheckoutStatus::Processing {
                return false;
            }
            checkout.status = CheckoutStatus::Completed;
            checkout.gateway_reference = Some(completion.gateway_reference.clone());
            checkout.completed_at = Some(completion.completed_at);
            let payment = Payment {
                id: Uuid::new_v4(),
                tenant_id: checkout.tenant_id,
                checkout_id: checkout.id,
                amount: checkout.final_amount,
                currency: checkout.currency.clone(),
                gateway_reference: completion.gateway_reference,
                refunded_amount: Decimal::ZERO,
                refunded_at: None,
                created_at: completion.completed_at,
            };
            s.payments.insert(payment.id, payment);
            true
        }))
    }

    async fn fail_checkout(&self, checkout_id: Uuid, reason: &str) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(checkout) = s.checkouts.get_mut(&checkout_id) else {
                return false;
            };
            if checkout.status != CheckoutStatus::Processing {
                return false;
            }
            checkout.status = CheckoutStatus::Failed;
            checkout.failure_reason = Some(reason.to_string());
            true
        }))
    }

    async fn cancel_checkout(&self, checkout_id: Uuid) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(checkout) = s.checkouts.get_mut(&checkout_id) else {
                return false;
            };
            match checkout.status {
                CheckoutStatus::Pending | CheckoutStatus::Processing => {
                    checkout.status = CheckoutStatus::Cancelled;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn expire_due_checkouts(&self, now: OffsetDateTime) -> BillingResult<Vec<Checkout>> {
        Ok(self.with(|s| {
            let mut expired = Vec::new();
            for checkout in s.checkouts.values_mut() {
                if checkout.status == CheckoutStatus::Pending && checkout.expires_at <= now {
                    checkout.status = CheckoutStatus::Expired;
                    expired.push(checkout.clone());
                }
            }
            expired
        }))
    }

    async fn payment_for_checkout(&self, checkout_id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.with(|s| {
            s.payments
                .values()
                .find(|p| p.checkout_id == checkout_id)
                .cloned()
        }))
    }

    async fn mark_payment_refunded(&self, refund: PaymentRefund) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(payment) = s.payments.get_mut(&refund.payment_id) else {
                return false;
            };
            if payment.refunded_amount + refund.amount > payment.amount {
                return false;
            }
            payment.refunded_amount += refund.amount;
            payment.refunded_at = Some(refund.refunded_at);
            true
        }))
    }
}

#[async_trait]
impl AddonStore for InMemoryStore {
    async fn tenant_addon(&self, id: Uuid) -> BillingResult<Option<TenantAddon>> {
        Ok(self.with(|s| s.tenant_addons.get(&id).cloned()))
    }

    async fn tenant_addon_for(
        &self,
        tenant_id: TenantId,
        addon_id: Uuid,
    ) -> BillingResult<Option<TenantAddon>> {
        Ok(self.with(|s| {
            s.tenant_addons
                .values()
                .find(|r| r.tenant_id == tenant_id && r.addon_id == addon_id)
                .cloned()
        }))
    }

    async fn upsert_addon_purchase(
        &self,
        purchase: AddonPurchaseRecord,
    ) -> BillingResult<TenantAddon> {
        let now = self.clock.now();
        Ok(self.with(|s| {
            let existing = s
                .tenant_addons
                .values_mut()
                .find(|r| r.tenant_id == purchase.tenant_id && r.addon_id == purchase.addon_id);
            if let Some(row) = existing {
                if row.is_active {
                    row.quantity += purchase.quantity;
                } else {
                    row.quantity = purchase.quantity;
                    row.started_at = purchase.started_at;
                    row.expires_at = purchase.expires_at;
                    row.is_active = true;
                }
                row.updated_at = now;
                return row.clone();
            }
            let row = TenantAddon {
                id: Uuid::new_v4(),
                tenant_id: purchase.tenant_id,
                addon_id: purchase.addon_id,
                quantity: purchase.quantity,
                custom_price: None,
                started_at: purchase.started_at,
                expires_at: purchase.expires_at,
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            s.tenant_addons.insert(row.id, row.clone());
            row
        }))
    }

    async fn renew_tenant_addon(&self, renewal: AddonRenewalRecord) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(row) = s.tenant_addons.get_mut(&renewal.tenant_addon_id) else {
                return false;
            };
            row.expires_at = renewal.new_expires_at;
            row.is_active = true;
            true
        }))
    }

    async fn deactivate_due_addons(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantAddon>> {
        Ok(self.with(|s| {
            let mut deactivated = Vec::new();
            for row in s.tenant_addons.values_mut() {
                if row.is_active && row.expires_at <= now {
                    row.is_active = false;
                    deactivated.push(row.clone());
                }
            }
            deactivated
        }))
    }

    async fn addons_expiring_within(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> BillingResult<Vec<TenantAddon>> {
        Ok(self.with(|s| {
            s.tenant_addons
                .values()
                .filter(|r| r.is_active && r.expires_at >= from && r.expires_at < to)
                .cloned()
                .collect()
        }))
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn record_usage(&self, update: UsageDelta) -> BillingResult<TenantUsage> {
        let now = self.clock.now();
        Ok(self.with(|s| {
            let existing = s
                .usages
                .values_mut()
                .find(|u| u.tenant_id == update.tenant_id && u.feature == update.feature);
            if let Some(row) = existing {
                row.used += update.delta;
                row.updated_at = now;
                return row.clone();
            }
            let row = TenantUsage {
                id: Uuid::new_v4(),
                tenant_id: update.tenant_id,
                feature: update.feature,
                used: update.delta,
                cycle_ends_at: update.default_cycle_ends_at,
                updated_at: now,
            };
            s.usages.insert(row.id, row.clone());
            row
        }))
    }

    async fn usage_due_for_reset(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantUsage>> {
        Ok(self.with(|s| {
            s.usages
                .values()
                .filter(|u| u.cycle_ends_at <= now)
                .cloned()
                .collect()
        }))
    }

    async fn reset_usage_cycle(&self, reset: UsageCycleReset) -> BillingResult<bool> {
        Ok(self.with(|s| {
            let Some(row) = s.usages.get_mut(&reset.usage_id) else {
                return false;
            };
            if row.cycle_ends_at != reset.expected_cycle_ends_at {
                return false;
            }
            row.used = 0;
            row.cycle_ends_at = reset.new_cycle_ends_at;
            true
        }))
    }
}

#[async_trait]
impl EffectLedger for InMemoryStore {
    async fn record_effect_once(&self, effect: EffectKey) -> BillingResult<bool> {
        Ok(self.with(|s| s.ledger.insert((effect.subject_id, effect.kind, effect.window))))
    }

    async fn prune_effects_before(&self, cutoff: Date) -> BillingResult<u64> {
        Ok(self.with(|s| {
            let before = s.ledger.len();
            s.ledger.retain(|(_, _, window)| *window >= cutoff);
            (before - s.ledger.len()) as u64
        }))
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append_event(&self, event: NewBillingEvent) -> BillingResult<()> {
        self.with(|s| s.events.push(event));
        Ok(())
    }

    async fn anonymize_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        Ok(self.with(|s| {
            let mut count = 0;
            for event in &mut s.events {
                if event.created_at < cutoff && event.payload != serde_json::json!({}) {
                    event.payload = serde_json::json!({});
                    count += 1;
                }
            }
            count
        }))
    }
}

// =============================================================================
// Test Environment
// =============================================================================

/// Fully wired billing service over the in-memory doubles.
pub struct TestEnv {
    pub clock: Arc<MockClock>,
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<MockGateway>,
    pub sink: Arc<RecordingSink>,
    pub billing: BillingService,
}

impl TestEnv {
    pub fn at(now: OffsetDateTime) -> Self {
        let clock = Arc::new(MockClock::at(now));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let gateway = Arc::new(MockGateway::new());
        let sink = Arc::new(RecordingSink::default());
        let config = BillingConfig::with_gateway(GatewayConfig {
            base_url: "http://gateway.invalid".to_string(),
            api_key: "key_test".to_string(),
            callback_secret: CALLBACK_SECRET.to_string(),
            timeout_secs: 2,
        });
        let billing = BillingService::new(
            store.clone() as Arc<dyn Store>,
            clock.clone() as Arc<dyn Clock>,
            gateway.clone() as Arc<dyn PaymentGateway>,
            sink.clone() as Arc<dyn NotificationSink>,
            config,
        );
        Self {
            clock,
            store,
            gateway,
            sink,
            billing,
        }
    }
}
