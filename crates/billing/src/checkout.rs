//! Checkout / payment orchestration
//!
//! A checkout is the only way money enters the system: initiation computes
//! the amount (proration quote for plan changes, effective price for
//! renewals, flat price for addons), the gateway collects it, and the
//! callback handler provisions the purchased thing. The atomic pending-only
//! claim inside the store is the replay/concurrency guard: at most one
//! callback ever holds a checkout, and callbacks for claimed or terminal
//! checkouts are silent no-ops.

use std::sync::Arc;

use rust_decimal::Decimal;
use tenantry_shared::{
    Checkout, CheckoutKind, CheckoutStatus, CheckoutTarget, Clock, PlanPrice, Subscription,
    TenantId,
};
use time::Duration;
use uuid::Uuid;

use crate::addons::AddonService;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventKind, BillingEventLogger};
use crate::gateway::{BuyerInfo, PaymentGateway, PaymentToken};
use crate::notify::NotificationSink;
use crate::plan_change::PlanChangeService;
use crate::proration;
use crate::store::{
    AddonStore, CatalogStore, CheckoutCompletion, CheckoutStore, NewCheckout, PaymentRefund, Store,
    SubscriptionStore, TenantStore,
};
use crate::subscriptions::SubscriptionService;

/// Outcome of processing one gateway callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Payment confirmed; purchase provisioned, payment recorded
    Completed { checkout_id: Uuid },
    /// Gateway reported failure; checkout marked failed, nothing provisioned
    Failed { checkout_id: Uuid, reason: String },
    /// Replay or unknown order id; nothing happened
    Ignored,
}

/// Checkout orchestration service
#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn PaymentGateway>,
    events: BillingEventLogger,
    notify: Arc<dyn NotificationSink>,
    subscriptions: SubscriptionService,
    plan_change: PlanChangeService,
    addons: AddonService,
    checkout_ttl_minutes: i64,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        events: BillingEventLogger,
        notify: Arc<dyn NotificationSink>,
        subscriptions: SubscriptionService,
        plan_change: PlanChangeService,
        addons: AddonService,
        checkout_ttl_minutes: i64,
    ) -> Self {
        Self {
            store,
            clock,
            gateway,
            events,
            notify,
            subscriptions,
            plan_change,
            addons,
            checkout_ttl_minutes,
        }
    }

    async fn load_owned(&self, tenant_id: TenantId, checkout_id: Uuid) -> BillingResult<Checkout> {
        let checkout = self
            .store
            .checkout(checkout_id)
            .await?
            .ok_or(BillingError::NotFound("Checkout"))?;
        if checkout.tenant_id != tenant_id {
            return Err(BillingError::Validation(
                "Checkout does not belong to this tenant".to_string(),
            ));
        }
        Ok(checkout)
    }

    async fn owned_current_subscription(
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
        if !sub.is_current() {
            return Err(BillingError::InvalidState(
                "Subscription has been superseded".to_string(),
            ));
        }
        Ok(sub)
    }

    /// Price the target and create a pending checkout session.
    pub async fn initiate(
        &self,
        tenant_id: TenantId,
        target: CheckoutTarget,
    ) -> BillingResult<Checkout> {
        self.store
            .tenant(tenant_id)
            .await?
            .ok_or(BillingError::NotFound("Tenant"))?;
        let now = self.clock.now();

        let (kind, amount, credit, currency) = match &target {
            CheckoutTarget::NewSubscription { plan_price_id } => {
                let price = self
                    .store
                    .plan_price(*plan_price_id)
                    .await?
                    .ok_or(BillingError::NotFound("Plan price"))?;
                let plan = self
                    .store
                    .plan(price.plan_id)
                    .await?
                    .ok_or(BillingError::NotFound("Plan"))?;
                if plan.is_archived {
                    return Err(BillingError::Validation(
                        "Plan is archived and cannot be subscribed to".to_string(),
                    ));
                }
                (
                    CheckoutKind::New,
                    price.price,
                    Decimal::ZERO,
                    price.currency,
                )
            }
            CheckoutTarget::Renewal { subscription_id } => {
                let sub = self
                    .owned_current_subscription(tenant_id, *subscription_id)
                    .await?;
                if sub.ends_at.is_none() {
                    return Err(BillingError::Validation(
                        "Open-ended subscription has no period to renew".to_string(),
                    ));
                }
                let price = self
                    .store
                    .plan_price(sub.plan_price_id)
                    .await?
                    .ok_or(BillingError::NotFound("Plan price"))?;
                (
                    CheckoutKind::Renew,
                    sub.effective_price(&price),
                    Decimal::ZERO,
                    sub.effective_currency(&price).to_string(),
                )
            }
            CheckoutTarget::PlanChange {
                subscription_id,
                new_plan_price_id,
            } => {
                let sub = self
                    .owned_current_subscription(tenant_id, *subscription_id)
                    .await?;
                let current_price = self
                    .store
                    .plan_price(sub.plan_price_id)
                    .await?
                    .ok_or(BillingError::NotFound("Plan price"))?;
                let quote = self
                    .price_immediate_upgrade(&sub, &current_price, *new_plan_price_id)
                    .await?;
                (
                    CheckoutKind::Upgrade,
                    quote.new_amount,
                    quote.credit,
                    sub.effective_currency(&current_price).to_string(),
                )
            }
            CheckoutTarget::AddonPurchase { addon_id, quantity } => {
                if *quantity < 1 {
                    return Err(BillingError::Validation(
                        "Addon quantity must be at least 1".to_string(),
                    ));
                }
                let addon = self
                    .store
                    .addon(*addon_id)
                    .await?
                    .ok_or(BillingError::NotFound("Addon"))?;
                (
                    CheckoutKind::Addon,
                    addon.price * Decimal::from(*quantity),
                    Decimal::ZERO,
                    addon.currency,
                )
            }
            CheckoutTarget::AddonRenewal { tenant_addon_id } => {
                let row = self
                    .store
                    .tenant_addon(*tenant_addon_id)
                    .await?
                    .ok_or(BillingError::NotFound("Tenant addon"))?;
                if row.tenant_id != tenant_id {
                    return Err(BillingError::Validation(
                        "Addon does not belong to this tenant".to_string(),
                    ));
                }
                let addon = self
                    .store
                    .addon(row.addon_id)
                    .await?
                    .ok_or(BillingError::NotFound("Addon"))?;
                (
                    CheckoutKind::AddonRenew,
                    row.custom_price.unwrap_or(addon.price),
                    Decimal::ZERO,
                    addon.currency,
                )
            }
        };

        let final_amount = (amount - credit).max(Decimal::ZERO);
        let checkout = self
            .store
            .create_checkout(NewCheckout {
                tenant_id,
                merchant_order_id: format!("mo_{}", Uuid::new_v4().simple()),
                kind,
                target,
                amount,
                proration_credit: credit,
                final_amount,
                currency,
                expires_at: now + Duration::minutes(self.checkout_ttl_minutes),
            })
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            checkout_id = %checkout.id,
            merchant_order_id = %checkout.merchant_order_id,
            kind = %checkout.kind,
            final_amount = %checkout.final_amount,
            "Checkout initiated"
        );
        Ok(checkout)
    }

    /// Validate that the plan change charges at initiation and quote it.
    /// Only immediate upgrades go through a checkout; everything else is
    /// handled by the plan change engine without collecting money.
    async fn price_immediate_upgrade(
        &self,
        sub: &Subscription,
        current_price: &PlanPrice,
        new_plan_price_id: Uuid,
    ) -> BillingResult<proration::ProrationQuote> {
        if new_plan_price_id == sub.plan_price_id {
            return Err(BillingError::Validation(
                "Subscription is already on this plan price".to_string(),
            ));
        }
        let current_plan = self
            .store
            .plan(current_price.plan_id)
            .await?
            .ok_or(BillingError::NotFound("Plan"))?;
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
        if new_price.currency != sub.effective_currency(current_price) {
            return Err(BillingError::Validation(
                "Target price currency does not match the subscription".to_string(),
            ));
        }
        let is_upgrade = new_price.price > sub.effective_price(current_price);
        if !is_upgrade {
            return Err(BillingError::Validation(
                "Downgrades are not charged through a checkout".to_string(),
            ));
        }
        if current_plan.upgrade_behavior != tenantry_shared::ProrationBehavior::Immediate {
            return Err(BillingError::Validation(
                "This plan defers upgrades to the period end; no charge is due now".to_string(),
            ));
        }
        proration::calculate(sub, current_price, &new_price, self.clock.now())
    }

    /// Ask the gateway for a payment token for a pending checkout.
    pub async fn payment_token(
        &self,
        tenant_id: TenantId,
        checkout_id: Uuid,
        buyer: &BuyerInfo,
    ) -> BillingResult<PaymentToken> {
        let checkout = self.load_owned(tenant_id, checkout_id).await?;
        if checkout.status != CheckoutStatus::Pending {
            return Err(BillingError::InvalidState(format!(
                "Checkout is {}, not pending",
                checkout.status
            )));
        }
        if checkout.expires_at <= self.clock.now() {
            return Err(BillingError::InvalidState(
                "Checkout session has expired".to_string(),
            ));
        }
        self.gateway.create_token(&checkout, buyer).await
    }

    /// Handle a gateway callback.
    ///
    /// Verification failure is an error; an unclaimable checkout (unknown
    /// order id, claimed by a concurrent callback, terminal state) is
    /// `Ignored` — gateways retry webhooks, so replays are expected, not
    /// exceptional. Provisioning runs before the terminal transition: if it
    /// fails after a successful payment the claim is released so a later
    /// gateway retry can claim again. A crash between claim and release
    /// leaves the checkout `processing`; the invariant sweep surfaces those
    /// for manual reconciliation.
    pub async fn process_callback(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<CallbackOutcome> {
        if !self.gateway.verify_callback(payload, signature) {
            return Err(BillingError::CallbackSignatureInvalid);
        }
        let parsed = self.gateway.parse_callback(payload)?;

        let Some(checkout) = self.store.claim_checkout(&parsed.merchant_order_id).await? else {
            tracing::info!(
                merchant_order_id = %parsed.merchant_order_id,
                "Callback for unknown, already claimed, or terminal checkout ignored"
            );
            return Ok(CallbackOutcome::Ignored);
        };

        if !parsed.success {
            let reason = parsed
                .failure_reason
                .unwrap_or_else(|| "Payment was declined".to_string());
            self.store.fail_checkout(checkout.id, &reason).await?;
            tracing::info!(
                tenant_id = %checkout.tenant_id,
                checkout_id = %checkout.id,
                reason = %reason,
                "Checkout failed"
            );
            self.events
                .log(
                    checkout.tenant_id,
                    BillingEventKind::CheckoutFailed,
                    Some(checkout.id),
                    serde_json::json!({ "reason": reason }),
                )
                .await;
            self.notify
                .notify(
                    checkout.tenant_id,
                    BillingEventKind::CheckoutFailed.as_str(),
                    serde_json::json!({ "checkout_id": checkout.id, "reason": reason }),
                )
                .await;
            return Ok(CallbackOutcome::Failed {
                checkout_id: checkout.id,
                reason,
            });
        }

        if let Err(e) = self.provision(&checkout).await {
            // Best effort; a failed release leaves the row processing and
            // the invariant sweep picks it up.
            let released = self
                .store
                .release_checkout_claim(checkout.id)
                .await
                .unwrap_or(false);
            tracing::error!(
                tenant_id = %checkout.tenant_id,
                checkout_id = %checkout.id,
                merchant_order_id = %checkout.merchant_order_id,
                error = %e,
                released = released,
                "Payment captured but provisioning failed; claim released for gateway retry"
            );
            return Err(e);
        }

        let completed = self
            .store
            .complete_checkout(CheckoutCompletion {
                checkout_id: checkout.id,
                gateway_reference: parsed.reference.clone(),
                completed_at: self.clock.now(),
            })
            .await?;
        if !completed {
            tracing::warn!(
                checkout_id = %checkout.id,
                "Checkout left processing state before completion; treating as replay"
            );
            return Ok(CallbackOutcome::Ignored);
        }

        tracing::info!(
            tenant_id = %checkout.tenant_id,
            checkout_id = %checkout.id,
            amount = %checkout.final_amount,
            gateway_reference = %parsed.reference,
            "Checkout completed"
        );
        self.events
            .log(
                checkout.tenant_id,
                BillingEventKind::CheckoutCompleted,
                Some(checkout.id),
                serde_json::json!({
                    "kind": checkout.kind,
                    "final_amount": checkout.final_amount,
                    "gateway_reference": parsed.reference,
                }),
            )
            .await;
        self.notify
            .notify(
                checkout.tenant_id,
                BillingEventKind::CheckoutCompleted.as_str(),
                serde_json::json!({ "checkout_id": checkout.id }),
            )
            .await;
        Ok(CallbackOutcome::Completed {
            checkout_id: checkout.id,
        })
    }

    /// Dispatch the paid purchase to the owning service.
    async fn provision(&self, checkout: &Checkout) -> BillingResult<()> {
        match &checkout.target.0 {
            CheckoutTarget::NewSubscription { plan_price_id } => {
                self.subscriptions
                    .activate_paid(checkout.tenant_id, *plan_price_id)
                    .await?;
            }
            CheckoutTarget::Renewal { subscription_id } => {
                self.subscriptions.renew(*subscription_id).await?;
            }
            CheckoutTarget::PlanChange {
                subscription_id,
                new_plan_price_id,
            } => {
                self.plan_change
                    .complete_paid_change(*subscription_id, *new_plan_price_id)
                    .await?;
            }
            CheckoutTarget::AddonPurchase { addon_id, quantity } => {
                self.addons
                    .apply_purchase(checkout.tenant_id, *addon_id, *quantity)
                    .await?;
            }
            CheckoutTarget::AddonRenewal { tenant_addon_id } => {
                self.addons
                    .renew(checkout.tenant_id, *tenant_addon_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Cancel a checkout the buyer abandoned. Only non-terminal sessions
    /// can be cancelled.
    pub async fn cancel(&self, tenant_id: TenantId, checkout_id: Uuid) -> BillingResult<()> {
        let checkout = self.load_owned(tenant_id, checkout_id).await?;
        let cancelled = self.store.cancel_checkout(checkout_id).await?;
        if !cancelled {
            return Err(BillingError::InvalidState(format!(
                "Checkout is already {}",
                checkout.status
            )));
        }
        tracing::info!(
            tenant_id = %tenant_id,
            checkout_id = %checkout_id,
            "Checkout cancelled"
        );
        self.events
            .log(
                tenant_id,
                BillingEventKind::CheckoutCancelled,
                Some(checkout_id),
                serde_json::json!({}),
            )
            .await;
        Ok(())
    }

    /// Refund (part of) a completed checkout's payment. The gateway call
    /// happens first; its failure mutates nothing.
    pub async fn refund_checkout(
        &self,
        tenant_id: TenantId,
        checkout_id: Uuid,
        amount: Decimal,
    ) -> BillingResult<()> {
        let checkout = self.load_owned(tenant_id, checkout_id).await?;
        if checkout.status != CheckoutStatus::Completed {
            return Err(BillingError::InvalidState(format!(
                "Only completed checkouts can be refunded; this one is {}",
                checkout.status
            )));
        }
        let payment = self
            .store
            .payment_for_checkout(checkout_id)
            .await?
            .ok_or(BillingError::NotFound("Payment"))?;
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation(
                "Refund amount must be positive".to_string(),
            ));
        }
        if amount > payment.refundable_amount() {
            return Err(BillingError::Validation(format!(
                "Refund amount {} exceeds refundable remainder {}",
                amount,
                payment.refundable_amount()
            )));
        }

        let receipt = self
            .gateway
            .refund(&checkout.merchant_order_id, amount)
            .await?;

        let marked = self
            .store
            .mark_payment_refunded(PaymentRefund {
                payment_id: payment.id,
                amount,
                refunded_at: self.clock.now(),
            })
            .await?;
        if !marked {
            // The gateway accepted the refund but a concurrent refund beat
            // us to the bookkeeping; surface for manual review.
            return Err(BillingError::ConcurrentModification);
        }

        tracing::info!(
            tenant_id = %tenant_id,
            checkout_id = %checkout_id,
            amount = %amount,
            gateway_reference = %receipt.reference,
            "Payment refunded"
        );
        self.events
            .log(
                tenant_id,
                BillingEventKind::PaymentRefunded,
                Some(checkout_id),
                serde_json::json!({
                    "amount": amount,
                    "gateway_reference": receipt.reference,
                }),
            )
            .await;
        Ok(())
    }
}
