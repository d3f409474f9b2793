// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tenantry Billing Core
//!
//! Subscription lifecycle and proration engine for the tenantry platform.
//!
//! ## Features
//!
//! - **Proration**: prorated credit/charge math for mid-period plan changes
//! - **State Resolver**: subscription status derived from timestamps, never
//!   trusted from a stored column
//! - **Plan Changes**: immediate upgrades through checkout, immediate
//!   downgrades, scheduled end-of-period changes
//! - **Lifecycle Sweeps**: idempotent batch jobs for expiry, scheduled
//!   changes, reminders, usage resets, and retention
//! - **Checkout**: payment-gateway orchestration with replay-safe callbacks
//! - **Addons & Usage**: addon terms/quantities and metered usage cycles

pub mod addons;
pub mod checkout;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invariants;
pub mod lifecycle;
pub mod notify;
pub mod plan_change;
pub mod proration;
pub mod status;
pub mod store;
pub mod subscriptions;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use sqlx::PgPool;
use tenantry_shared::{Clock, SystemClock};

// Addons
pub use addons::{AddonService, AddonSweepSummary};

// Checkout
pub use checkout::{CallbackOutcome, CheckoutService};

// Configuration
pub use config::{BillingConfig, GatewayConfig};

// Errors
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEventKind, BillingEventLogger};

// Gateway
pub use gateway::{
    BuyerInfo, HttpGateway, ParsedCallback, PaymentGateway, PaymentToken, RefundReceipt,
};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation};

// Lifecycle
pub use lifecycle::{LifecycleService, RetentionSummary, SweepSummary};

// Notifications
pub use notify::{NotificationSink, TracingSink, WebhookSink};

// Plan changes
pub use plan_change::{ApplyChangesSummary, PlanChangeDecision, PlanChangeService};

// Proration
pub use proration::ProrationQuote;

// Status resolution
pub use status::{effective_status, has_valid_access, resolve_status};

// Store
pub use store::{PgStore, Store};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Usage
pub use usage::{UsageResetSummary, UsageService};

/// Facade owning one instance of every billing service, wired to a shared
/// store, clock, gateway, and notification sink.
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub plan_change: PlanChangeService,
    pub addons: AddonService,
    pub usage: UsageService,
    pub checkout: CheckoutService,
    pub lifecycle: LifecycleService,
    pub config: BillingConfig,
}

impl BillingService {
    /// Wire the services from explicit collaborators; tests inject mocks
    /// through this constructor.
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn PaymentGateway>,
        notify: Arc<dyn NotificationSink>,
        config: BillingConfig,
    ) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());

        let subscriptions = SubscriptionService::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            notify.clone(),
        );
        let plan_change = PlanChangeService::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            notify.clone(),
        );
        let addons = AddonService::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            notify.clone(),
        );
        let usage = UsageService::new(store.clone(), clock.clone());
        let checkout = CheckoutService::new(
            store.clone(),
            clock.clone(),
            gateway,
            events.clone(),
            notify.clone(),
            subscriptions.clone(),
            plan_change.clone(),
            addons.clone(),
            config.checkout_ttl_minutes,
        );
        let lifecycle = LifecycleService::new(
            store,
            clock,
            events,
            notify,
            plan_change.clone(),
            addons.clone(),
            usage.clone(),
            config.reminder_offsets_days.clone(),
            config.ledger_ttl_days,
            config.event_retention_days,
        );

        Self {
            subscriptions,
            plan_change,
            addons,
            usage,
            checkout,
            lifecycle,
            config,
        }
    }

    /// Production wiring: Postgres store, system clock, HTTP gateway, and
    /// the webhook sink when one is configured.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(HttpGateway::new(config.gateway.clone())?);
        let notify: Arc<dyn NotificationSink> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookSink::new(url.clone())),
            None => Arc::new(TracingSink),
        };
        Ok(Self::new(store, clock, gateway, notify, config))
    }
}
