//! Shared types for the tenantry workspace

pub mod clock;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use types::{
    Addon, BillingInterval, Checkout, CheckoutKind, CheckoutStatus, CheckoutTarget, Payment, Plan,
    PlanPrice, ProrationBehavior, Subscription, SubscriptionStatus, Tenant, TenantAddon, TenantId,
    TenantUsage,
};
