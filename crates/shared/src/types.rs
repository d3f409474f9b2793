//! Core types shared across tenantry crates

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant ID wrapper
///
/// Tenant identity is always passed explicitly through call chains; there is
/// no ambient "current tenant" anywhere in the billing core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Billing Intervals
// =============================================================================

/// Billing interval for a plan price or addon term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl Default for BillingInterval {
    fn default() -> Self {
        Self::Month
    }
}

impl BillingInterval {
    /// Advance a timestamp by `count` units of this interval.
    ///
    /// Day and week are exact; month and year use real calendar lengths and
    /// clamp to the end of the target month (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(self, from: OffsetDateTime, count: i32) -> OffsetDateTime {
        let count = i64::from(count);
        match self {
            Self::Day => from + Duration::days(count),
            Self::Week => from + Duration::days(7 * count),
            Self::Month => add_months(from, count),
            Self::Year => add_months(from, 12 * count),
        }
    }

    /// Whole days covered by one period of `count` units anchored at `anchor`.
    pub fn period_days(self, anchor: OffsetDateTime, count: i32) -> i64 {
        (self.advance(anchor, count) - anchor).whole_days()
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Week => write!(f, "week"),
            Self::Month => write!(f, "month"),
            Self::Year => write!(f, "year"),
        }
    }
}

impl std::str::FromStr for BillingInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(format!("Invalid billing interval: {}", s)),
        }
    }
}

/// Calendar-accurate month addition with end-of-month clamping.
fn add_months(from: OffsetDateTime, months: i64) -> OffsetDateTime {
    let date = from.date();
    let zero_based = i64::from(date.year()) * 12 + i64::from(date.month() as u8) - 1 + months;
    let year = zero_based.div_euclid(12) as i32;
    let month = Month::try_from((zero_based.rem_euclid(12) + 1) as u8).unwrap_or(Month::January);
    let day = date.day().min(time::util::days_in_year_month(year, month));
    // The day is clamped to the target month, so construction cannot fail.
    Date::from_calendar_date(year, month, day)
        .map(|d| from.replace_date(d))
        .unwrap_or(from)
}

// =============================================================================
// Proration Behavior
// =============================================================================

/// How a plan handles mid-period changes, configured per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    /// Swap now; upgrades charge a prorated amount first
    Immediate,
    /// Defer the swap to the current period boundary
    EndOfPeriod,
}

impl Default for ProrationBehavior {
    fn default() -> Self {
        Self::Immediate
    }
}

impl std::fmt::Display for ProrationBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::EndOfPeriod => write!(f, "end_of_period"),
        }
    }
}

impl std::str::FromStr for ProrationBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "end_of_period" => Ok(Self::EndOfPeriod),
            _ => Err(format!("Invalid proration behavior: {}", s)),
        }
    }
}

// =============================================================================
// Subscription Status
// =============================================================================

/// Derived subscription status.
///
/// Never stored as ground truth for automated decisions; resolved from the
/// subscription's timestamp fields plus "now". A persisted copy exists only
/// as the admin `status_override`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    /// Whether this status permits system usage.
    ///
    /// Canceled keeps access until the period ends; past_due keeps access
    /// through the grace window. Only expired blocks.
    pub fn has_access(&self) -> bool {
        match self {
            Self::Trialing | Self::Active | Self::PastDue | Self::Canceled => true,
            Self::Expired => false,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trialing => write!(f, "trialing"),
            Self::Active => write!(f, "active"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

// =============================================================================
// Checkout Status & Kind
// =============================================================================

/// Checkout session status
///
/// `pending → processing → {completed | failed} | expired | cancelled`;
/// terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl Default for CheckoutStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl CheckoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }
}

impl std::fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CheckoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid checkout status: {}", s)),
        }
    }
}

/// What a checkout pays for, as a flat label for events and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckoutKind {
    New,
    Renew,
    Upgrade,
    /// Reserved: downgrades apply without collecting money, so the engine
    /// never creates checkouts of this kind. Historical and back-office
    /// rows may still carry it.
    Downgrade,
    Addon,
    AddonRenew,
}

impl std::fmt::Display for CheckoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Renew => write!(f, "renew"),
            Self::Upgrade => write!(f, "upgrade"),
            Self::Downgrade => write!(f, "downgrade"),
            Self::Addon => write!(f, "addon"),
            Self::AddonRenew => write!(f, "addon_renew"),
        }
    }
}

// =============================================================================
// Checkout Target
// =============================================================================

/// What a checkout pays for, as a closed union.
///
/// Replaces nullable-foreign-key polymorphism so invalid combinations are
/// unrepresentable; persisted as tagged JSON on the checkout row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckoutTarget {
    NewSubscription {
        plan_price_id: Uuid,
    },
    Renewal {
        subscription_id: Uuid,
    },
    PlanChange {
        subscription_id: Uuid,
        new_plan_price_id: Uuid,
    },
    AddonPurchase {
        addon_id: Uuid,
        quantity: i32,
    },
    AddonRenewal {
        tenant_addon_id: Uuid,
    },
}

// =============================================================================
// Catalog Models
// =============================================================================

/// A billing-isolated customer organization
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub billing_email: String,
    pub currency: String,
    pub created_at: OffsetDateTime,
}

/// A sellable plan; prices hang off it as separate immutable rows
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// Days of access retained after `ends_at` while payment is pending
    pub grace_period_days: i32,
    pub upgrade_behavior: ProrationBehavior,
    pub downgrade_behavior: ProrationBehavior,
    pub is_archived: bool,
    pub created_at: OffsetDateTime,
}

/// One price point of a plan. Immutable once referenced by a subscription;
/// price changes create new rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanPrice {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub price: Decimal,
    pub currency: String,
    pub trial_days: i32,
    pub created_at: OffsetDateTime,
}

impl PlanPrice {
    /// End of one billing period starting at `from`.
    pub fn period_end(&self, from: OffsetDateTime) -> OffsetDateTime {
        self.interval.advance(from, self.interval_count)
    }

    /// Whole days in one billing period anchored at `anchor`.
    pub fn period_days(&self, anchor: OffsetDateTime) -> i64 {
        self.interval.period_days(anchor, self.interval_count)
    }
}

/// A purchasable addon with a fixed term
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Addon {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub currency: String,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub created_at: OffsetDateTime,
}

impl Addon {
    /// End of one addon term starting at `from`.
    pub fn term_end(&self, from: OffsetDateTime) -> OffsetDateTime {
        self.interval.advance(from, self.interval_count)
    }
}

// =============================================================================
// Tenant-Owned Models
// =============================================================================

/// A tenant's subscription to a plan price.
///
/// Status is derived from the timestamp fields (see the billing state
/// resolver); `status_override` exists only for admin exceptions. At most
/// one row per tenant has `superseded_at IS NULL`; older rows are history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub plan_price_id: Uuid,
    /// Scheduled change target; at most one outstanding at a time
    pub next_plan_price_id: Option<Uuid>,
    pub starts_at: OffsetDateTime,
    /// None = no fixed end (open-ended/custom deals)
    pub ends_at: Option<OffsetDateTime>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    /// Negotiated override of the plan price
    pub custom_price: Option<Decimal>,
    pub custom_currency: Option<String>,
    /// Admin manual exception; wins over the derived status when set
    pub status_override: Option<SubscriptionStatus>,
    pub superseded_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// Price actually collected per period: the negotiated override when
    /// present, else the plan price.
    pub fn effective_price(&self, price: &PlanPrice) -> Decimal {
        self.custom_price.unwrap_or(price.price)
    }

    /// Currency the subscription is billed in.
    pub fn effective_currency<'a>(&'a self, price: &'a PlanPrice) -> &'a str {
        self.custom_currency.as_deref().unwrap_or(&price.currency)
    }
}

/// An ephemeral purchase session
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkout {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub merchant_order_id: String,
    pub kind: CheckoutKind,
    pub target: sqlx::types::Json<CheckoutTarget>,
    /// Full price before proration credit
    pub amount: Decimal,
    pub proration_credit: Decimal,
    /// What the gateway is asked to collect
    pub final_amount: Decimal,
    pub currency: String,
    pub status: CheckoutStatus,
    pub failure_reason: Option<String>,
    /// Gateway-side transaction reference, set on completion
    pub gateway_reference: Option<String>,
    pub expires_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A tenant's holding of an addon; one row per (tenant, addon) pair,
/// quantity absorbs repeat purchases
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantAddon {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub addon_id: Uuid,
    pub quantity: i32,
    pub custom_price: Option<Decimal>,
    pub started_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Per (tenant, feature) consumption counter with a reset watermark
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TenantUsage {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub feature: String,
    pub used: i64,
    /// End of the current metering cycle; the reset sweep advances it
    pub cycle_ends_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Money captured for a completed checkout
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub checkout_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub gateway_reference: String,
    /// Total refunded so far; never exceeds `amount`
    pub refunded_amount: Decimal,
    pub refunded_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Payment {
    /// Portion of the payment not yet refunded.
    pub fn refundable_amount(&self) -> Decimal {
        self.amount - self.refunded_amount
    }
}

// =============================================================================
// Tests
// =============================================================================
