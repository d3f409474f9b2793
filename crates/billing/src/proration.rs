//! Proration calculator
//!
//! Pure money math for mid-period plan changes. The current period is one
//! interval span anchored backward from `ends_at` (forward from "now" when
//! the subscription is open-ended); the new period is anchored forward from
//! "now". Month and year spans use real calendar lengths, so a February
//! period divides by 28 (or 29), not a fixed 30.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tenantry_shared::{PlanPrice, Subscription};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Outcome of costing a plan change at a point in time.
///
/// `credit` and `final_amount` are settled money figures (2dp); the daily
/// rates are informational (4dp). For `end_of_period` changes the quote is
/// display-only — no charge is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProrationQuote {
    /// Unused value of the current period, capped at what was collected
    pub credit: Decimal,
    /// Full price of one period on the new plan price
    pub new_amount: Decimal,
    /// `max(0, new_amount - credit)` — what a checkout collects
    pub final_amount: Decimal,
    /// Whole days between "now" and the current period end, floored at 0
    pub days_remaining: i64,
    pub daily_rate_old: Decimal,
    pub daily_rate_new: Decimal,
    pub old_period_days: i64,
    pub new_period_days: i64,
}

/// Cost a change from the subscription's current price to `new_price`.
///
/// When `ends_at` is null there is nothing to credit: the remaining days
/// default to the full new period and the buyer pays the full new price.
pub fn calculate(
    subscription: &Subscription,
    current_price: &PlanPrice,
    new_price: &PlanPrice,
    now: OffsetDateTime,
) -> BillingResult<ProrationQuote> {
    let new_period_days = new_price.period_days(now);
    if new_period_days <= 0 {
        return Err(BillingError::Internal(format!(
            "Plan price {} has a non-positive period length",
            new_price.id
        )));
    }

    let paid = subscription.effective_price(current_price);
    let new_amount = scale_money(new_price.price);

    let (old_period_days, days_remaining) = match subscription.ends_at {
        Some(ends_at) => {
            let period_start = current_price
                .interval
                .advance(ends_at, -current_price.interval_count);
            let old_period_days = (ends_at - period_start).whole_days();
            let days_remaining = (ends_at - now).whole_days().max(0);
            (old_period_days, days_remaining)
        }
        // Open-ended: no period to credit back.
        None => (current_price.period_days(now), new_period_days),
    };
    if old_period_days <= 0 {
        return Err(BillingError::Internal(format!(
            "Plan price {} has a non-positive period length",
            current_price.id
        )));
    }

    let daily_rate_old = paid / Decimal::from(old_period_days);
    let daily_rate_new = new_price.price / Decimal::from(new_period_days);

    // Full precision until here; credit is rounded exactly once as a final
    // money figure and final_amount derives from the rounded credit so the
    // reported numbers stay additive.
    let credit = if subscription.ends_at.is_some() {
        let raw = daily_rate_old * Decimal::from(days_remaining);
        scale_money(raw.min(paid).max(Decimal::ZERO))
    } else {
        Decimal::ZERO
    };
    let final_amount = scale_money((new_amount - credit).max(Decimal::ZERO));

    Ok(ProrationQuote {
        credit,
        new_amount,
        final_amount,
        days_remaining,
        daily_rate_old: scale_rate(daily_rate_old),
        daily_rate_new: scale_rate(daily_rate_new),
        old_period_days,
        new_period_days,
    })
}

fn scale_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn scale_rate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}
