// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Engine
//!
//! Boundary conditions that cut across modules:
//! - Calendar interval math (end-of-month clamping, leap years)
//! - Proration at period boundaries and with multi-unit intervals
//! - Status resolution at exact instants
//! - Checkout target encoding
//! - Grace window derivation

#[cfg(test)]
mod calendar_tests {
    use tenantry_shared::BillingInterval;
    use time::macros::datetime;

    // =========================================================================
    // Jan 31 + 1 month clamps to the end of February
    // =========================================================================
    #[test]
    fn test_month_advance_clamps_jan_31() {
        let from = datetime!(2025-01-31 10:30 UTC);
        assert_eq!(
            BillingInterval::Month.advance(from, 1),
            datetime!(2025-02-28 10:30 UTC)
        );
    }

    #[test]
    fn test_month_advance_clamps_to_leap_day() {
        let from = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(
            BillingInterval::Month.advance(from, 1),
            datetime!(2024-02-29 00:00 UTC)
        );
    }

    // =========================================================================
    // The clamp does not stick: anchoring from Jan 31 by 2 months lands on
    // Mar 31, not Mar 28
    // =========================================================================
    #[test]
    fn test_multi_month_advance_does_not_propagate_clamp() {
        let from = datetime!(2025-01-31 00:00 UTC);
        assert_eq!(
            BillingInterval::Month.advance(from, 2),
            datetime!(2025-03-31 00:00 UTC)
        );
    }

    #[test]
    fn test_year_advance_from_leap_day() {
        let from = datetime!(2024-02-29 00:00 UTC);
        assert_eq!(
            BillingInterval::Year.advance(from, 1),
            datetime!(2025-02-28 00:00 UTC)
        );
    }

    // =========================================================================
    // Negative counts anchor a period backward from its end
    // =========================================================================
    #[test]
    fn test_negative_month_advance() {
        let from = datetime!(2025-03-31 00:00 UTC);
        assert_eq!(
            BillingInterval::Month.advance(from, -1),
            datetime!(2025-02-28 00:00 UTC)
        );
    }

    #[test]
    fn test_year_crossing_backward() {
        let from = datetime!(2025-01-15 00:00 UTC);
        assert_eq!(
            BillingInterval::Month.advance(from, -2),
            datetime!(2024-11-15 00:00 UTC)
        );
    }

    #[test]
    fn test_day_and_week_are_exact() {
        let from = datetime!(2025-06-15 08:00 UTC);
        assert_eq!(
            BillingInterval::Day.advance(from, 30),
            datetime!(2025-07-15 08:00 UTC)
        );
        assert_eq!(
            BillingInterval::Week.advance(from, 2),
            datetime!(2025-06-29 08:00 UTC)
        );
    }

    #[test]
    fn test_period_days_february_vs_march() {
        let feb = datetime!(2025-02-01 00:00 UTC);
        let mar = datetime!(2025-03-01 00:00 UTC);
        assert_eq!(BillingInterval::Month.period_days(feb, 1), 28);
        assert_eq!(BillingInterval::Month.period_days(mar, 1), 31);
    }

    #[test]
    fn test_period_days_leap_year() {
        let anchor = datetime!(2024-01-01 00:00 UTC);
        assert_eq!(BillingInterval::Year.period_days(anchor, 1), 366);
        assert_eq!(
            BillingInterval::Year.period_days(datetime!(2025-01-01 00:00 UTC), 1),
            365
        );
    }
}

#[cfg(test)]
mod proration_edge_tests {
    use crate::proration::calculate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tenantry_shared::{BillingInterval, PlanPrice, Subscription, TenantId};
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    const NOW: OffsetDateTime = datetime!(2025-06-15 00:00 UTC);

    fn price(interval: BillingInterval, count: i32, amount: Decimal) -> PlanPrice {
        PlanPrice {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            interval,
            interval_count: count,
            price: amount,
            currency: "USD".to_string(),
            trial_days: 0,
            created_at: NOW - Duration::days(400),
        }
    }

    fn sub(ends_at: Option<OffsetDateTime>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            tenant_id: TenantId::new(),
            plan_price_id: Uuid::new_v4(),
            next_plan_price_id: None,
            starts_at: NOW - Duration::days(20),
            ends_at,
            trial_ends_at: None,
            canceled_at: None,
            grace_period_ends_at: None,
            custom_price: None,
            custom_currency: None,
            status_override: None,
            superseded_at: None,
            created_at: NOW - Duration::days(20),
            updated_at: NOW - Duration::days(20),
        }
    }

    // =========================================================================
    // Quarterly plan: period anchored 3 months back from ends_at
    // =========================================================================
    #[test]
    fn test_multi_unit_interval_period_length() {
        // Ends Sep 1, anchors back to Jun 1: 92 days (Jun 30 + Jul 31 + Aug 31).
        let current = price(BillingInterval::Month, 3, dec!(92));
        let target = price(BillingInterval::Month, 3, dec!(184));
        let s = sub(Some(datetime!(2025-09-01 00:00 UTC)));

        let quote = calculate(&s, &current, &target, datetime!(2025-06-01 00:00 UTC)).unwrap();
        assert_eq!(quote.old_period_days, 92);
        assert_eq!(quote.daily_rate_old, dec!(1));
    }

    // =========================================================================
    // Fractional-day remainders truncate toward zero
    // =========================================================================
    #[test]
    fn test_partial_day_remaining_truncates() {
        let current = price(BillingInterval::Day, 30, dec!(300));
        let target = price(BillingInterval::Day, 30, dec!(600));
        // 10 days minus one hour remain.
        let s = sub(Some(NOW + Duration::days(10) - Duration::hours(1)));

        let quote = calculate(&s, &current, &target, NOW).unwrap();
        assert_eq!(quote.days_remaining, 9);
        assert_eq!(quote.credit, dec!(90));
    }

    #[test]
    fn test_one_day_remaining() {
        let current = price(BillingInterval::Day, 30, dec!(300));
        let target = price(BillingInterval::Day, 30, dec!(600));
        let s = sub(Some(NOW + Duration::days(1)));

        let quote = calculate(&s, &current, &target, NOW).unwrap();
        assert_eq!(quote.days_remaining, 1);
        assert_eq!(quote.credit, dec!(10));
        assert_eq!(quote.final_amount, dec!(590));
    }

    // =========================================================================
    // Free plans quote zero everywhere without dividing by zero
    // =========================================================================
    #[test]
    fn test_free_current_plan() {
        let current = price(BillingInterval::Month, 1, dec!(0));
        let target = price(BillingInterval::Month, 1, dec!(49.99));
        let s = sub(Some(NOW + Duration::days(10)));

        let quote = calculate(&s, &current, &target, NOW).unwrap();
        assert_eq!(quote.credit, dec!(0));
        assert_eq!(quote.final_amount, dec!(49.99));
    }

    #[test]
    fn test_free_target_plan() {
        let current = price(BillingInterval::Month, 1, dec!(49.99));
        let target = price(BillingInterval::Month, 1, dec!(0));
        let s = sub(Some(NOW + Duration::days(10)));

        let quote = calculate(&s, &current, &target, NOW).unwrap();
        assert_eq!(quote.new_amount, dec!(0));
        assert_eq!(quote.final_amount, dec!(0));
    }

    // =========================================================================
    // Cross-interval change: yearly credit against a monthly charge
    // =========================================================================
    #[test]
    fn test_yearly_to_monthly_change() {
        let current = price(BillingInterval::Year, 1, dec!(365));
        let target = price(BillingInterval::Month, 1, dec!(60));
        // 100 days of a non-leap year remain.
        let now = datetime!(2025-03-01 00:00 UTC);
        let s = sub(Some(now + Duration::days(100)));

        let quote = calculate(&s, &current, &target, now).unwrap();
        assert_eq!(quote.old_period_days, 365);
        assert_eq!(quote.credit, dec!(100));
        assert_eq!(quote.new_amount, dec!(60));
        // Credit exceeds the new charge; nothing is collected.
        assert_eq!(quote.final_amount, dec!(0));
        assert_eq!(quote.new_period_days, 31);
    }

    #[test]
    fn test_sub_cent_rate_rounds_half_away_from_zero() {
        // 1.00 over 30 days = 0.0333.../day; 15 days credit 0.50.
        let current = price(BillingInterval::Day, 30, dec!(1));
        let target = price(BillingInterval::Day, 30, dec!(2));
        let s = sub(Some(NOW + Duration::days(15)));

        let quote = calculate(&s, &current, &target, NOW).unwrap();
        assert_eq!(quote.credit, dec!(0.50));
        assert_eq!(quote.final_amount, dec!(1.50));
        assert_eq!(quote.daily_rate_old, dec!(0.0333));
    }
}

#[cfg(test)]
mod status_instant_tests {
    use crate::status::resolve_status;
    use tenantry_shared::SubscriptionStatus;
    use time::macros::datetime;
    use time::OffsetDateTime;

    const NOW: OffsetDateTime = datetime!(2025-06-15 12:00 UTC);

    // =========================================================================
    // Boundaries are exclusive: at the exact instant, the window has ended
    // =========================================================================
    #[test]
    fn test_trial_ending_exactly_now_is_over() {
        let status = resolve_status(NOW, Some(NOW), None, None, None);
        assert_eq!(status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_period_ending_exactly_now_is_over() {
        let status = resolve_status(NOW, None, None, Some(NOW), None);
        assert_eq!(status, SubscriptionStatus::Expired);
    }

    #[test]
    fn test_grace_ending_exactly_now_is_over() {
        let status = resolve_status(NOW, None, None, Some(NOW), Some(NOW));
        assert_eq!(status, SubscriptionStatus::Expired);
    }

    #[test]
    fn test_one_nanosecond_of_grace_is_past_due() {
        let status = resolve_status(
            NOW,
            None,
            None,
            Some(NOW),
            Some(NOW + time::Duration::nanoseconds(1)),
        );
        assert_eq!(status, SubscriptionStatus::PastDue);
    }

    #[test]
    fn test_cancellation_at_exact_period_end_is_expired() {
        // Cancellation only shields an open period; at the boundary the
        // period is closed.
        let status = resolve_status(NOW, None, Some(NOW), Some(NOW), None);
        assert_eq!(status, SubscriptionStatus::Expired);
    }
}

#[cfg(test)]
mod checkout_target_tests {
    use tenantry_shared::CheckoutTarget;
    use uuid::Uuid;

    // =========================================================================
    // Targets persist as tagged JSON; the tag names are a stored contract
    // =========================================================================
    #[test]
    fn test_target_tag_names_are_stable() {
        let id = Uuid::new_v4();
        let cases = [
            (
                CheckoutTarget::NewSubscription { plan_price_id: id },
                "new_subscription",
            ),
            (
                CheckoutTarget::Renewal {
                    subscription_id: id,
                },
                "renewal",
            ),
            (
                CheckoutTarget::PlanChange {
                    subscription_id: id,
                    new_plan_price_id: id,
                },
                "plan_change",
            ),
            (
                CheckoutTarget::AddonPurchase {
                    addon_id: id,
                    quantity: 3,
                },
                "addon_purchase",
            ),
            (
                CheckoutTarget::AddonRenewal {
                    tenant_addon_id: id,
                },
                "addon_renewal",
            ),
        ];
        for (target, tag) in cases {
            let value = serde_json::to_value(&target).unwrap();
            assert_eq!(value["type"], tag);
            let back: CheckoutTarget = serde_json::from_value(value).unwrap();
            assert_eq!(back, target);
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let result: Result<CheckoutTarget, _> = serde_json::from_value(serde_json::json!({
            "type": "gift_card",
            "code": "ABC"
        }));
        assert!(result.is_err());
    }
}

#[cfg(test)]
mod grace_window_tests {
    use crate::subscriptions::grace_period_ends;
    use tenantry_shared::{Plan, ProrationBehavior};
    use time::macros::datetime;
    use time::Duration;

    fn plan(grace_days: i32) -> Plan {
        Plan {
            id: uuid::Uuid::new_v4(),
            name: "Pro".to_string(),
            grace_period_days: grace_days,
            upgrade_behavior: ProrationBehavior::Immediate,
            downgrade_behavior: ProrationBehavior::EndOfPeriod,
            is_archived: false,
            created_at: datetime!(2025-01-01 00:00 UTC),
        }
    }

    // =========================================================================
    // Grace is materialized alongside ends_at, never computed on read
    // =========================================================================
    #[test]
    fn test_grace_tracks_period_end() {
        let end = datetime!(2025-07-01 00:00 UTC);
        assert_eq!(
            grace_period_ends(&plan(3), Some(end)),
            Some(end + Duration::days(3))
        );
    }

    #[test]
    fn test_zero_grace_days_yields_no_window() {
        let end = datetime!(2025-07-01 00:00 UTC);
        assert_eq!(grace_period_ends(&plan(0), Some(end)), None);
    }

    #[test]
    fn test_open_ended_subscription_has_no_grace() {
        assert_eq!(grace_period_ends(&plan(7), None), None);
    }
}
