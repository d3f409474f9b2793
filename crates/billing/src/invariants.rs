//! Billing invariants
//!
//! Runnable consistency checks over the billing schema. Each invariant is a
//! real SQL query, read-only, and returns enough context to debug a
//! violation. The worker runs the full set nightly; any check can also be
//! run ad hoc after a suspicious incident.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single violated invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected row ids
    pub subject_ids: Vec<Uuid>,
    /// Human-readable description
    pub description: String,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// System may be charging or granting access incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Operational lag, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Result of running the full invariant set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Read-only consistency checker over the billing schema
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every invariant and collect the violations.
    pub async fn check_all(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        let mut checks_run = 0;

        let checks: [BillingResult<Option<InvariantViolation>>; 7] = [
            self.check_single_current_subscription().await,
            self.check_subscription_price_exists().await,
            self.check_scheduled_change_targets().await,
            self.check_stuck_processing_checkouts().await,
            self.check_expiry_sweep_lag().await,
            self.check_addon_sweep_lag().await,
            self.check_stale_usage_watermarks().await,
        ];
        for check in checks {
            checks_run += 1;
            if let Some(violation) = check? {
                tracing::warn!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    affected = violation.subject_ids.len(),
                    "Billing invariant violated"
                );
                violations.push(violation);
            }
        }

        let checks_passed = checks_run - violations.len();
        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one current (non-superseded) subscription per tenant.
    async fn check_single_current_subscription(
        &self,
    ) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) FROM subscriptions
            WHERE superseded_at IS NULL
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if(
            rows.iter().map(|(id, _)| *id).collect(),
            "single_current_subscription",
            "Tenants with more than one current subscription",
            ViolationSeverity::Critical,
        ))
    }

    /// Every subscription must reference an existing plan price.
    async fn check_subscription_price_exists(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT s.id FROM subscriptions s
            LEFT JOIN plan_prices p ON p.id = s.plan_price_id
            WHERE p.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if(
            rows.iter().map(|(id,)| *id).collect(),
            "subscription_price_exists",
            "Subscriptions referencing a missing plan price",
            ViolationSeverity::Critical,
        ))
    }

    /// Scheduled changes must target an existing price different from the
    /// current one.
    async fn check_scheduled_change_targets(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT s.id FROM subscriptions s
            LEFT JOIN plan_prices p ON p.id = s.next_plan_price_id
            WHERE s.superseded_at IS NULL
              AND s.next_plan_price_id IS NOT NULL
              AND (p.id IS NULL OR s.next_plan_price_id = s.plan_price_id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if(
            rows.iter().map(|(id,)| *id).collect(),
            "scheduled_change_targets",
            "Scheduled changes targeting a missing price or the current price",
            ViolationSeverity::High,
        ))
    }

    /// Checkouts stuck in `processing` indicate a provisioning failure the
    /// gateway never retried; they need manual reconciliation.
    async fn check_stuck_processing_checkouts(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM checkouts
            WHERE status = 'processing'
              AND updated_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if(
            rows.iter().map(|(id,)| *id).collect(),
            "stuck_processing_checkouts",
            "Checkouts stuck in processing for over an hour",
            ViolationSeverity::High,
        ))
    }

    /// Pending checkouts far past expiry mean the expiry sweep is not
    /// running.
    async fn check_expiry_sweep_lag(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM checkouts
            WHERE status = 'pending'
              AND expires_at < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if(
            rows.iter().map(|(id,)| *id).collect(),
            "checkout_expiry_sweep_lag",
            "Pending checkouts more than a day past expiry",
            ViolationSeverity::Medium,
        ))
    }

    /// Active addons far past expiry mean the addon sweep is not running.
    async fn check_addon_sweep_lag(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM tenant_addons
            WHERE is_active
              AND expires_at < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if(
            rows.iter().map(|(id,)| *id).collect(),
            "addon_sweep_lag",
            "Active tenant addons more than a day past expiry",
            ViolationSeverity::Medium,
        ))
    }

    /// Usage watermarks far in the past mean the reset sweep is not
    /// advancing cycles.
    async fn check_stale_usage_watermarks(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM tenant_usages
            WHERE cycle_ends_at < NOW() - INTERVAL '2 days'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(violation_if(
            rows.iter().map(|(id,)| *id).collect(),
            "stale_usage_watermarks",
            "Usage counters whose cycle watermark is more than two days stale",
            ViolationSeverity::Medium,
        ))
    }
}

fn violation_if(
    subject_ids: Vec<Uuid>,
    invariant: &str,
    description: &str,
    severity: ViolationSeverity,
) -> Option<InvariantViolation> {
    if subject_ids.is_empty() {
        return None;
    }
    Some(InvariantViolation {
        invariant: invariant.to_string(),
        subject_ids,
        description: description.to_string(),
        severity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_violation_for_empty_subjects() {
        assert!(violation_if(
            vec![],
            "single_current_subscription",
            "desc",
            ViolationSeverity::Critical
        )
        .is_none());
    }

    #[test]
    fn test_violation_carries_subjects_and_severity() {
        let id = Uuid::new_v4();
        let v = violation_if(
            vec![id],
            "stuck_processing_checkouts",
            "Checkouts stuck in processing",
            ViolationSeverity::High,
        )
        .unwrap();
        assert_eq!(v.subject_ids, vec![id]);
        assert_eq!(v.severity, ViolationSeverity::High);
        assert_eq!(v.severity.to_string(), "HIGH");
    }
}
