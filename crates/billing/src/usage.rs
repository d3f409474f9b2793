//! Metered usage
//!
//! Per (tenant, feature) consumption counters with a `cycle_ends_at`
//! watermark. The reset sweep zeroes counters whose cycle has ended and
//! advances the watermark one reset period at a time until it is in the
//! future; the advance is guarded by the previous watermark value so
//! concurrent sweeps cannot double-advance.

use std::sync::Arc;

use tenantry_shared::{BillingInterval, Clock, TenantId, TenantUsage};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::{Store, UsageCycleReset, UsageDelta, UsageStore};

/// Metering cycles reset monthly (calendar-accurate).
const RESET_INTERVAL: BillingInterval = BillingInterval::Month;

/// Advance `watermark` by whole reset periods until it passes `now`.
fn next_cycle_end(watermark: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
    let mut next = watermark;
    while next <= now {
        next = RESET_INTERVAL.advance(next, 1);
    }
    next
}

/// Summary of one usage-reset sweep
#[derive(Debug, Clone, Default)]
pub struct UsageResetSummary {
    pub reset: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Metered usage service
#[derive(Clone)]
pub struct UsageService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl UsageService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Count consumption against a feature; creates the counter with a
    /// one-period cycle when the tenant has none yet.
    pub async fn record(
        &self,
        tenant_id: TenantId,
        feature: &str,
        delta: i64,
    ) -> BillingResult<TenantUsage> {
        let now = self.clock.now();
        self.store
            .record_usage(UsageDelta {
                tenant_id,
                feature: feature.to_string(),
                delta,
                default_cycle_ends_at: RESET_INTERVAL.advance(now, 1),
            })
            .await
    }

    /// Zero every counter whose cycle has ended and advance its watermark.
    pub async fn reset_due(&self) -> BillingResult<UsageResetSummary> {
        let now = self.clock.now();
        let due = self.store.usage_due_for_reset(now).await?;
        let mut summary = UsageResetSummary::default();

        for row in due {
            let reset = UsageCycleReset {
                usage_id: row.id,
                expected_cycle_ends_at: row.cycle_ends_at,
                new_cycle_ends_at: next_cycle_end(row.cycle_ends_at, now),
            };
            match self.store.reset_usage_cycle(reset).await {
                // Guard mismatch: another sweep already advanced it.
                Ok(false) => summary.skipped += 1,
                Ok(true) => {
                    tracing::debug!(
                        tenant_id = %row.tenant_id,
                        feature = %row.feature,
                        "Usage cycle reset"
                    );
                    summary.reset += 1;
                }
                Err(e) => {
                    tracing::error!(
                        tenant_id = %row.tenant_id,
                        feature = %row.feature,
                        error = %e,
                        "Failed to reset usage cycle; skipping record"
                    );
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }
}
