//! Addon purchases and terms
//!
//! One `tenant_addons` row per (tenant, addon): buying the same addon again
//! while a holding is active absorbs into its quantity and keeps the
//! existing term; buying after expiry restarts the term. Deactivation is a
//! batch sweep where the active→inactive transition itself is the
//! idempotency guard.

use std::sync::Arc;

use tenantry_shared::{Clock, TenantAddon, TenantId};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventKind, BillingEventLogger};
use crate::notify::NotificationSink;
use crate::store::{AddonPurchaseRecord, AddonRenewalRecord, AddonStore, CatalogStore, Store};

/// Summary of one addon-expiry sweep
#[derive(Debug, Clone, Default)]
pub struct AddonSweepSummary {
    pub deactivated: usize,
    pub errors: usize,
}

/// Tenant addon service
#[derive(Clone)]
pub struct AddonService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: BillingEventLogger,
    notify: Arc<dyn NotificationSink>,
}

impl AddonService {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        events: BillingEventLogger,
        notify: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            notify,
        }
    }

    /// Apply a paid addon purchase; the checkout-callback path.
    pub async fn apply_purchase(
        &self,
        tenant_id: TenantId,
        addon_id: Uuid,
        quantity: i32,
    ) -> BillingResult<TenantAddon> {
        if quantity < 1 {
            return Err(BillingError::Validation(
                "Addon quantity must be at least 1".to_string(),
            ));
        }
        let addon = self
            .store
            .addon(addon_id)
            .await?
            .ok_or(BillingError::NotFound("Addon"))?;

        let now = self.clock.now();
        let row = self
            .store
            .upsert_addon_purchase(AddonPurchaseRecord {
                tenant_id,
                addon_id,
                quantity,
                started_at: now,
                expires_at: addon.term_end(now),
            })
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            addon_id = %addon_id,
            quantity = quantity,
            total_quantity = row.quantity,
            expires_at = %row.expires_at,
            "Addon purchase applied"
        );
        self.events
            .log(
                tenant_id,
                BillingEventKind::AddonPurchased,
                Some(row.id),
                serde_json::json!({
                    "addon_id": addon_id,
                    "quantity": quantity,
                    "total_quantity": row.quantity,
                }),
            )
            .await;
        self.notify
            .notify(
                tenant_id,
                BillingEventKind::AddonPurchased.as_str(),
                serde_json::json!({ "addon_id": addon_id, "quantity": quantity }),
            )
            .await;
        Ok(row)
    }

    /// Extend a holding one addon term; the checkout-callback path for
    /// addon renewals. Early renewal anchors at the current expiry, lapsed
    /// renewal at "now".
    pub async fn renew(
        &self,
        tenant_id: TenantId,
        tenant_addon_id: Uuid,
    ) -> BillingResult<TenantAddon> {
        let row = self
            .store
            .tenant_addon(tenant_addon_id)
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

        let now = self.clock.now();
        let anchor = if row.expires_at > now {
            row.expires_at
        } else {
            now
        };
        let new_expires_at = addon.term_end(anchor);
        let renewed = self
            .store
            .renew_tenant_addon(AddonRenewalRecord {
                tenant_addon_id,
                new_expires_at,
            })
            .await?;
        if !renewed {
            return Err(BillingError::ConcurrentModification);
        }

        tracing::info!(
            tenant_id = %tenant_id,
            tenant_addon_id = %tenant_addon_id,
            new_expires_at = %new_expires_at,
            "Addon renewed"
        );
        self.events
            .log(
                tenant_id,
                BillingEventKind::AddonRenewed,
                Some(tenant_addon_id),
                serde_json::json!({
                    "addon_id": row.addon_id,
                    "new_expires_at": new_expires_at.to_string(),
                }),
            )
            .await;

        self.store
            .tenant_addon(tenant_addon_id)
            .await?
            .ok_or(BillingError::NotFound("Tenant addon"))
    }

    /// Deactivate every active holding past its expiry.
    pub async fn deactivate_due(&self) -> BillingResult<AddonSweepSummary> {
        let now = self.clock.now();
        let deactivated = self.store.deactivate_due_addons(now).await?;
        let summary = AddonSweepSummary {
            deactivated: deactivated.len(),
            errors: 0,
        };

        for row in deactivated {
            self.events
                .log(
                    row.tenant_id,
                    BillingEventKind::AddonExpired,
                    Some(row.id),
                    serde_json::json!({
                        "addon_id": row.addon_id,
                        "expired_at": row.expires_at.to_string(),
                    }),
                )
                .await;
            self.notify
                .notify(
                    row.tenant_id,
                    BillingEventKind::AddonExpired.as_str(),
                    serde_json::json!({ "addon_id": row.addon_id }),
                )
                .await;
        }
        Ok(summary)
    }
}
