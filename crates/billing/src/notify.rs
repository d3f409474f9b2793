//! Notification sink
//!
//! Lifecycle events are pushed through this seam fire-and-forget: the core
//! never depends on delivery success. Delivery failures are logged at
//! `warn!` and swallowed.

use async_trait::async_trait;
use tenantry_shared::TenantId;

/// Outbound notification capability
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, tenant_id: TenantId, event_kind: &str, payload: serde_json::Value);
}

/// Sink that only writes structured log lines; default when no webhook
/// endpoint is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, tenant_id: TenantId, event_kind: &str, payload: serde_json::Value) {
        tracing::info!(
            tenant_id = %tenant_id,
            event_kind = %event_kind,
            payload = %payload,
            "Billing notification"
        );
    }
}

/// Sink that POSTs notifications to a configured webhook endpoint
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, tenant_id: TenantId, event_kind: &str, payload: serde_json::Value) {
        let body = serde_json::json!({
            "tenant_id": tenant_id,
            "event_kind": event_kind,
            "payload": payload,
        });
        let result = self.client.post(&self.url).json(&body).send().await;
        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    event_kind = %event_kind,
                    status = %response.status(),
                    "Notification webhook returned non-success"
                );
            }
            Err(e) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    event_kind = %event_kind,
                    error = %e,
                    "Failed to deliver notification webhook"
                );
            }
            Ok(_) => {}
        }
    }
}
