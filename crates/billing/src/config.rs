//! Billing configuration loaded from environment variables

use crate::error::{BillingError, BillingResult};

/// Payment gateway connection settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the gateway's REST API
    pub base_url: String,
    pub api_key: String,
    /// Shared secret for HMAC verification of callback payloads
    pub callback_secret: String,
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            base_url: require_env("GATEWAY_BASE_URL")?,
            api_key: require_env("GATEWAY_API_KEY")?,
            callback_secret: require_env("GATEWAY_CALLBACK_SECRET")?,
            timeout_secs: parse_env_or("GATEWAY_TIMEOUT_SECS", 10),
        })
    }
}

/// Tunables for the lifecycle and checkout services
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Minutes a pending checkout stays claimable before the expiry sweep
    pub checkout_ttl_minutes: i64,
    /// Days-before-boundary offsets for renewal/trial/addon reminders
    pub reminder_offsets_days: Vec<i64>,
    /// Days an effect-ledger row is kept before the retention sweep prunes it
    pub ledger_ttl_days: i64,
    /// Days before billing events are anonymized
    pub event_retention_days: i64,
    pub gateway: GatewayConfig,
    /// Optional endpoint for the webhook notification sink
    pub notify_webhook_url: Option<String>,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            checkout_ttl_minutes: parse_env_or("CHECKOUT_TTL_MINUTES", 30),
            reminder_offsets_days: parse_offsets_env("REMINDER_OFFSETS_DAYS", &[7, 3, 1]),
            ledger_ttl_days: parse_env_or("EFFECT_LEDGER_TTL_DAYS", 14),
            event_retention_days: parse_env_or("EVENT_RETENTION_DAYS", 180),
            gateway: GatewayConfig::from_env()?,
            notify_webhook_url: std::env::var("NOTIFY_WEBHOOK_URL").ok(),
        })
    }

    /// Config with the given gateway settings and defaults for everything
    /// else; tests override fields as needed.
    pub fn with_gateway(gateway: GatewayConfig) -> Self {
        Self {
            checkout_ttl_minutes: 30,
            reminder_offsets_days: vec![7, 3, 1],
            ledger_ttl_days: 14,
            event_retention_days: 180,
            gateway,
            notify_webhook_url: None,
        }
    }
}

fn require_env(key: &str) -> BillingResult<String> {
    std::env::var(key)
        .map_err(|_| BillingError::Config(format!("Missing required environment variable {}", key)))
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Comma-separated day offsets, e.g. "7,3,1". Invalid entries fall back to
/// the defaults rather than silently dropping reminders.
fn parse_offsets_env(key: &str, default: &[i64]) -> Vec<i64> {
    let Some(raw) = std::env::var(key).ok() else {
        return default.to_vec();
    };
    let parsed: Vec<i64> = raw
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .filter(|d| *d > 0)
        .collect();
    if parsed.is_empty() {
        default.to_vec()
    } else {
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_gateway_env() {
        std::env::remove_var("GATEWAY_BASE_URL");
        std::env::remove_var("GATEWAY_API_KEY");
        std::env::remove_var("GATEWAY_CALLBACK_SECRET");
        std::env::remove_var("GATEWAY_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_gateway_config_requires_base_url() {
        clear_gateway_env();
        let err = GatewayConfig::from_env().unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_gateway_config_reads_env() {
        clear_gateway_env();
        std::env::set_var("GATEWAY_BASE_URL", "https://psp.example");
        std::env::set_var("GATEWAY_API_KEY", "key_123");
        std::env::set_var("GATEWAY_CALLBACK_SECRET", "whsec_abc");

        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.base_url, "https://psp.example");
        assert_eq!(config.timeout_secs, 10, "timeout should default to 10s");

        clear_gateway_env();
    }

    #[test]
    #[serial]
    fn test_reminder_offsets_parsing() {
        std::env::set_var("REMINDER_OFFSETS_DAYS", "14, 7,1");
        assert_eq!(
            parse_offsets_env("REMINDER_OFFSETS_DAYS", &[7, 3, 1]),
            vec![14, 7, 1]
        );

        std::env::set_var("REMINDER_OFFSETS_DAYS", "garbage");
        assert_eq!(
            parse_offsets_env("REMINDER_OFFSETS_DAYS", &[7, 3, 1]),
            vec![7, 3, 1],
            "unparseable offsets must fall back to defaults"
        );

        std::env::remove_var("REMINDER_OFFSETS_DAYS");
        assert_eq!(
            parse_offsets_env("REMINDER_OFFSETS_DAYS", &[7, 3, 1]),
            vec![7, 3, 1]
        );
    }
}
