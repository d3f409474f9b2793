//! Payment gateway client
//!
//! The gateway is an opaque capability: token creation and refunds are the
//! only network calls the billing core makes. Both are timeout-bounded and
//! retried with bounded exponential backoff; only transport errors and 5xx
//! responses retry, a 4xx rejection is final. A failed call mutates
//! nothing, so the caller may retry. Callback payloads are authenticated
//! with HMAC-SHA256 over the raw body before anything is parsed from them.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tenantry_shared::Checkout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Buyer details forwarded to the gateway when creating a token
#[derive(Debug, Clone, Serialize)]
pub struct BuyerInfo {
    pub name: String,
    pub email: String,
}

/// Token/iframe handle returned by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentToken {
    pub token: String,
    pub iframe_url: Option<String>,
}

/// Parsed, verified callback payload
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedCallback {
    pub merchant_order_id: String,
    pub success: bool,
    pub amount: Decimal,
    pub currency: String,
    /// Gateway-side transaction reference
    pub reference: String,
    pub failure_reason: Option<String>,
}

/// Gateway acknowledgement of a refund
#[derive(Debug, Clone, Deserialize)]
pub struct RefundReceipt {
    pub reference: String,
}

/// External payment service provider capability
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Ask the gateway for a payment token for the checkout's final amount
    async fn create_token(
        &self,
        checkout: &Checkout,
        buyer: &BuyerInfo,
    ) -> BillingResult<PaymentToken>;

    /// Authenticate a callback body against its signature header
    fn verify_callback(&self, payload: &[u8], signature: &str) -> bool;

    /// Parse a verified callback body
    fn parse_callback(&self, payload: &[u8]) -> BillingResult<ParsedCallback>;

    /// Refund (part of) a captured payment
    async fn refund(&self, merchant_order_id: &str, amount: Decimal)
        -> BillingResult<RefundReceipt>;
}

/// HTTP implementation speaking JSON to the configured gateway endpoint
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    merchant_order_id: &'a str,
    amount: Decimal,
    currency: &'a str,
    buyer: &'a BuyerInfo,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    merchant_order_id: &'a str,
    amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    message: String,
}

/// One classified HTTP call failure
struct CallError {
    retryable: bool,
    error: BillingError,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn retry_strategy() -> impl Iterator<Item = Duration> {
        // Waits of ~100ms then ~200ms (+ jitter); three attempts total.
        ExponentialBackoff::from_millis(2)
            .factor(50)
            .map(jitter)
            .take(2)
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, CallError> {
        let url = format!("{}{}", self.config.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| CallError {
                retryable: true,
                error: e.into(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<GatewayErrorBody>()
                .await
                .map(|b| b.message)
                .unwrap_or_else(|_| format!("HTTP {}", status));
            // 4xx means the request itself was rejected; repeating it
            // cannot change the answer.
            return Err(CallError {
                retryable: status.is_server_error(),
                error: BillingError::Gateway(message),
            });
        }
        response.json::<R>().await.map_err(|e| CallError {
            retryable: false,
            error: e.into(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_token(
        &self,
        checkout: &Checkout,
        buyer: &BuyerInfo,
    ) -> BillingResult<PaymentToken> {
        let request = TokenRequest {
            merchant_order_id: &checkout.merchant_order_id,
            amount: checkout.final_amount,
            currency: &checkout.currency,
            buyer,
        };
        RetryIf::spawn(
            Self::retry_strategy(),
            || self.post_json::<_, PaymentToken>("/v1/tokens", &request),
            |e: &CallError| e.retryable,
        )
        .await
        .map_err(|e| e.error)
    }

    fn verify_callback(&self, payload: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.config.callback_secret.as_bytes()) else {
            return false;
        };
        mac.update(payload);
        // Constant-time comparison.
        mac.verify_slice(&expected).is_ok()
    }

    fn parse_callback(&self, payload: &[u8]) -> BillingResult<ParsedCallback> {
        Ok(serde_json::from_slice(payload)?)
    }

    async fn refund(
        &self,
        merchant_order_id: &str,
        amount: Decimal,
    ) -> BillingResult<RefundReceipt> {
        let request = RefundRequest {
            merchant_order_id,
            amount,
        };
        RetryIf::spawn(
            Self::retry_strategy(),
            || self.post_json::<_, RefundReceipt>("/v1/refunds", &request),
            |e: &CallError| e.retryable,
        )
        .await
        .map_err(|e| match e.error {
            BillingError::Gateway(msg) => BillingError::RefundFailed(msg),
            other => other,
        })
    }
}

/// Sign a payload the way the gateway does; used by tests and by operators
/// replaying callbacks against a staging environment.
pub fn sign_callback(secret: &str, payload: &[u8]) -> String {
    #[allow(clippy::expect_used)] // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
