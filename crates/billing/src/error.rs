//! Billing error types

use thiserror::Error;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors surfaced by the billing core.
///
/// Replay/idempotency conditions (duplicate callbacks, re-applied scheduled
/// changes) are deliberately *not* errors — they resolve as silent no-op
/// successes because at-least-once delivery is expected.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Input rejected before any state mutation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Tenant has no current subscription
    #[error("No current subscription for tenant")]
    SubscriptionNotFound,

    /// Operation not permitted in the aggregate's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Payment gateway call failed; nothing was mutated and the caller may retry
    #[error("Payment gateway error: {0}")]
    Gateway(String),

    /// Gateway callback payload failed authenticity verification
    #[error("Callback signature verification failed")]
    CallbackSignatureInvalid,

    /// Refund rejected by the gateway or by payment state
    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Guarded update lost a race; the caller may reload and retry
    #[error("Concurrent modification detected")]
    ConcurrentModification,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        Self::Gateway(e.to_string())
    }
}

impl BillingError {
    /// Human-readable failure reason suitable for checkout records.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Gateway(_) => "Payment could not be processed".to_string(),
            Self::CallbackSignatureInvalid => "Payment confirmation was rejected".to_string(),
            other => other.to_string(),
        }
    }
}
