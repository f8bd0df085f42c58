//! Gateway Error Surface
//! Mission: One typed error kind per failure class, stable across venues

use thiserror::Error;

/// Errors surfaced by the gateway core.
///
/// Validation and risk failures are never retried. `RateLimited` and
/// `Timeout` are the only kinds a caller may reasonably retry; `Timeout`
/// additionally hints the reconciler that the true order state is unknown.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("risk limits exceeded: {}", .violations.join("; "))]
    RiskLimitExceeded { violations: Vec<String> },

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("position not found: {0}")]
    PositionNotFound(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("venue error: {0}")]
    Venue(String),

    #[error("venue '{0}' has no registered connector")]
    UnsupportedVenue(String),

    #[error("{op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

impl GatewayError {
    /// Balance shortfall with the numbers a caller wants to see.
    pub fn insufficient_balance(required: f64, available: f64) -> Self {
        GatewayError::InsufficientBalance(format!(
            "required ${required:.2}, available ${available:.2}"
        ))
    }

    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. } | GatewayError::Timeout { .. }
        )
    }

    /// Whether the error maps to a missing resource (404-equivalent).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GatewayError::OrderNotFound(_) | GatewayError::PositionNotFound(_)
        )
    }

    /// Message safe to show an external caller. Internal errors are
    /// redacted in production.
    pub fn public_message(&self, production: bool) -> String {
        match self {
            GatewayError::Internal(_) | GatewayError::Storage(_) if production => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout {
                op: "venue request",
                secs: 0,
            }
        } else {
            GatewayError::Venue(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Venue(format!("malformed venue payload: {err}"))
    }
}
