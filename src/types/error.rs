//! Error types for Tollgate
//!
//! Every variant carries a machine-stable code (see [`TollgateError::code`]).
//! Clients branch on the code, never on the message, so the code strings
//! below must keep their meaning across releases.

use hyper::StatusCode;
use rust_decimal::Decimal;
use serde::Serialize;

/// Main error type for Tollgate operations
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    #[error("Insufficient balance: {required} credits required, {available} available")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("Invalid payment method: {0}")]
    InvalidPaymentMethod(String),

    #[error("Payment already processed: {0}")]
    PaymentAlreadyProcessed(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate lookup failed: {0}")]
    RateLookup(String),

    #[error("Queue publish failed: {0}")]
    QueuePublish(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Settlement rail unavailable: {0}")]
    Rail(String),

    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A job class handle could not be rebuilt. Only the resilience loop
    /// produces this, and it always terminates the process.
    #[error("Broker unrecoverable: {0}")]
    BrokerFatal(String),
}

impl TollgateError {
    /// Stable error code exposed to clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "insufficient-balance",
            Self::InvalidPaymentMethod(_) => "invalid-payment-method",
            Self::PaymentAlreadyProcessed(_) => "payment-already-processed",
            Self::PaymentNotFound(_) => "payment-not-found",
            Self::AccountNotFound(_) => "account-not-found",
            Self::BadRequest(_) => "malformed-request",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLookup(_) => "rate-lookup-failed",
            Self::QueuePublish(_) | Self::Nats(_) => "queue-publish-failed",
            Self::Rail(_) => "rail-unavailable",
            Self::Upstream(_) => "upstream-unavailable",
            Self::Database(_) => "database-error",
            Self::Config(_) => "configuration-error",
            Self::Signing(_) | Self::Internal(_) => "internal-error",
            Self::BrokerFatal(_) => "broker-unrecoverable",
        }
    }

    /// Whether the caller may retry the same request later.
    ///
    /// User errors are final. Downstream unavailability is retryable, and no
    /// credits are held when it is reported.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLookup(_)
                | Self::QueuePublish(_)
                | Self::Nats(_)
                | Self::Rail(_)
                | Self::Upstream(_)
                | Self::Database(_)
        )
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::InvalidPaymentMethod(_) => StatusCode::BAD_REQUEST,
            Self::PaymentAlreadyProcessed(_) => StatusCode::CONFLICT,
            Self::PaymentNotFound(_) => StatusCode::NOT_FOUND,
            Self::AccountNotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLookup(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::QueuePublish(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Nats(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Rail(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BrokerFatal(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// JSON body sent to clients
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            code: self.code(),
            retryable: self.is_retryable(),
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, ErrorBody) {
        (self.status_code(), self.to_body())
    }
}

/// Wire shape of an error response
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    pub retryable: bool,
}

impl From<std::io::Error> for TollgateError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for TollgateError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for TollgateError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<async_nats::Error> for TollgateError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

impl From<mongodb::error::Error> for TollgateError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for TollgateError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Database(format!("BSON error: {}", err))
    }
}

impl From<reqwest::Error> for TollgateError {
    fn from(err: reqwest::Error) -> Self {
        Self::Rail(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for TollgateError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

impl From<k256::ecdsa::Error> for TollgateError {
    fn from(err: k256::ecdsa::Error) -> Self {
        Self::Signing(err.to_string())
    }
}

/// Result type alias for Tollgate operations
pub type Result<T> = std::result::Result<T, TollgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let cases = [
            (
                TollgateError::InsufficientBalance {
                    required: Decimal::TEN,
                    available: Decimal::ONE,
                },
                "insufficient-balance",
            ),
            (TollgateError::InvalidPaymentMethod("x".into()), "invalid-payment-method"),
            (TollgateError::PaymentAlreadyProcessed("x".into()), "payment-already-processed"),
            (TollgateError::RateLookup("x".into()), "rate-lookup-failed"),
            (TollgateError::QueuePublish("x".into()), "queue-publish-failed"),
            (TollgateError::BadRequest("x".into()), "malformed-request"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_user_errors_are_not_retryable() {
        assert!(!TollgateError::InsufficientBalance {
            required: Decimal::TEN,
            available: Decimal::ZERO,
        }
        .is_retryable());
        assert!(!TollgateError::PaymentAlreadyProcessed("5".into()).is_retryable());
        assert!(!TollgateError::BadRequest("bad".into()).is_retryable());
    }

    #[test]
    fn test_downstream_errors_are_retryable() {
        let err = TollgateError::QueuePublish("broker down".into());
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(TollgateError::Rail("timeout".into()).is_retryable());
    }

    #[test]
    fn test_insufficient_balance_is_payment_required() {
        let (status, body) = TollgateError::InsufficientBalance {
            required: Decimal::TEN,
            available: Decimal::ONE,
        }
        .into_status_code_and_body();
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body.code, "insufficient-balance");
        assert!(!body.retryable);
    }
}
