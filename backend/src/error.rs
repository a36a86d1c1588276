use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Rejections of caller input. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Repay scheme {0} invalid")]
    InvalidRepayScheme(String),

    #[error("Payout invoice is non-zero ({0} sats)")]
    NonZeroInvoice(i64),

    #[error("Payout invoice expires too soon: {expiry}s, need at least {required}s")]
    PayoutExpiry { expiry: i64, required: i64 },

    #[error("Malformed payout invoice: {0}")]
    MalformedInvoice(String),

    #[error("Poll needs at least one option")]
    NoOptions,

    #[error("Option {option_id} does not belong to poll {poll_id}")]
    UnknownOption { poll_id: i64, option_id: i64 },

    #[error("Poll {0} is not accepting votes")]
    PollNotOpen(i64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Store-level failures of the compare-and-swap write contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} is not in status {expected}")]
    Conflict {
        entity: &'static str,
        id: i64,
        expected: String,
    },

    #[error("Unexpected number of rows updated for {entity} {id}: {rows}")]
    UnexpectedRowCount {
        entity: &'static str,
        id: i64,
        rows: u64,
    },

    #[error("Duplicate payment hash: {0}")]
    DuplicatePaymentHash(String),
}

/// Failures talking to the payment node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Node returned {status}: {message}")]
    Rpc { status: u16, message: String },

    #[error("Malformed node response: {0}")]
    Decode(String),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Subscription stream closed")]
    StreamClosed,
}

impl AppError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
        .into()
    }

    /// Conditional update lost the race (or already happened).
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Ledger(LedgerError::Conflict { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::Ledger(LedgerError::NotFound { .. }))
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Validation(e) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
                e.to_string(),
                None,
            ),
            AppError::Ledger(LedgerError::NotFound { entity, id }) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                self.to_string(),
                Some(serde_json::json!({ "entity": entity, "id": id })),
            ),
            AppError::Ledger(LedgerError::Conflict { entity, id, expected }) => (
                StatusCode::CONFLICT,
                "STATUS_CONFLICT",
                self.to_string(),
                Some(serde_json::json!({
                    "entity": entity,
                    "id": id,
                    "expected": expected,
                })),
            ),
            AppError::Gateway(GatewayError::PaymentFailed(reason)) => (
                StatusCode::BAD_GATEWAY,
                "PAYMENT_FAILED",
                format!("Payment failed: {}", reason),
                None,
            ),
            AppError::Gateway(_) => (
                StatusCode::BAD_GATEWAY,
                "GATEWAY_ERROR",
                "The payment node could not be reached".to_string(),
                None,
            ),
            AppError::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CANCELLED",
                "Service is shutting down".to_string(),
                None,
            ),
            AppError::DeadlineExceeded => (
                StatusCode::GATEWAY_TIMEOUT,
                "DEADLINE_EXCEEDED",
                "The request took too long".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Gateway(GatewayError::Transport(error.to_string()))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
