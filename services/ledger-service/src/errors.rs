use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Amount must be positive with at most 8 decimal places, got {0}")]
    InvalidAmount(Decimal),

    #[error("Transaction already processed: {0}")]
    DuplicateTransaction(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Balance lock unavailable for user {uid}: {reason}")]
    LockUnavailable { uid: String, reason: String },

    #[error("Balance lock lost before commit for user {0}")]
    LockLost(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Persistence(err.to_string())
    }
}

impl ResponseError for LedgerError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let error_message = self.to_string();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            LedgerError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            LedgerError::DuplicateTransaction(_) => StatusCode::CONFLICT,
            LedgerError::UserNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::InvalidPagination(_) => StatusCode::BAD_REQUEST,
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::LockUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            LedgerError::LockLost(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LedgerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl LedgerError {
    pub fn error_type(&self) -> &str {
        match self {
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::DuplicateTransaction(_) => "duplicate_transaction",
            LedgerError::UserNotFound(_) => "not_found",
            LedgerError::InvalidPagination(_) => "invalid_pagination",
            LedgerError::Validation(_) => "validation_error",
            LedgerError::LockUnavailable { .. } => "lock_unavailable",
            LedgerError::LockLost(_) => "lock_lost",
            LedgerError::Persistence(_) => "persistence_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            LedgerError::InvalidAmount(dec!(-5)).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LedgerError::DuplicateTransaction("tx-1".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            LedgerError::UserNotFound("u1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            LedgerError::LockUnavailable {
                uid: "u1".into(),
                reason: "timed out".into(),
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            LedgerError::Persistence("connection reset".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_non_database_sqlx_error_is_persistence() {
        let err: LedgerError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert_eq!(err.error_type(), "persistence_error");
    }
}
