use crate::gateway::GatewayError;
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Malformed token: {0}")]
    TokenMalformed(String),

    #[error("User is inactive or no longer exists")]
    UserInactive,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Settlement gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Settlement gateway error: {0}")]
    Gateway(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                EngineError::Conflict(db.message().to_string())
            }
            _ => EngineError::Database(err.to_string()),
        }
    }
}

impl From<ledger_core::Error> for EngineError {
    fn from(err: ledger_core::Error) -> Self {
        use ledger_core::Error as LedgerError;

        match err {
            LedgerError::FundNotFound(id) => EngineError::NotFound(format!("Fund {}", id)),
            LedgerError::TransactionNotFound(id) => {
                EngineError::NotFound(format!("Transaction {}", id))
            }
            LedgerError::InsufficientBalance {
                requested,
                available,
                ..
            } => EngineError::InsufficientBalance {
                requested,
                available,
            },
            e @ LedgerError::FundNotActive { .. } => EngineError::Validation(e.to_string()),
            LedgerError::InvalidAmount(msg) => EngineError::Validation(msg),
            LedgerError::InvalidFund(msg) => EngineError::Validation(msg),
            LedgerError::Storage(msg) => EngineError::Database(msg),
            e @ (LedgerError::TransactionNotPending { .. }
            | LedgerError::ReservationResolved(_)) => EngineError::Conflict(e.to_string()),
            e @ LedgerError::InvariantViolation(_) => EngineError::Internal(e.to_string()),
        }
    }
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => EngineError::GatewayUnavailable(msg),
            GatewayError::NotFound(what) => EngineError::NotFound(what),
            e @ (GatewayError::Rejected(_) | GatewayError::Protocol(_)) => {
                EngineError::Gateway(e.to_string())
            }
        }
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(err: validator::ValidationErrors) -> Self {
        EngineError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl ResponseError for EngineError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        // Storage and internal detail stays in the logs
        let message = match self {
            EngineError::Database(_) | EngineError::Internal(_) => {
                tracing::error!("Request failed: {}", self);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        HttpResponse::build(status_code).json(json!({
            "success": false,
            "message": message,
            "error": {
                "code": status_code.as_u16(),
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EngineError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            EngineError::TokenExpired => StatusCode::UNAUTHORIZED,
            EngineError::TokenMalformed(_) => StatusCode::UNAUTHORIZED,
            EngineError::UserInactive => StatusCode::UNAUTHORIZED,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::InsufficientBalance { .. } => StatusCode::BAD_REQUEST,
            EngineError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Gateway(_) => StatusCode::BAD_GATEWAY,
            EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl EngineError {
    pub fn error_type(&self) -> &str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::InvalidCredentials => "invalid_credentials",
            EngineError::TokenExpired => "token_expired",
            EngineError::TokenMalformed(_) => "token_malformed",
            EngineError::UserInactive => "user_inactive",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InsufficientBalance { .. } => "insufficient_balance",
            EngineError::GatewayUnavailable(_) => "gateway_unavailable",
            EngineError::Gateway(_) => "gateway_error",
            EngineError::Database(_) => "database_error",
            EngineError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[test]
    fn test_ledger_error_mapping() {
        let err: EngineError = ledger_core::Error::InsufficientBalance {
            fund_id: Uuid::new_v4(),
            requested: dec!(50),
            available: dec!(40),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "insufficient_balance");

        let err: EngineError = ledger_core::Error::FundNotFound(Uuid::new_v4()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: EngineError = ledger_core::Error::TransactionNotPending {
            transaction_id: Uuid::new_v4(),
            status: ledger_core::TransactionStatus::Completed,
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: EngineError = ledger_core::Error::Storage("pool timed out".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_gateway_error_mapping() {
        let err: EngineError = GatewayError::Unavailable("connection refused".into()).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: EngineError = GatewayError::Protocol("bad hex".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn test_internal_detail_not_leaked() {
        let err = EngineError::Database("password authentication failed".into());
        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Internal server error");
        assert_eq!(body["error"]["code"], 500);
        assert_eq!(body["error"]["type"], "database_error");
    }
}
