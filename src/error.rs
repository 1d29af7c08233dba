use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors raised by the settlement core: state machine guards, currency
/// resolution, provider calls and persistence.
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("invalid state transition for {entity} {id}: expected {expected}, found {actual}")]
    InvalidStateTransition {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("transfer guard failed for transaction {id}: {reason}")]
    TransferGuard { id: String, reason: String },

    #[error("gave up after {attempts} attempts on conflicting transactions: {last_error}")]
    DeadlockExceeded { attempts: u32, last_error: String },

    #[error("payment provider unreachable: {0}")]
    ProviderConnection(String),

    #[error("payment provider rejected request: {0}")]
    ProviderInvalidRequest(String),

    #[error("insufficient balance: need {required} {currency}, no funding currency can cover it")]
    InsufficientBalance { currency: String, required: String },

    #[error("exchange rate unavailable for {base}->{target}: {reason}")]
    ExchangeRateUnavailable {
        base: String,
        target: String,
        reason: String,
    },

    #[error("webhook signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("marketplace collaborator failed: {0}")]
    Collaborator(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SettlementError {
    pub fn invalid_transition(
        entity: &'static str,
        id: impl ToString,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        SettlementError::InvalidStateTransition {
            entity,
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        let message = err.to_string();
        match err {
            SettlementError::InvalidStateTransition { .. } | SettlementError::TransferGuard { .. } => {
                AppError::Conflict(message)
            }
            SettlementError::NotFound(_) => AppError::NotFound(message),
            SettlementError::Validation(_) | SettlementError::InvalidPayload(_) => {
                AppError::Validation(message)
            }
            SettlementError::SignatureVerificationFailed(_) => AppError::BadRequest(message),
            SettlementError::DeadlockExceeded { .. } => AppError::Unavailable(message),
            SettlementError::InsufficientBalance { .. }
            | SettlementError::ExchangeRateUnavailable { .. } => AppError::Unprocessable(message),
            SettlementError::ProviderConnection(_)
            | SettlementError::ProviderInvalidRequest(_)
            | SettlementError::Collaborator(_) => AppError::BadGateway(message),
            SettlementError::Database(e) => AppError::Database(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        }
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_status_code() {
        let error = AppError::Validation("Invalid input".to_string());
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_error_status_code() {
        let error = AppError::NotFound("Resource not found".to_string());
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_database_error_status_code() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_invalid_transition_maps_to_conflict() {
        let error: AppError =
            SettlementError::invalid_transition("transaction", "tx-1", "held", "pending").into();
        assert_eq!(error.status_code(), StatusCode::CONFLICT);
        assert!(error.to_string().contains("expected held, found pending"));
    }

    #[test]
    fn test_currency_failures_are_unprocessable_but_distinct() {
        let insufficient: AppError = SettlementError::InsufficientBalance {
            currency: "usd".to_string(),
            required: "10.00".to_string(),
        }
        .into();
        let unavailable: AppError = SettlementError::ExchangeRateUnavailable {
            base: "usd".to_string(),
            target: "eur".to_string(),
            reason: "stale".to_string(),
        }
        .into();

        assert_eq!(insufficient.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(unavailable.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(insufficient.to_string().contains("insufficient balance"));
        assert!(unavailable.to_string().contains("exchange rate unavailable"));
    }

    #[test]
    fn test_deadlock_maps_to_service_unavailable() {
        let error: AppError = SettlementError::DeadlockExceeded {
            attempts: 3,
            last_error: "deadlock detected".to_string(),
        }
        .into();
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_signature_failure_is_bad_request() {
        let error: AppError =
            SettlementError::SignatureVerificationFailed("missing header".to_string()).into();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_not_found_error_response() {
        let error = AppError::NotFound("Payout not found".to_string());
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
