//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_core::GatewayError;
use serde::Serialize;
use thiserror::Error;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] relay_storage::StorageError),

    /// Account store error.
    #[error(transparent)]
    Store(#[from] relay_core::StoreError),

    /// Chat gateway error.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::Storage(_) | ApiError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
            }
            ApiError::Gateway(err) => match err {
                GatewayError::NoAccountAvailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "no_account_available")
                }
                GatewayError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "account_not_found"),
                GatewayError::AccountProviderMismatch { .. } => {
                    (StatusCode::BAD_REQUEST, "account_provider_mismatch")
                }
                GatewayError::AdapterNotFound(_) => (StatusCode::BAD_REQUEST, "unknown_provider"),
                GatewayError::UnknownModel(_) => (StatusCode::BAD_REQUEST, "unknown_model"),
                GatewayError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
                GatewayError::Adapter(_) | GatewayError::Upstream(_) => {
                    (StatusCode::BAD_GATEWAY, "upstream_error")
                }
                GatewayError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
