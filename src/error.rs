//! Error taxonomy, section 7. Every fallible operation in this crate
//! resolves to one of these kinds; handlers translate them to the wire
//! shape `{ "error": "<kind>", "error_description": "<message>" }` and
//! never forward a raw database or crypto library message to a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid_request: {0}")]
    InvalidRequest(String),

    #[error("invalid_grant: {0}")]
    InvalidGrant(String),

    #[error("unauthorized_client")]
    UnauthorizedClient,

    #[error("invalid_client")]
    InvalidClient,

    #[error("rate limited")]
    RateLimited,

    #[error("otp step-up required")]
    OtpRequired,

    #[error("crypto error")]
    Crypto,

    #[error("internal error")]
    Internal,
}

impl AppError {
    /// The `error` field of the wire shape (section 6).
    fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::InvalidGrant(_) => "invalid_grant",
            AppError::UnauthorizedClient => "unauthorized_client",
            AppError::InvalidClient => "invalid_client",
            AppError::RateLimited => "rate_limited",
            AppError::OtpRequired => "otp_required",
            AppError::Crypto => "server_error",
            AppError::Internal => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidGrant(_) => StatusCode::BAD_REQUEST,
            AppError::UnauthorizedClient => StatusCode::UNAUTHORIZED,
            AppError::InvalidClient => StatusCode::UNAUTHORIZED,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::OtpRequired => StatusCode::FORBIDDEN,
            AppError::Crypto => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `Crypto`/`Internal` never leak their cause; everything else is safe
    /// to echo back verbatim (section 7 propagation policy).
    fn description(&self) -> String {
        match self {
            AppError::Crypto | AppError::Internal => "an internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    error_description: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Crypto | AppError::Internal) {
            // Correlation ids are attached by the tracing span the handler
            // runs in; the raw cause is logged there, never here.
            tracing::error!(error = %self, "internal failure surfaced to client");
        }
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            error_description: self.description(),
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::debug!(%err, "sqlite error");
        AppError::Internal
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::debug!(%err, "json error");
        AppError::Validation("malformed json body".to_string())
    }
}
