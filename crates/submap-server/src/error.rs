//! Error handling for the HTTP service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use submap_core::{Error, OptoutError};
use thiserror::Error;
use tracing::error;

/// Errors returned by route handlers.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Missing or unknown API token.
    #[error("Authentication credentials were not provided or are invalid.")]
    Unauthorized,

    /// Resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Requested action is not allowed in the run's current state.
    #[error("{0}")]
    Conflict(String),

    /// Optout contact cannot be reverted.
    #[error("{0}")]
    InvalidContact(String),

    /// A remote service failed.
    #[error("{0}")]
    Upstream(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error flag.
    pub error: bool,
    /// Error code.
    pub code: &'static str,
    /// Error message.
    pub message: String,
}

impl ServerError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "not_authenticated"),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ServerError::Conflict(_) => (StatusCode::BAD_REQUEST, "conflict"),
            ServerError::InvalidContact(_) => (StatusCode::BAD_REQUEST, "invalid_rapidpro_contact"),
            ServerError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        if status.is_server_error() {
            error!(code, error = %self, "request failed");
        }

        let body = ErrorResponse {
            error: true,
            code,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        match err {
            Error::RunNotFound(_) => ServerError::NotFound(err.to_string()),
            Error::Conflict(message) => ServerError::Conflict(message),
            Error::InvalidIdentifier(_) | Error::InvalidRun(_) => {
                ServerError::BadRequest(err.to_string())
            }
            Error::Gateway(_) => ServerError::Upstream(err.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<OptoutError> for ServerError {
    fn from(err: OptoutError) -> Self {
        match err {
            OptoutError::ContactNotFound(_) => ServerError::NotFound(err.to_string()),
            OptoutError::InvalidContact(message) => ServerError::InvalidContact(message),
            OptoutError::Internal(err) => err.into(),
        }
    }
}
