//! Client error types.

use submap_core::GatewayError;
use thiserror::Error;

/// HTTP client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request could not be built or sent, or timed out.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote answered with a non-success status.
    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body did not have the expected shape.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ClientError {
    /// HTTP status of the response, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Http(err) => err.status().map(|s| s.as_u16()),
            ClientError::Decode(_) => None,
        }
    }
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Http(err) => GatewayError::Transport(err.to_string()),
            ClientError::Status { status, message } => GatewayError::Status { status, message },
            ClientError::Decode(message) => GatewayError::Decode(message),
        }
    }
}
