//! Core error types.

use std::fmt;

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::model::RunId;
use crate::sequence::MappingError;

/// Core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Run store or identity source database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No sequence mapping for a messageset.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Remote subscription service or contact directory error.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The identity source returned a value that is not an identity key.
    #[error("identity source error: {0}")]
    Source(String),

    /// A table or column name is not a plain SQL identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A migration request failed validation.
    #[error("invalid migration run: {0}")]
    InvalidRun(String),

    /// The sequence mapping table could not be loaded.
    #[error("invalid mapping table: {0}")]
    MappingTable(String),

    /// Migration run does not exist.
    #[error("migration run {0} not found")]
    RunNotFound(RunId),

    /// A conditional status transition lost a race or was not allowed.
    #[error("{0}")]
    Conflict(String),

    /// A persisted row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The dispatcher can no longer accept work.
    #[error("dispatch error: {0}")]
    Dispatch(String),
}

impl Error {
    /// Stable label for the error class, recorded in failure log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::Mapping(_) => "no_mapping",
            Error::Gateway(_) => "gateway",
            Error::Source(_) => "identity_source",
            Error::InvalidIdentifier(_) => "invalid_identifier",
            Error::InvalidRun(_) => "invalid_run",
            Error::MappingTable(_) => "mapping_table",
            Error::RunNotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Corrupt(_) => "corrupt",
            Error::Dispatch(_) => "dispatch",
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured capture of a failure, written to the run's log when a
/// migration aborts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Error class label.
    pub kind: &'static str,
    /// Top-level message.
    pub message: String,
    /// Messages of the underlying causes, outermost first.
    pub causes: Vec<String>,
}

impl ErrorContext {
    /// Capture the kind, message and cause chain of an error.
    pub fn capture(err: &Error) -> Self {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            causes.push(cause.to_string().trim().to_string());
            source = cause.source();
        }

        Self {
            kind: err.kind(),
            message: err.to_string().trim().to_string(),
            causes,
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]: {}.", self.kind, self.message)?;
        for cause in &self.causes {
            write!(f, "\ncaused by: {cause}")?;
        }
        Ok(())
    }
}
