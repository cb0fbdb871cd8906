//! Error types for the Local Volume Engine
//!
//! One taxonomy shared by the primitive driver, the node agent protocol,
//! the scheduler client and the controller/node services. Every variant
//! collapses onto a stable [`ErrorCode`] that travels over the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Unavailable: {target} - {reason}")]
    Unavailable { target: String, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command failed: {command} - {reason}")]
    Command { command: String, reason: String },

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    #[error("{operation} {target}: {source}")]
    Context {
        operation: String,
        target: String,
        #[source]
        source: Box<Error>,
    },
}

/// Stable classification of an [`Error`], shared with remote callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
    Unimplemented,
    Aborted,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Internal => "internal",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Action a caller should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the whole operation later
    RetryWithBackoff,
    /// Caller must change the request or the environment
    NoRetry,
}

impl Error {
    /// Construct a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Construct a transport error
    pub fn unavailable(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Unavailable {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Rebuild an error from a code received over the wire
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::InvalidArgument => Error::InvalidArgument(message),
            ErrorCode::NotFound => Error::NotFound {
                kind: "remote".into(),
                name: message,
            },
            ErrorCode::Conflict => Error::Conflict(message),
            ErrorCode::Unavailable => Error::Unavailable {
                target: "remote".into(),
                reason: message,
            },
            ErrorCode::Internal => Error::Internal(message),
            ErrorCode::Unimplemented => Error::Unimplemented(message),
            ErrorCode::Aborted => Error::Aborted(message),
        }
    }

    /// Wrap with the operation name and target identifiers
    pub fn context(self, operation: impl Into<String>, target: impl Into<String>) -> Self {
        Error::Context {
            operation: operation.into(),
            target: target.into(),
            source: Box::new(self),
        }
    }

    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) | Error::CapacityParse(_) => ErrorCode::InvalidArgument,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::Unimplemented(_) => ErrorCode::Unimplemented,
            Error::Aborted(_) => ErrorCode::Aborted,
            Error::Unavailable { .. } => ErrorCode::Unavailable,
            Error::Internal(_)
            | Error::Configuration(_)
            | Error::Command { .. }
            | Error::JsonParse(_)
            | Error::Io(_) => ErrorCode::Internal,
            Error::Context { source, .. } => source.code(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.code() {
            ErrorCode::Unavailable => ErrorAction::RetryWithBackoff,
            _ => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.code() == ErrorCode::Unavailable
    }

    /// Check if this error means the target does not exist
    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
