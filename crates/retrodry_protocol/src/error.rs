//! Error codes carried on the wire and protocol decoding errors.

use retrodry_core::{CoreError, FieldError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for protocol encoding and decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The body is not valid JSON for the expected message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The path does not name a protocol endpoint.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidMessage(err.to_string())
    }
}

/// Machine-readable failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A daton key string could not be parsed.
    MalformedKey,
    /// The session is unknown, expired or the credential was rejected.
    AuthError,
    /// No daton exists for the key, or the type is unknown.
    NotFound,
    /// Another session holds the lock.
    LockConflict,
    /// The save was based on a stale version.
    VersionConflict,
    /// A table or column is not visible or not modifiable.
    PermissionDenied,
    /// Field-level validation failed.
    ValidationFailed,
    /// The request never reached a server or timed out.
    TransportFailure,
    /// The database rejected the write; the message is sanitized.
    StorageFailure,
    /// The request body could not be understood.
    BadRequest,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// Returns true if retrying the same request may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::TransportFailure | ErrorCode::StorageFailure)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An error reported for one item of a batch, or for a whole request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "PascalCase")]
#[error("{code}: {message}")]
pub struct ItemError {
    /// Failure class.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Per-field messages for [`ErrorCode::ValidationFailed`] and
    /// [`ErrorCode::PermissionDenied`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
}

impl ItemError {
    /// Creates an error without field details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field_errors: Vec::new(),
        }
    }

    /// Creates a validation failure from field errors.
    pub fn validation(field_errors: Vec<FieldError>) -> Self {
        let message = match field_errors.len() {
            1 => field_errors[0].to_string(),
            n => format!("{n} validation errors"),
        };
        Self {
            code: ErrorCode::ValidationFailed,
            message,
            field_errors,
        }
    }

    /// Creates an [`ErrorCode::AuthError`].
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthError, message)
    }

    /// Creates an [`ErrorCode::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Creates an [`ErrorCode::TransportFailure`].
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportFailure, message)
    }
}

impl From<CoreError> for ItemError {
    fn from(err: CoreError) -> Self {
        let code = match &err {
            CoreError::MalformedKey { .. } => ErrorCode::MalformedKey,
            CoreError::UnknownDatonType { .. } => ErrorCode::NotFound,
            CoreError::InvalidWire { .. }
            | CoreError::TypeMismatch { .. }
            | CoreError::UnexpectedKey { .. }
            | CoreError::Json(_) => ErrorCode::BadRequest,
            CoreError::InvalidSchema { .. } | CoreError::DiffMismatch { .. } => ErrorCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}
