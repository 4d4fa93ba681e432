//! Error types for the coordinator.

use retrodry_core::{CoreError, DatonKey, FieldError};
use retrodry_protocol::{ErrorCode, ItemError};
use retrodry_storage::StorageError;
use thiserror::Error;

/// Result type for coordinator operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while serving a request or one item of a batch.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Unknown or ended session, or rejected credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No such daton or daton type.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another session holds the lock.
    #[error("{key} is locked by another session")]
    LockConflict {
        /// Contested key.
        key: DatonKey,
    },

    /// The diff was computed against an older version.
    #[error("{key} was changed since it was read")]
    VersionConflict {
        /// Stale key.
        key: DatonKey,
    },

    /// The user may not see or change something.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Field-level validation failed.
    #[error("validation failed with {} error(s)", .0.len())]
    Validation(Vec<FieldError>),

    /// The request is well-formed JSON but makes no sense.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Schema, key or wire error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Database or coordination store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Storage(_) | ServerError::Internal(_))
    }

    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Auth(_) => ErrorCode::AuthError,
            ServerError::NotFound(_) => ErrorCode::NotFound,
            ServerError::LockConflict { .. } => ErrorCode::LockConflict,
            ServerError::VersionConflict { .. } => ErrorCode::VersionConflict,
            ServerError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            ServerError::Validation(_) => ErrorCode::ValidationFailed,
            ServerError::InvalidRequest(_) => ErrorCode::BadRequest,
            ServerError::Core(err) => ItemError::from(err.clone()).code,
            ServerError::Storage(_) => ErrorCode::StorageFailure,
            ServerError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Converts to a wire error. Storage text is replaced by `storage_message`.
    pub fn to_item_error(&self, storage_message: impl FnOnce(&StorageError) -> String) -> ItemError {
        match self {
            ServerError::Validation(errors) => ItemError::validation(errors.clone()),
            ServerError::Storage(err) => ItemError::new(ErrorCode::StorageFailure, storage_message(err)),
            other => ItemError::new(other.code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::Auth("expired".into()).is_client_error());
        assert!(ServerError::Storage(StorageError::Backend("down".into())).is_server_error());
        assert!(!ServerError::NotFound("x".into()).is_server_error());
    }

    #[test]
    fn storage_text_is_replaced() {
        let err = ServerError::Storage(StorageError::Constraint("FK_Customer_Secret violated".into()));
        let item = err.to_item_error(|_| "could not save".to_string());
        assert_eq!(item.code, ErrorCode::StorageFailure);
        assert_eq!(item.message, "could not save");
    }

    #[test]
    fn core_errors_keep_their_code() {
        let err = ServerError::from(CoreError::malformed_key("truncated escape"));
        assert_eq!(err.code(), ErrorCode::MalformedKey);
        let err = ServerError::LockConflict {
            key: DatonKey::row("Customer", 1),
        };
        assert_eq!(err.to_item_error(|_| String::new()).message, "Customer|=1 is locked by another session");
    }
}
