//! Error types for client sessions.

use retrodry_core::{CoreError, DatonKey};
use retrodry_protocol::{ErrorCode, ItemError};
use thiserror::Error;

/// Result type for session operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised by a [`Session`](crate::Session).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The reply could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the request or item.
    #[error("{}: {}", .0.code, .0.message)]
    Server(ItemError),

    /// Schema, key or wire error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The operation needs a cached pristine copy that is not there.
    #[error("{0} is not cached in this session")]
    NotCached(DatonKey),

    /// The session has quit or was ended by the server.
    #[error("session ended")]
    Ended,

    /// No reply within the request timeout.
    #[error("request timed out")]
    Timeout,
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Server(item) => item.code,
            ClientError::Transport { .. } | ClientError::Timeout => ErrorCode::TransportFailure,
            ClientError::Core(err) => ItemError::from(err.clone()).code,
            ClientError::Ended => ErrorCode::AuthError,
            ClientError::NotCached(_) | ClientError::Protocol(_) => ErrorCode::BadRequest,
        }
    }

    /// Returns true if the session is no longer usable.
    pub fn is_session_ended(&self) -> bool {
        matches!(self, ClientError::Ended) || self.code() == ErrorCode::AuthError
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::Timeout => true,
            ClientError::Server(item) => item.code.is_retryable(),
            _ => false,
        }
    }
}

impl From<ItemError> for ClientError {
    fn from(err: ItemError) -> Self {
        ClientError::Server(err)
    }
}
