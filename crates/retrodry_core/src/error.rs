//! Error types for the core crate.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by schema construction, key parsing, the wire codec and the
/// diff engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A daton key string could not be parsed.
    #[error("malformed daton key: {message}")]
    MalformedKey {
        /// Description of the problem.
        message: String,
    },

    /// The schema definition is inconsistent.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// No daton type with this name is registered.
    #[error("unknown daton type: {name}")]
    UnknownDatonType {
        /// Name that was looked up.
        name: String,
    },

    /// A JSON document does not match the expected wire shape.
    #[error("invalid wire format: {message}")]
    InvalidWire {
        /// Description of the problem.
        message: String,
    },

    /// A value does not match the declared wire type of its column.
    #[error("type mismatch in column {column}: expected {expected}")]
    TypeMismatch {
        /// Column name.
        column: String,
        /// Expected wire type.
        expected: String,
    },

    /// Strict decoding found a key not declared by the schema.
    #[error("unexpected key in strict mode: {key}")]
    UnexpectedKey {
        /// The offending key.
        key: String,
    },

    /// A diff does not apply to the target daton.
    #[error("diff does not apply: {message}")]
    DiffMismatch {
        /// Description of the problem.
        message: String,
    },

    /// JSON text could not be parsed.
    #[error("json error: {0}")]
    Json(String),
}

impl CoreError {
    /// Create a malformed key error.
    pub fn malformed_key(message: impl Into<String>) -> Self {
        Self::MalformedKey {
            message: message.into(),
        }
    }

    /// Create an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Create an invalid wire error.
    pub fn invalid_wire(message: impl Into<String>) -> Self {
        Self::InvalidWire {
            message: message.into(),
        }
    }

    /// Create a type mismatch error.
    pub fn type_mismatch(column: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::TypeMismatch {
            column: column.into(),
            expected: expected.into(),
        }
    }

    /// Create a diff mismatch error.
    pub fn diff_mismatch(message: impl Into<String>) -> Self {
        Self::DiffMismatch {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
