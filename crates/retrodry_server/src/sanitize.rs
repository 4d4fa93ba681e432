//! Storage error sanitizing.
//!
//! Raw database messages can name tables, constraints or values the user
//! may not see, so they never go on the wire as-is.

use retrodry_storage::StorageError;

/// Rewrites a storage failure into a message safe to show a client.
pub trait ErrorSanitizer: Send + Sync {
    /// Returns the client-facing text for `err`.
    fn sanitize(&self, err: &StorageError) -> String;
}

/// Replaces every storage error with one generic sentence.
#[derive(Debug, Clone)]
pub struct GenericSanitizer {
    message: String,
}

impl GenericSanitizer {
    /// Uses `message` for every failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for GenericSanitizer {
    fn default() -> Self {
        Self::new("the change could not be stored")
    }
}

impl ErrorSanitizer for GenericSanitizer {
    fn sanitize(&self, err: &StorageError) -> String {
        if err.is_retryable() {
            format!("{}; try again", self.message)
        } else {
            self.message.clone()
        }
    }
}

impl<F> ErrorSanitizer for F
where
    F: Fn(&StorageError) -> String + Send + Sync,
{
    fn sanitize(&self, err: &StorageError) -> String {
        self(err)
    }
}
