//! Authentication seam.
//!
//! The coordinator never checks passwords or tokens itself. An
//! [`Authenticator`] turns the credential a client presents at session start
//! into a [`User`]; everything after that is keyed by session id.

use crate::error::{ServerError, ServerResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// User id.
    pub id: String,
    /// Role names used for permission resolution.
    pub roles: Vec<String>,
}

impl User {
    /// Creates a user.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    /// Adds a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// Resolves a credential to a user.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the user for `credential`, or [`ServerError::Auth`].
    async fn authenticate(&self, credential: &str) -> ServerResult<User>;
}

/// Authenticator backed by a fixed credential table.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    users: RwLock<HashMap<String, User>>,
}

impl StaticAuthenticator {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a credential.
    pub fn with_user(self, credential: impl Into<String>, user: User) -> Self {
        self.insert(credential, user);
        self
    }

    /// Registers a credential on a shared authenticator.
    pub fn insert(&self, credential: impl Into<String>, user: User) {
        self.users.write().insert(credential.into(), user);
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credential: &str) -> ServerResult<User> {
        self.users
            .read()
            .get(credential)
            .cloned()
            .ok_or_else(|| ServerError::Auth("invalid credential".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credentials() {
        let auth = StaticAuthenticator::new().with_user("t1", User::new("alice").with_role("clerk"));
        let user = auth.authenticate("t1").await.unwrap();
        assert_eq!(user.roles, vec!["clerk".to_string()]);
        assert!(matches!(auth.authenticate("nope").await, Err(ServerError::Auth(_))));
    }
}
