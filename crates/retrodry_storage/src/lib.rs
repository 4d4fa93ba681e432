//! # RetroDRY Storage
//!
//! Persistence seams for the RetroDRY coordinator.
//!
//! - [`SqlDatabase`] runs the [`SqlCommand`](retrodry_core::SqlCommand)s
//!   produced by the core write planner inside a transaction and answers
//!   keyed row reads.
//! - [`CoordinationStore`] holds the state every server instance must
//!   share: sessions, locks and subscriptions, version tokens and the
//!   change log.
//!
//! Both come with in-memory implementations that can be shared between
//! several coordinator instances in one process.
//!
//! ## Usage
//!
//! ```
//! use chrono::Utc;
//! use retrodry_core::DatonKey;
//! use retrodry_storage::{CoordinationStore, InMemoryCoordinationStore, LockOutcome, SessionRecord};
//!
//! let store = InMemoryCoordinationStore::new();
//! for id in ["session-a", "session-b"] {
//!     store.create_session(SessionRecord {
//!         id: id.to_string(),
//!         user: "alice".to_string(),
//!         roles: Vec::new(),
//!         language: "en".to_string(),
//!         last_activity: Utc::now(),
//!         cursor: 0,
//!     }).unwrap();
//! }
//! let key = DatonKey::row("Customer", 1);
//! assert_eq!(store.try_lock(&key, "session-a").unwrap(), LockOutcome::Acquired);
//! assert!(!store.try_lock(&key, "session-b").unwrap().is_held());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod coordination;
mod database;
mod error;
mod memory;

pub use coordination::{
    Change, ChangeBatch, ChangeRecord, CoordinationStore, InMemoryCoordinationStore, LockOutcome,
    SessionRecord, SubscribeMode, DEFAULT_CHANGE_CAPACITY,
};
pub use database::{compare_values, values_equal, RowQuery, SqlDatabase, SqlTransaction, StoredRow};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryDatabase;
