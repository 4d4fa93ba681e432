//! # RetroDRY Server
//!
//! The coordinator side of RetroDRY: sessions, pessimistic locks,
//! permission-filtered reads, validated transactional saves and long-poll
//! change delivery.
//!
//! This crate provides:
//! - [`Coordinator`]: every session-scoped operation
//! - [`RequestHandler`]: maps `/api/...` JSON requests to the coordinator
//! - [`RetroServer`]: a coordinator plus its change pump and idle reaper
//! - hooks: [`Authenticator`], [`ErrorSanitizer`], [`RowFilter`]
//!
//! # Scale-out
//!
//! Coordinators keep no durable state. Sessions, locks, version tokens and
//! the change log live in a shared [`CoordinationStore`]; run as many
//! instances over one store as needed. Lock acquisition is a single
//! compare-and-set in the store, and saves made on one instance reach
//! long-polls held on another within one propagation interval.
//!
//! # Usage
//!
//! ```
//! use retrodry_core::{ColDef, DataDictionary, DatonDef, DatonKey, TableDef, Value, WireType};
//! use retrodry_server::{Coordinator, CoordinatorConfig, User};
//! use retrodry_storage::{InMemoryCoordinationStore, InMemoryDatabase};
//! use std::sync::Arc;
//!
//! let db = InMemoryDatabase::new();
//! db.seed("Widget", "WidgetId", [("Notes", Value::from("Has 6 sides"))]);
//! let dictionary = DataDictionary::new().with(
//!     DatonDef::persiston(
//!         "Widget",
//!         TableDef::new("Widget")
//!             .primary_key("WidgetId")
//!             .column(ColDef::new("WidgetId", WireType::Int32))
//!             .column(ColDef::new("Notes", WireType::Text)),
//!     )
//!     .build()
//!     .unwrap(),
//! );
//! let coordinator = Coordinator::new(
//!     CoordinatorConfig::default(),
//!     Arc::new(dictionary),
//!     Arc::new(db),
//!     Arc::new(InMemoryCoordinationStore::new()),
//! );
//! let session = coordinator.create_session(&User::new("alice"), None).unwrap();
//! let widget = coordinator.get_daton(&DatonKey::row("Widget", 1), &session).unwrap();
//! assert_eq!(widget.daton.main_row().unwrap().value("Notes").as_str(), Some("Has 6 sides"));
//! ```
//!
//! [`CoordinationStore`]: retrodry_storage::CoordinationStore

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod coordinator;
mod error;
mod handler;
mod loader;
mod permissions;
mod sanitize;
mod server;

pub use auth::{Authenticator, StaticAuthenticator, User};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, SavedDaton, VisibleDaton};
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use loader::DatonLoader;
pub use permissions::{filter_daton, restricted_def, RowFilter};
pub use sanitize::{ErrorSanitizer, GenericSanitizer};
pub use server::RetroServer;
