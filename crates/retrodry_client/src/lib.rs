//! # RetroDRY Client
//!
//! The client side of RetroDRY. A [`Session`] keeps a pristine copy of
//! every daton it loaded, hands out editable copies, turns edits into
//! diffs on save, tracks lock and subscription state per key and keeps one
//! long-poll outstanding so pushed changes land in the cache.
//!
//! This crate provides:
//! - [`Session`]: get, save, subscribe and quit
//! - [`FifoMutex`]: the async FIFO lock guarding the session cache
//! - [`RetroTransport`] / [`HttpTransport`]: the seam to the servers, with
//!   server-list failover over any [`HttpClient`]
//! - [`LoopbackClient`]: routes requests into an in-process server
//!
//! ## Usage
//!
//! ```
//! use retrodry_client::{DatonCache, FifoMutex};
//! use retrodry_core::{Daton, DatonKey, Row};
//! use retrodry_protocol::SubscribeState;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mutex = FifoMutex::new();
//! let mut cache = DatonCache::new();
//! let key = DatonKey::row("Widget", 1);
//! {
//!     let _guard = mutex.acquire().await;
//!     cache.store(Daton::new(key.clone(), vec![Row::new().with("WidgetId", 1)]));
//!     cache.set_state(&key, SubscribeState::Subscribed);
//! }
//! assert!(cache.merge_push(Daton::new(key.clone(), vec![Row::new().with("WidgetId", 1)])));
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod cache;
mod config;
mod error;
mod mutex;
mod session;
mod transport;

pub use cache::{CacheEntry, DatonCache};
pub use config::{RetryConfig, SessionConfig};
pub use error::{ClientError, ClientResult};
pub use mutex::{FifoGuard, FifoMutex};
pub use session::{GetOptions, SaveOutcome, Session, SessionEvent};
pub use transport::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer, RetroTransport};
