//! # RetroDRY Testkit
//!
//! Test utilities for RetroDRY.
//!
//! This crate provides:
//! - A sample data dictionary covering every daton kind, seeded data and users
//! - A multi-instance in-memory cluster reachable by real client sessions
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,no_run
//! use retrodry_client::GetOptions;
//! use retrodry_core::DatonKey;
//! use retrodry_testkit::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let cluster = TestCluster::new(2);
//! let session = cluster.connect(0, CLERK).await.unwrap();
//! let customer = session.get(&DatonKey::row("Customer", 1), GetOptions::default()).await.unwrap();
//! assert_eq!(customer.main_row().unwrap().value("Company").as_str(), Some("Acme"));
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

pub use cluster::*;
pub use fixtures::*;
pub use generators::*;

/// Routes `tracing` output through the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
