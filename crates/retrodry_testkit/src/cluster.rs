//! Multi-instance in-memory cluster.
//!
//! Several coordinators share one [`InMemoryCoordinationStore`] and one
//! [`InMemoryDatabase`], each running its change pump and reaper. Client
//! sessions reach the nodes through [`ClusterClient`], which routes
//! `loopback://node-<n>` URLs in-process and can take nodes down to
//! exercise failover.

use crate::fixtures::{sample_authenticator, sample_dictionary, seeded_database};
use async_trait::async_trait;
use parking_lot::RwLock;
use retrodry_client::{ClientResult, HttpClient, Session, SessionConfig};
use retrodry_core::DataDictionary;
use retrodry_server::{Coordinator, CoordinatorConfig, RetroServer};
use retrodry_storage::{InMemoryCoordinationStore, InMemoryDatabase};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// How often each node checks the shared change log.
pub const PROPAGATION_INTERVAL: Duration = Duration::from_millis(25);

/// A set of coordinator nodes over shared storage.
pub struct TestCluster {
    /// Shared coordination store.
    pub store: InMemoryCoordinationStore,
    /// Shared database.
    pub database: InMemoryDatabase,
    nodes: Vec<Arc<RetroServer>>,
    down: Arc<RwLock<HashSet<usize>>>,
}

impl TestCluster {
    /// Starts `instances` nodes over the sample dictionary and seeded data.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(instances: usize) -> Self {
        Self::with_config(instances, |config| config)
    }

    /// Starts nodes, letting `configure` adjust each node's configuration.
    pub fn with_config(instances: usize, configure: impl Fn(CoordinatorConfig) -> CoordinatorConfig) -> Self {
        let store = InMemoryCoordinationStore::new();
        let database = seeded_database();
        let dictionary = Arc::new(sample_dictionary());
        let authenticator = Arc::new(sample_authenticator());
        let nodes = (0..instances)
            .map(|n| {
                let config = configure(
                    CoordinatorConfig::new(format!("node-{n}"))
                        .with_propagation_interval(PROPAGATION_INTERVAL)
                        .with_long_poll_cap(Duration::from_secs(5)),
                );
                let coordinator = Coordinator::new(
                    config,
                    Arc::clone(&dictionary),
                    Arc::new(database.clone()),
                    Arc::new(store.clone()),
                )
                .with_authenticator(authenticator.clone());
                let mut server = RetroServer::new(coordinator);
                server.start();
                Arc::new(server)
            })
            .collect();
        Self {
            store,
            database,
            nodes,
            down: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node `n`.
    pub fn node(&self, n: usize) -> &Arc<RetroServer> {
        &self.nodes[n]
    }

    /// Coordinator of node `n`.
    pub fn coordinator(&self, n: usize) -> &Arc<Coordinator> {
        self.nodes[n].coordinator()
    }

    /// The dictionary the nodes serve.
    pub fn dictionary(&self) -> &DataDictionary {
        self.coordinator(0).dictionary()
    }

    /// URL of node `n`.
    pub fn url(n: usize) -> String {
        format!("loopback://node-{n}")
    }

    /// A client that reaches every node of this cluster.
    pub fn client(&self) -> ClusterClient {
        ClusterClient {
            nodes: self.nodes.clone(),
            down: Arc::clone(&self.down),
        }
    }

    /// Makes requests to node `n` fail as if it were unreachable.
    pub fn take_down(&self, n: usize) {
        self.down.write().insert(n);
    }

    /// Makes node `n` reachable again.
    pub fn bring_up(&self, n: usize) {
        self.down.write().remove(&n);
    }

    /// Session configuration listing node `first`, then every other node.
    pub fn session_config(&self, first: usize) -> SessionConfig {
        let order = (0..self.nodes.len()).map(|i| (first + i) % self.nodes.len());
        SessionConfig::new(order.map(Self::url)).with_long_poll_timeout(Duration::from_secs(2))
    }

    /// Starts a session whose requests go to node `n` first.
    pub async fn connect(&self, n: usize, credential: &str) -> ClientResult<Session> {
        Session::connect_http(self.session_config(n), self.client(), credential).await
    }
}

/// In-process HTTP client for a [`TestCluster`].
#[derive(Clone)]
pub struct ClusterClient {
    nodes: Vec<Arc<RetroServer>>,
    down: Arc<RwLock<HashSet<usize>>>,
}

#[async_trait]
impl HttpClient for ClusterClient {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        let rest = url
            .strip_prefix("loopback://node-")
            .ok_or_else(|| format!("not a cluster url: {url}"))?;
        let (node, path) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
        let n: usize = node.parse().map_err(|_| format!("bad node in {url}"))?;
        if self.down.read().contains(&n) {
            return Err(format!("connection refused: node-{n}"));
        }
        let server = self.nodes.get(n).ok_or_else(|| format!("no node-{n}"))?;
        Ok(server.handle_post(path, &body).await)
    }
}
