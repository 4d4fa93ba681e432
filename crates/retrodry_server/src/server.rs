//! A coordinator instance with its background tasks.

use crate::coordinator::Coordinator;
use crate::handler::RequestHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One RetroDRY server instance.
///
/// Owns a [`Coordinator`] and, once started, two background tasks: the
/// change pump, which wakes local long-polls when another instance appends
/// to the shared change log, and the idle-session reaper. Several instances
/// over the same coordination store form one logical server.
///
/// # Example
///
/// ```
/// use retrodry_core::DataDictionary;
/// use retrodry_server::{Coordinator, CoordinatorConfig, RetroServer};
/// use retrodry_storage::{InMemoryCoordinationStore, InMemoryDatabase};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let coordinator = Coordinator::new(
///     CoordinatorConfig::new("node-1"),
///     Arc::new(DataDictionary::new()),
///     Arc::new(InMemoryDatabase::new()),
///     Arc::new(InMemoryCoordinationStore::new()),
/// );
/// let mut server = RetroServer::new(coordinator);
/// server.start();
/// let reply = server.handle_post("/api/quit", br#"{"SessionId":"gone"}"#).await;
/// assert!(!reply.is_empty());
/// server.shutdown();
/// # }
/// ```
pub struct RetroServer {
    coordinator: Arc<Coordinator>,
    handler: RequestHandler,
    tasks: Vec<JoinHandle<()>>,
}

impl RetroServer {
    /// Wraps a coordinator. Background tasks start with [`RetroServer::start`].
    pub fn new(coordinator: Coordinator) -> Self {
        let coordinator = Arc::new(coordinator);
        Self {
            handler: RequestHandler::new(Arc::clone(&coordinator)),
            coordinator,
            tasks: Vec::new(),
        }
    }

    /// Spawns the change pump and the reaper on the current tokio runtime.
    ///
    /// Calling it again while running does nothing.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        let config = self.coordinator.config();
        self.tasks.push(tokio::spawn(change_pump(
            Arc::clone(&self.coordinator),
            config.propagation_interval,
        )));
        self.tasks.push(tokio::spawn(reaper(
            Arc::clone(&self.coordinator),
            config.reap_interval,
        )));
        info!(instance = %config.instance_name, "server started");
    }

    /// Stops the background tasks. Sessions stay in the shared store.
    pub fn shutdown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(instance = %self.coordinator.config().instance_name, "server stopped");
    }

    /// Returns true while the background tasks run.
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Handles one POST to an `/api/...` path.
    pub async fn handle_post(&self, path: &str, body: &[u8]) -> Vec<u8> {
        self.handler.handle_post(path, body).await
    }

    /// The request handler, for embedding in an HTTP stack.
    pub fn handler(&self) -> &RequestHandler {
        &self.handler
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

impl Drop for RetroServer {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn change_pump(coordinator: Arc<Coordinator>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(err) = coordinator.pump_changes() {
            warn!(error = %err, "change pump failed");
        }
    }
}

async fn reaper(coordinator: Arc<Coordinator>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(err) = coordinator.reap_idle() {
            warn!(error = %err, "session reaping failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::User;
    use crate::config::CoordinatorConfig;
    use retrodry_core::DataDictionary;
    use retrodry_storage::{CoordinationStore, InMemoryCoordinationStore, InMemoryDatabase};

    fn server(store: &InMemoryCoordinationStore, name: &str, idle: Duration) -> RetroServer {
        RetroServer::new(Coordinator::new(
            CoordinatorConfig::new(name)
                .with_propagation_interval(Duration::from_millis(20))
                .with_reap_interval(Duration::from_millis(20))
                .with_session_idle_timeout(idle),
            Arc::new(DataDictionary::new()),
            Arc::new(InMemoryDatabase::new()),
            Arc::new(store.clone()),
        ))
    }

    #[tokio::test]
    async fn foreign_quit_ends_long_poll_through_the_pump() {
        let store = InMemoryCoordinationStore::new();
        let mut a = server(&store, "a", Duration::from_secs(60));
        let b = server(&store, "b", Duration::from_secs(60));
        a.start();
        let session = a.coordinator().create_session(&User::new("u"), None).unwrap();
        let poll = {
            let coordinator = Arc::clone(a.coordinator());
            let session = session.clone();
            tokio::spawn(async move { coordinator.long_poll(&session, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(b.coordinator().quit(&session).unwrap());
        let ended = tokio::time::timeout(Duration::from_secs(2), poll).await.unwrap().unwrap();
        assert!(ended.is_err());
        a.shutdown();
        assert!(!a.is_running());
    }

    #[tokio::test]
    async fn reaper_runs_in_background() {
        let store = InMemoryCoordinationStore::new();
        let mut server = server(&store, "a", Duration::from_millis(10));
        let session = server.coordinator().create_session(&User::new("u"), None).unwrap();
        server.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.session(&session).unwrap().is_none());
    }
}
