//! Client session: cache, batched requests and the background long-poll loop.

use crate::cache::DatonCache;
use crate::config::SessionConfig;
use crate::error::{ClientError, ClientResult};
use crate::mutex::FifoMutex;
use crate::transport::{HttpClient, HttpTransport, RetroTransport};
use parking_lot::Mutex;
use retrodry_core::wire::{decode_daton, diff_json::diff_to_json, peek_key};
use retrodry_core::{diff, DataDictionary, Daton, DatonKey};
use retrodry_protocol::{
    GetItem, GetRequest, ItemError, LongPollRequest, QuitRequest, SaveRequest, StartSessionRequest,
    SubscribeItem, SubscribeRequest, SubscribeState,
};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Options for [`Session::get`] and [`Session::get_multi`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Fetch from the server even if a cached copy exists.
    pub force_revalidate: bool,
    /// Also lock the daton for editing.
    pub also_lock: bool,
}

impl GetOptions {
    /// Forces a server round trip.
    pub fn revalidate() -> Self {
        Self {
            force_revalidate: true,
            also_lock: false,
        }
    }

    /// Fetches and locks.
    pub fn lock() -> Self {
        Self {
            force_revalidate: true,
            also_lock: true,
        }
    }
}

/// Something that happened to a session outside a caller's request.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A cached daton was replaced with content pushed by the server.
    DatonUpdated(DatonKey),
    /// A long-poll failed; the loop retries after `attempt` failures in a row.
    LongPollFailed {
        /// The failure.
        message: String,
        /// Consecutive failures so far.
        attempt: u32,
    },
    /// The session quit or was ended by the server.
    Ended,
}

/// Outcome of saving one daton.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    /// Key the daton was saved under.
    pub key: DatonKey,
    /// True if the server committed the change.
    pub success: bool,
    /// Permanent key of a newly created persiston.
    pub new_key: Option<DatonKey>,
    /// Failures, or partial rejections alongside a success.
    pub errors: Vec<ItemError>,
}

impl SaveOutcome {
    fn failed(key: DatonKey, error: ItemError) -> Self {
        Self {
            key,
            success: false,
            new_key: None,
            errors: vec![error],
        }
    }
}

type Waiters = Vec<oneshot::Sender<ClientResult<Daton>>>;

struct Shared {
    config: SessionConfig,
    transport: Arc<dyn RetroTransport>,
    session_id: String,
    dictionary: DataDictionary,
    cache: Mutex<DatonCache>,
    mutex: FifoMutex,
    inflight: Mutex<HashMap<DatonKey, Waiters>>,
    events: broadcast::Sender<SessionEvent>,
    ended: AtomicBool,
}

impl Shared {
    fn ensure_active(&self) -> ClientResult<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(ClientError::Ended);
        }
        Ok(())
    }

    fn decode(&self, json: &Json) -> ClientResult<Daton> {
        let key = peek_key(json)?;
        let def = self.dictionary.def_for(&key)?;
        Ok(decode_daton(def, json, false)?)
    }

    /// A caller-owned copy restricted to the schema.
    fn copy_of(&self, daton: &Daton) -> ClientResult<Daton> {
        let def = self.dictionary.def_for(&daton.key)?;
        Ok(daton.clone_for(def))
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn mark_ended(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.cache.lock().clear();
            self.emit(SessionEvent::Ended);
        }
    }

    async fn merge_pushes(&self, datons: Vec<Json>) {
        let _guard = self.mutex.acquire().await;
        for json in datons {
            match self.decode(&json) {
                Ok(daton) => {
                    let key = daton.key.clone();
                    if self.cache.lock().merge_push(daton) {
                        debug!(session = %self.session_id, key = %key, "pushed update merged");
                        self.emit(SessionEvent::DatonUpdated(key));
                    }
                }
                Err(err) => warn!(session = %self.session_id, error = %err, "undecodable push dropped"),
            }
        }
    }
}

/// Removes in-flight registrations this fetch still owns, failing their followers.
struct Fetching<'a> {
    shared: &'a Shared,
    keys: Vec<DatonKey>,
}

impl Fetching<'_> {
    fn finish(&mut self, key: &DatonKey, result: &ClientResult<Daton>) {
        if !self.keys.contains(key) {
            return;
        }
        if let Some(waiters) = self.shared.inflight.lock().remove(key) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
        self.keys.retain(|k| k != key);
    }

    fn fail_all(&mut self, err: &ClientError) {
        for key in std::mem::take(&mut self.keys) {
            if let Some(waiters) = self.shared.inflight.lock().remove(&key) {
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }
}

impl Drop for Fetching<'_> {
    fn drop(&mut self) {
        let mut inflight = self.shared.inflight.lock();
        for key in &self.keys {
            // Dropping the senders wakes the followers with an error.
            inflight.remove(key);
        }
    }
}

enum Pending {
    Ready(ClientResult<Daton>),
    Joined(oneshot::Receiver<ClientResult<Daton>>),
    Fetch,
}

/// A client session with one RetroDRY server (or server list).
///
/// The session caches the pristine copy of every daton it fetched, computes
/// diffs on save, tracks subscribe states and runs a background long-poll
/// loop that merges pushed changes into the cache. Every cache
/// read-then-write runs under one [`FifoMutex`](crate::FifoMutex).
///
/// # Example
///
/// ```no_run
/// use retrodry_client::{GetOptions, Session, SessionConfig};
/// # use retrodry_client::HttpClient;
/// # async fn demo(client: impl HttpClient + 'static) -> retrodry_client::ClientResult<()> {
/// let config = SessionConfig::new(["https://app.example.com"]);
/// let session = Session::connect_http(config, client, "token").await?;
/// let key = "Customer|=1".parse()?;
/// let mut customer = session.get(&key, GetOptions::lock()).await?;
/// customer.main_row_mut().unwrap().set("Company", "Acme Ltd");
/// let outcomes = session.save(&[customer]).await?;
/// assert!(outcomes[0].success);
/// session.quit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Starts a session over any transport and launches the long-poll loop.
    ///
    /// Must be called within a tokio runtime.
    pub async fn start(
        config: SessionConfig,
        transport: Arc<dyn RetroTransport>,
        credential: &str,
    ) -> ClientResult<Self> {
        let response = transport
            .start_session(&StartSessionRequest {
                credential: credential.to_string(),
                language: config.language.clone(),
            })
            .await?;
        let dictionary = DataDictionary::from_wire(&response.data_dictionary)?;
        info!(session = %response.session_id, datons = dictionary.len(), "session started");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            transport,
            session_id: response.session_id,
            dictionary,
            cache: Mutex::new(DatonCache::new()),
            mutex: FifoMutex::new(),
            inflight: Mutex::new(HashMap::new()),
            events,
            ended: AtomicBool::new(false),
        });
        let (shutdown, stop) = watch::channel(false);
        let poller = tokio::spawn(long_poll_loop(Arc::clone(&shared), stop));
        Ok(Self {
            shared,
            shutdown,
            poller: Mutex::new(Some(poller)),
        })
    }

    /// Starts a session over an [`HttpTransport`] built from the configured servers.
    pub async fn connect_http<C: HttpClient + 'static>(
        config: SessionConfig,
        client: C,
        credential: &str,
    ) -> ClientResult<Self> {
        let transport = HttpTransport::new(config.servers.clone(), client).with_timeout(config.request_timeout);
        Self::start(config, Arc::new(transport), credential).await
    }

    /// Server-assigned session id.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Data dictionary as the server exported it for this user.
    pub fn dictionary(&self) -> &DataDictionary {
        &self.shared.dictionary
    }

    /// Subscribes to session events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Returns true until the session quits or is ended by the server.
    pub fn is_active(&self) -> bool {
        !self.shared.ended.load(Ordering::SeqCst)
    }

    /// This session's subscribe state for a key.
    pub fn subscribe_state(&self, key: &DatonKey) -> SubscribeState {
        self.shared.cache.lock().state(key)
    }

    /// A copy of the cached pristine daton, without any round trip.
    pub fn cached(&self, key: &DatonKey) -> Option<Daton> {
        let cache = self.shared.cache.lock();
        let entry = cache.get(key)?;
        self.shared.copy_of(&entry.pristine).ok()
    }

    /// Gets one daton; see [`Session::get_multi`].
    pub async fn get(&self, key: &DatonKey, options: GetOptions) -> ClientResult<Daton> {
        let mut results = self.get_multi(std::slice::from_ref(key), options).await?;
        match results.pop() {
            Some((_, result)) => result,
            None => Err(ClientError::NotCached(key.clone())),
        }
    }

    /// Gets many datons in at most one round trip.
    ///
    /// Cached datons are returned as copies unless `force_revalidate` or
    /// `also_lock` is set. A key already being fetched by another call
    /// joins that fetch. Only a transport failure fails the whole batch;
    /// otherwise each key gets its own result. With `also_lock`, a daton
    /// that loaded but could not be locked is cached and its key reports
    /// the lock error.
    pub async fn get_multi(
        &self,
        keys: &[DatonKey],
        options: GetOptions,
    ) -> ClientResult<Vec<(DatonKey, ClientResult<Daton>)>> {
        let shared: &Shared = &self.shared;
        shared.ensure_active()?;
        let use_cache = !options.force_revalidate && !options.also_lock;

        let mut pending = Vec::with_capacity(keys.len());
        let mut fetching = Fetching {
            shared,
            keys: Vec::new(),
        };
        let mut to_fetch = Vec::new();
        {
            let _guard = shared.mutex.acquire().await;
            let cache = shared.cache.lock();
            let mut inflight = shared.inflight.lock();
            for key in keys {
                if use_cache {
                    if let Some(entry) = cache.get(key) {
                        pending.push(Pending::Ready(shared.copy_of(&entry.pristine)));
                        continue;
                    }
                }
                if !options.also_lock {
                    if let Some(waiters) = inflight.get_mut(key) {
                        let (sender, receiver) = oneshot::channel();
                        waiters.push(sender);
                        pending.push(Pending::Joined(receiver));
                        continue;
                    }
                    inflight.insert(key.clone(), Vec::new());
                    fetching.keys.push(key.clone());
                }
                to_fetch.push(key.clone());
                pending.push(Pending::Fetch);
            }
        }

        let mut fetched: HashMap<DatonKey, ClientResult<Daton>> = HashMap::new();
        if !to_fetch.is_empty() {
            let request = GetRequest {
                session_id: shared.session_id.clone(),
                items: to_fetch
                    .iter()
                    .map(|key| GetItem {
                        key: key.clone(),
                        also_lock: options.also_lock,
                    })
                    .collect(),
                dense: shared.config.dense,
            };
            let response = match shared.transport.get(&request).await {
                Ok(response) => response,
                Err(err) => {
                    fetching.fail_all(&err);
                    if err.is_session_ended() {
                        shared.mark_ended();
                    }
                    return Err(err);
                }
            };

            let _guard = shared.mutex.acquire().await;
            for result in response.results {
                let outcome = match (result.error, result.daton) {
                    (Some(error), _) => Err(ClientError::Server(error)),
                    (None, None) => Err(ClientError::Protocol(format!("no daton for {}", result.key))),
                    (None, Some(json)) => shared.decode(&json).and_then(|daton| {
                        let copy = shared.copy_of(&daton)?;
                        let mut cache = shared.cache.lock();
                        cache.store(daton);
                        if options.also_lock {
                            match result.lock_error {
                                // The server watches the key for us instead.
                                Some(error) => {
                                    cache.set_state(&result.key, SubscribeState::Subscribed);
                                    return Err(ClientError::Server(error));
                                }
                                None => {
                                    cache.set_state(&result.key, SubscribeState::Locked);
                                }
                            }
                        }
                        Ok(copy)
                    }),
                };
                fetching.finish(&result.key, &outcome);
                fetched.insert(result.key, outcome);
            }
        }
        fetching.fail_all(&ClientError::Protocol("server skipped a key".into()));

        let mut results = Vec::with_capacity(keys.len());
        for (key, pending) in keys.iter().zip(pending) {
            let result = match pending {
                Pending::Ready(result) => result,
                Pending::Fetch => fetched
                    .remove(key)
                    .unwrap_or_else(|| Err(ClientError::Protocol(format!("server skipped {key}")))),
                Pending::Joined(receiver) => receiver
                    .await
                    .unwrap_or_else(|_| Err(ClientError::transport_retryable("joined fetch was abandoned"))),
            };
            results.push((key.clone(), result));
        }
        Ok(results)
    }

    /// Saves modified datons in one round trip.
    ///
    /// Each daton is diffed against its cached pristine copy (new
    /// persistons, with negative keys, against nothing). Successes replace
    /// the pristine copy and version, re-keying new persistons; failures
    /// leave the cache untouched. Only a transport failure fails the batch.
    pub async fn save(&self, modified: &[Daton]) -> ClientResult<Vec<SaveOutcome>> {
        let shared: &Shared = &self.shared;
        shared.ensure_active()?;

        let mut outcomes: Vec<Option<SaveOutcome>> = vec![None; modified.len()];
        let mut sent: Vec<(usize, DatonKey)> = Vec::new();
        let mut diffs = Vec::new();
        {
            let _guard = shared.mutex.acquire().await;
            let cache = shared.cache.lock();
            for (index, daton) in modified.iter().enumerate() {
                let key = daton.key.clone();
                let prepared = shared.dictionary.def_for(&key).map_err(ClientError::from).and_then(|def| {
                    let pristine = if key.is_new() {
                        Daton::new(key.clone(), Vec::new())
                    } else {
                        cache
                            .get(&key)
                            .map(|e| e.pristine.clone())
                            .ok_or_else(|| ClientError::NotCached(key.clone()))?
                    };
                    let delta = diff::diff(def, &pristine, daton)?;
                    Ok(diff_to_json(def, &delta))
                });
                match prepared {
                    Ok(json) => {
                        sent.push((index, key));
                        diffs.push(json);
                    }
                    Err(err) => outcomes[index] = Some(SaveOutcome::failed(key, item_error(&err))),
                }
            }
        }

        if !diffs.is_empty() {
            let request = SaveRequest {
                session_id: shared.session_id.clone(),
                diffs,
                dense: shared.config.dense,
            };
            let response = shared.transport.save(&request).await.inspect_err(|err| {
                if err.is_session_ended() {
                    shared.mark_ended();
                }
            })?;

            let _guard = shared.mutex.acquire().await;
            for ((index, key), result) in sent.into_iter().zip(response.results) {
                let mut outcome = SaveOutcome {
                    key: key.clone(),
                    success: result.success,
                    new_key: result.new_key.clone(),
                    errors: result.errors,
                };
                if result.success {
                    match result.daton.as_ref().map(|json| shared.decode(json)) {
                        Some(Ok(daton)) => {
                            let mut cache = shared.cache.lock();
                            if result.new_key.is_some() {
                                cache.rekey(&key, daton);
                            } else {
                                cache.store(daton);
                            }
                        }
                        Some(Err(err)) => outcome.errors.push(item_error(&err)),
                        None => {}
                    }
                    info!(session = %shared.session_id, key = %key, "saved");
                } else {
                    debug!(session = %shared.session_id, key = %key, "save rejected");
                }
                outcomes[index] = Some(outcome);
            }
        }

        Ok(modified
            .iter()
            .zip(outcomes)
            .map(|(daton, outcome)| {
                outcome.unwrap_or_else(|| {
                    SaveOutcome::failed(daton.key.clone(), ItemError::transport("no result from server"))
                })
            })
            .collect())
    }

    /// Moves keys to a new subscribe state in one round trip.
    ///
    /// Returns the keys that could not transition. Moving to
    /// [`SubscribeState::None`] evicts the cache entry.
    pub async fn change_subscribe_state(
        &self,
        keys: &[DatonKey],
        state: SubscribeState,
    ) -> ClientResult<BTreeMap<DatonKey, ItemError>> {
        let shared = &self.shared;
        shared.ensure_active()?;
        let request = SubscribeRequest {
            session_id: shared.session_id.clone(),
            items: keys
                .iter()
                .map(|key| SubscribeItem {
                    key: key.clone(),
                    state,
                })
                .collect(),
        };
        let response = shared.transport.subscribe(&request).await.inspect_err(|err| {
            if err.is_session_ended() {
                shared.mark_ended();
            }
        })?;
        let _guard = shared.mutex.acquire().await;
        let mut cache = shared.cache.lock();
        for key in keys.iter().filter(|k| !response.errors.contains_key(*k)) {
            cache.set_state(key, state);
        }
        if !response.errors.is_empty() {
            debug!(session = %shared.session_id, failed = response.errors.len(), "subscribe state partly rejected");
        }
        Ok(response.errors)
    }

    /// Ends the session: stops the long-poll loop and releases every lock
    /// and subscription on the server.
    pub async fn quit(&self) -> ClientResult<()> {
        if self.shared.ended.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            let _ = poller.await;
        }
        let result = self
            .shared
            .transport
            .quit(&QuitRequest {
                session_id: self.shared.session_id.clone(),
            })
            .await;
        self.shared.mark_ended();
        info!(session = %self.shared.session_id, "session quit");
        result.map(|_| ())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
    }
}

fn item_error(err: &ClientError) -> ItemError {
    match err {
        ClientError::Server(item) => item.clone(),
        other => ItemError::new(other.code(), other.to_string()),
    }
}

/// Keeps one long-poll outstanding until shutdown or the session ends.
async fn long_poll_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let retry = shared.config.retry.clone();
    let mut attempt = 0u32;
    let request = LongPollRequest {
        session_id: shared.session_id.clone(),
        timeout_ms: u64::try_from(shared.config.long_poll_timeout.as_millis()).unwrap_or(u64::MAX),
        dense: shared.config.dense,
    };
    loop {
        if *stop.borrow() {
            break;
        }
        let outcome = tokio::select! {
            _ = stop.changed() => break,
            outcome = shared.transport.long_poll(&request) => outcome,
        };
        match outcome {
            Ok(response) => {
                attempt = 0;
                if !response.datons.is_empty() {
                    shared.merge_pushes(response.datons).await;
                }
            }
            Err(err) if err.is_session_ended() => {
                info!(session = %shared.session_id, error = %err, "session ended by server");
                shared.mark_ended();
                break;
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let delay = retry.delay_for_attempt(attempt);
                warn!(session = %shared.session_id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "long-poll failed, retrying");
                shared.emit(SessionEvent::LongPollFailed {
                    message: err.to_string(),
                    attempt,
                });
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!(session = %shared.session_id, "long-poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::transport::{LoopbackClient, LoopbackServer};
    use async_trait::async_trait;
    use retrodry_core::{ColDef, DatonDef, PermissionLevel, Row, TableDef, Value, WireType};
    use retrodry_protocol::{
        ErrorCode, GetResponse, LongPollResponse, QuitResponse, SaveResponse, StartSessionResponse,
        SubscribeResponse,
    };
    use retrodry_server::{Coordinator, CoordinatorConfig, RetroServer, StaticAuthenticator, User};
    use retrodry_storage::{InMemoryCoordinationStore, InMemoryDatabase};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Node(Arc<RetroServer>);

    #[async_trait]
    impl LoopbackServer for Node {
        async fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
            Ok(self.0.handle_post(path, body).await)
        }
    }

    fn widget_def() -> DatonDef {
        DatonDef::persiston(
            "Widget",
            TableDef::new("Widget")
                .primary_key("WidgetId")
                .column(ColDef::new("WidgetId", WireType::Int32))
                .column(ColDef::new("ItemCode", WireType::Text).max_length(10))
                .column(
                    ColDef::new("Notes", WireType::Text)
                        .nullable()
                        .default_permission(PermissionLevel::View)
                        .permission("editor", PermissionLevel::Modify),
                ),
        )
        .build()
        .unwrap()
    }

    fn server() -> Arc<RetroServer> {
        let db = InMemoryDatabase::new();
        db.seed(
            "Widget",
            "WidgetId",
            [("ItemCode", Value::from("HEXNUT")), ("Notes", Value::from("Has 6 sides"))],
        );
        let coordinator = Coordinator::new(
            CoordinatorConfig::new("test").with_long_poll_cap(Duration::from_secs(5)),
            Arc::new(DataDictionary::new().with(widget_def())),
            Arc::new(db),
            Arc::new(InMemoryCoordinationStore::new()),
        )
        .with_authenticator(Arc::new(
            StaticAuthenticator::new()
                .with_user("ed", User::new("ed").with_role("editor"))
                .with_user("vi", User::new("vi")),
        ));
        Arc::new(RetroServer::new(coordinator))
    }

    async fn connect(server: &Arc<RetroServer>, credential: &str) -> Session {
        let config = SessionConfig::new(["loopback://node"]).with_long_poll_timeout(Duration::from_millis(500));
        Session::connect_http(config, LoopbackClient::new(Node(Arc::clone(server))), credential)
            .await
            .unwrap()
    }

    fn key() -> DatonKey {
        DatonKey::row("Widget", 1)
    }

    #[tokio::test]
    async fn get_caches_and_revalidates() {
        let server = server();
        let session = connect(&server, "ed").await;
        assert_eq!(session.dictionary().len(), 1);
        let widget = session.get(&key(), GetOptions::default()).await.unwrap();
        assert_eq!(widget.main_row().unwrap().value("ItemCode").as_str(), Some("HEXNUT"));
        assert!(session.cached(&key()).is_some());

        let results = session
            .get_multi(&[key(), DatonKey::row("Widget", 7)], GetOptions::revalidate())
            .await
            .unwrap();
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].1.as_ref().unwrap_err().code(), ErrorCode::NotFound);
        session.quit().await.unwrap();
        assert!(!session.is_active());
        assert!(matches!(session.get(&key(), GetOptions::default()).await, Err(ClientError::Ended)));
    }

    #[tokio::test]
    async fn save_updates_pristine_and_reports_denied_columns() {
        let server = server();
        let viewer = connect(&server, "vi").await;
        let mut widget = viewer.get(&key(), GetOptions::default()).await.unwrap();
        let before = widget.version.clone();
        let row = widget.main_row_mut().unwrap();
        row.set("ItemCode", "BOLT");
        row.set("Notes", "Has 7 sides");
        let outcomes = viewer.save(&[widget]).await.unwrap();
        assert!(outcomes[0].success, "{:?}", outcomes[0]);
        assert_eq!(outcomes[0].errors[0].code, ErrorCode::PermissionDenied);

        let cached = viewer.cached(&key()).unwrap();
        assert_ne!(cached.version, before);
        let main = cached.main_row().unwrap();
        assert_eq!(main.value("ItemCode").as_str(), Some("BOLT"));
        assert_eq!(main.value("Notes").as_str(), Some("Has 6 sides"));
        viewer.quit().await.unwrap();
    }

    #[tokio::test]
    async fn failed_saves_leave_the_cache_alone() {
        let server = server();
        let session = connect(&server, "ed").await;
        let mut widget = session.get(&key(), GetOptions::default()).await.unwrap();
        widget.main_row_mut().unwrap().set("ItemCode", "WAY-TOO-LONG-CODE");
        let uncached = Daton::new(DatonKey::row("Widget", 3), vec![Row::new()]);
        let outcomes = session.save(&[widget, uncached]).await.unwrap();
        assert!(!outcomes[0].success);
        assert_eq!(outcomes[0].errors[0].code, ErrorCode::ValidationFailed);
        assert!(!outcomes[1].success);
        let cached = session.cached(&key()).unwrap();
        assert_eq!(cached.main_row().unwrap().value("ItemCode").as_str(), Some("HEXNUT"));
        session.quit().await.unwrap();
    }

    #[tokio::test]
    async fn new_persistons_are_rekeyed() {
        let server = server();
        let session = connect(&server, "ed").await;
        let new_key = DatonKey::row("Widget", -1);
        let daton = Daton::new(
            new_key.clone(),
            vec![Row::new().with("WidgetId", -1).with("ItemCode", "WASHER")],
        );
        let outcomes = session.save(&[daton]).await.unwrap();
        let permanent = outcomes[0].new_key.clone().unwrap();
        assert_eq!(permanent, DatonKey::row("Widget", 2));
        assert!(session.cached(&new_key).is_none());
        let cached = session.cached(&permanent).unwrap();
        assert_eq!(cached.main_row().unwrap().value("WidgetId"), &Value::Int(2));
        session.quit().await.unwrap();
    }

    #[tokio::test]
    async fn locks_conflict_and_none_evicts() {
        let server = server();
        let a = connect(&server, "ed").await;
        let b = connect(&server, "ed").await;
        a.get(&key(), GetOptions::lock()).await.unwrap();
        assert_eq!(a.subscribe_state(&key()), SubscribeState::Locked);

        let err = b.get(&key(), GetOptions::lock()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockConflict);
        assert!(b.cached(&key()).is_some());
        assert_eq!(b.subscribe_state(&key()), SubscribeState::Subscribed);
        let errors = b.change_subscribe_state(&[key()], SubscribeState::Locked).await.unwrap();
        assert_eq!(errors[&key()].code, ErrorCode::LockConflict);

        a.change_subscribe_state(&[key()], SubscribeState::None).await.unwrap();
        assert!(a.cached(&key()).is_none());
        assert!(b.change_subscribe_state(&[key()], SubscribeState::Locked).await.unwrap().is_empty());
        a.quit().await.unwrap();
        b.quit().await.unwrap();
    }

    #[tokio::test]
    async fn pushes_reach_subscribers_but_not_lock_holders() {
        let server = server();
        let editor = connect(&server, "ed").await;
        let watcher = connect(&server, "vi").await;
        let mut events = watcher.events();
        watcher.get(&key(), GetOptions::default()).await.unwrap();
        watcher.change_subscribe_state(&[key()], SubscribeState::Subscribed).await.unwrap();

        let mut widget = editor.get(&key(), GetOptions::lock()).await.unwrap();
        widget.main_row_mut().unwrap().set("Notes", "Has 8 sides");
        assert!(editor.save(&[widget]).await.unwrap()[0].success);

        let event = tokio::time::timeout(Duration::from_secs(3), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, SessionEvent::DatonUpdated(key()));
        let cached = watcher.cached(&key()).unwrap();
        assert_eq!(cached.main_row().unwrap().value("Notes").as_str(), Some("Has 8 sides"));
        editor.quit().await.unwrap();
        watcher.quit().await.unwrap();
    }

    /// Fails every long-poll, counting attempts; everything else is unreachable.
    struct FlakyTransport {
        polls: AtomicU32,
    }

    #[async_trait]
    impl RetroTransport for FlakyTransport {
        async fn start_session(&self, _: &StartSessionRequest) -> ClientResult<StartSessionResponse> {
            Ok(StartSessionResponse {
                session_id: "flaky".into(),
                data_dictionary: Default::default(),
            })
        }
        async fn get(&self, _: &GetRequest) -> ClientResult<GetResponse> {
            Err(ClientError::transport_retryable("down"))
        }
        async fn save(&self, _: &SaveRequest) -> ClientResult<SaveResponse> {
            Err(ClientError::transport_retryable("down"))
        }
        async fn subscribe(&self, _: &SubscribeRequest) -> ClientResult<SubscribeResponse> {
            Err(ClientError::transport_retryable("down"))
        }
        async fn long_poll(&self, _: &LongPollRequest) -> ClientResult<LongPollResponse> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::transport_retryable("down"))
        }
        async fn quit(&self, _: &QuitRequest) -> ClientResult<QuitResponse> {
            Ok(QuitResponse { ended: true })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_failures_back_off_silently() {
        let transport = Arc::new(FlakyTransport {
            polls: AtomicU32::new(0),
        });
        let config = SessionConfig::default().with_retry(
            RetryConfig::new(4)
                .with_initial_delay(Duration::from_millis(100))
                .with_jitter(false),
        );
        let session = Session::start(config, transport.clone(), "x").await.unwrap();
        let mut events = session.events();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        // 0, 100, 300, 700 ms.
        assert_eq!(transport.polls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::LongPollFailed { attempt: 1, .. }
        ));
        assert!(session.is_active());
        let err = session.get(&DatonKey::row("Widget", 1), GetOptions::default()).await.unwrap_err();
        assert!(err.is_retryable());
        session.quit().await.unwrap();
    }
}
