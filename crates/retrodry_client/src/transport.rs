//! Transport layer between a session and the servers.
//!
//! [`RetroTransport`] is the typed seam the session talks to. The provided
//! [`HttpTransport`] speaks the JSON protocol over an [`HttpClient`], which
//! abstracts the actual HTTP library. [`LoopbackClient`] routes requests
//! straight into an in-process server, for tests.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use retrodry_protocol::{
    decode_reply, encode_request, paths, GetRequest, GetResponse, LongPollRequest, LongPollResponse,
    QuitRequest, QuitResponse, SaveRequest, SaveResponse, StartSessionRequest, StartSessionResponse,
    SubscribeRequest, SubscribeResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Typed request/response calls to a RetroDRY server.
#[async_trait]
pub trait RetroTransport: Send + Sync {
    /// Opens a session.
    async fn start_session(&self, request: &StartSessionRequest) -> ClientResult<StartSessionResponse>;

    /// Loads datons.
    async fn get(&self, request: &GetRequest) -> ClientResult<GetResponse>;

    /// Saves diffs.
    async fn save(&self, request: &SaveRequest) -> ClientResult<SaveResponse>;

    /// Changes subscribe states.
    async fn subscribe(&self, request: &SubscribeRequest) -> ClientResult<SubscribeResponse>;

    /// Waits for pushed changes.
    async fn long_poll(&self, request: &LongPollRequest) -> ClientResult<LongPollResponse>;

    /// Ends the session.
    async fn quit(&self, request: &QuitRequest) -> ClientResult<QuitResponse>;
}

/// HTTP client abstraction.
///
/// Implement this trait over reqwest, hyper or any other library. Errors
/// are plain strings; the transport treats every one as retryable.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// JSON-over-HTTP transport with server-list failover.
///
/// Requests go to the current server; on a transport failure the next
/// server in the list is tried, until every server failed once.
pub struct HttpTransport<C: HttpClient> {
    servers: Vec<String>,
    current: AtomicUsize,
    client: C,
    timeout: Duration,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport over a list of base URLs (e.g. `https://app.example.com`).
    pub fn new<I, S>(servers: I, client: C) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            current: AtomicUsize::new(0),
            client,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the per-request timeout. Long-polls get their own timeout on top.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL requests currently go to.
    pub fn current_server(&self) -> Option<&str> {
        if self.servers.is_empty() {
            return None;
        }
        let index = self.current.load(Ordering::SeqCst) % self.servers.len();
        Some(&self.servers[index])
    }

    async fn post_json<Req, Res>(&self, path: &str, request: &Req, timeout: Duration) -> ClientResult<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned + Send,
    {
        if self.servers.is_empty() {
            return Err(ClientError::transport_fatal("no servers configured"));
        }
        if !self.client.is_healthy() {
            return Err(ClientError::transport_retryable("http client is not healthy"));
        }
        let body = encode_request(request).map_err(|e| ClientError::Protocol(e.to_string()))?;
        let start = self.current.load(Ordering::SeqCst);
        let mut last_error = ClientError::Timeout;
        for offset in 0..self.servers.len() {
            let index = (start + offset) % self.servers.len();
            let url = format!("{}{}", self.servers[index].trim_end_matches('/'), path);
            match tokio::time::timeout(timeout, self.client.post(&url, body.clone())).await {
                Ok(Ok(reply)) => {
                    self.current.store(index, Ordering::SeqCst);
                    return decode_reply::<Res>(&reply)
                        .map_err(|e| ClientError::Protocol(e.to_string()))?
                        .map_err(ClientError::Server);
                }
                Ok(Err(message)) => {
                    warn!(url = %url, error = %message, "request failed, trying next server");
                    last_error = ClientError::transport_retryable(message);
                }
                Err(_) => {
                    warn!(url = %url, "request timed out, trying next server");
                    last_error = ClientError::Timeout;
                }
            }
        }
        debug!(path = %path, "every server failed");
        Err(last_error)
    }
}

#[async_trait]
impl<C: HttpClient> RetroTransport for HttpTransport<C> {
    async fn start_session(&self, request: &StartSessionRequest) -> ClientResult<StartSessionResponse> {
        self.post_json(paths::START_SESSION, request, self.timeout).await
    }

    async fn get(&self, request: &GetRequest) -> ClientResult<GetResponse> {
        self.post_json(paths::GET, request, self.timeout).await
    }

    async fn save(&self, request: &SaveRequest) -> ClientResult<SaveResponse> {
        self.post_json(paths::SAVE, request, self.timeout).await
    }

    async fn subscribe(&self, request: &SubscribeRequest) -> ClientResult<SubscribeResponse> {
        self.post_json(paths::SUBSCRIBE, request, self.timeout).await
    }

    async fn long_poll(&self, request: &LongPollRequest) -> ClientResult<LongPollResponse> {
        let timeout = self.timeout + Duration::from_millis(request.timeout_ms);
        self.post_json(paths::LONG_POLL, request, timeout).await
    }

    async fn quit(&self, request: &QuitRequest) -> ClientResult<QuitResponse> {
        self.post_json(paths::QUIT, request, self.timeout).await
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST to an `/api/...` path and returns the reply body.
    async fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

/// An HTTP client that routes requests directly to an in-process server.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a loopback client connected to `server`.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// The server requests go to.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        let path = url.find("/api/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body).await
    }
}
