//! Request handlers for the `/api/...` endpoints.

use crate::coordinator::{Coordinator, VisibleDaton};
use crate::error::{ServerError, ServerResult};
use retrodry_core::wire::{encode_daton, peek_key};
use retrodry_core::{DatonKey, Encoding, FieldError, WireDataDictionary};
use retrodry_protocol::{
    decode_request, encode_reply, paths, ErrorCode, GetRequest, GetResponse, GetResult, ItemError,
    LongPollRequest, LongPollResponse, QuitRequest, QuitResponse, SaveRequest, SaveResponse,
    SaveResult, StartSessionRequest, StartSessionResponse, SubscribeRequest, SubscribeResponse,
};
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Body sent when even the error reply cannot be encoded.
const FALLBACK_ERROR: &[u8] = br#"{"Error":{"Code":"Internal","Message":"reply could not be encoded"}}"#;

/// Routes protocol requests to a [`Coordinator`].
#[derive(Clone)]
pub struct RequestHandler {
    coordinator: Arc<Coordinator>,
}

impl RequestHandler {
    /// Creates a handler over a coordinator.
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Handles one POST and returns the reply body.
    ///
    /// Request-level failures come back as an error reply; per-item failures
    /// are reported inside the response.
    pub async fn handle_post(&self, path: &str, body: &[u8]) -> Vec<u8> {
        match path {
            paths::START_SESSION => self.reply(decode(body).map(|r| self.start_session(r))).await,
            paths::GET => self.reply(decode(body).map(|r| self.get(r))).await,
            paths::SAVE => self.reply(decode(body).map(|r| self.save(r))).await,
            paths::SUBSCRIBE => self.reply(decode(body).map(|r| self.subscribe(r))).await,
            paths::LONG_POLL => self.reply(decode(body).map(|r| self.long_poll(r))).await,
            paths::QUIT => self.reply(decode(body).map(|r| self.quit(r))).await,
            other => {
                debug!(path = %other, "unknown endpoint");
                encode(&Err::<(), _>(ItemError::new(
                    ErrorCode::BadRequest,
                    format!("unknown endpoint: {other}"),
                )))
            }
        }
    }

    async fn reply<T, F>(&self, request: ServerResult<F>) -> Vec<u8>
    where
        T: Serialize,
        F: std::future::Future<Output = ServerResult<T>>,
    {
        let result = match request {
            Ok(future) => future.await,
            Err(err) => Err(err),
        };
        encode(&result.map_err(|err| self.coordinator.item_error(&err)))
    }

    /// Opens a session and returns the user's view of the data dictionary.
    pub async fn start_session(&self, request: StartSessionRequest) -> ServerResult<StartSessionResponse> {
        let (session_id, user) = self
            .coordinator
            .start_session(&request.credential, request.language.as_deref())
            .await?;
        let language = request
            .language
            .unwrap_or_else(|| self.coordinator.config().default_language.clone());
        Ok(StartSessionResponse {
            session_id,
            data_dictionary: WireDataDictionary::export(self.coordinator.dictionary(), &user.roles, &language),
        })
    }

    /// Loads a batch of datons, optionally locking each.
    pub async fn get(&self, request: GetRequest) -> ServerResult<GetResponse> {
        self.check_batch(request.items.len())?;
        self.coordinator.session_user(&request.session_id)?;
        let encoding = encoding(request.dense);
        let mut results = Vec::with_capacity(request.items.len());
        for item in request.items {
            let loaded = if item.also_lock {
                self.coordinator.get_daton_locked(&item.key, &request.session_id)
            } else {
                self.coordinator
                    .get_daton(&item.key, &request.session_id)
                    .map(|visible| (visible, None))
            };
            let result = match loaded {
                Ok((visible, lock_error)) => {
                    let mut result = GetResult::loaded(item.key, encode_visible(&visible, encoding));
                    result.lock_error = lock_error.map(|err| self.coordinator.item_error(&err));
                    result
                }
                Err(err) => GetResult::failed(item.key, self.coordinator.item_error(&err)),
            };
            results.push(result);
        }
        Ok(GetResponse { results })
    }

    /// Saves a batch of diffs, each independently.
    pub async fn save(&self, request: SaveRequest) -> ServerResult<SaveResponse> {
        self.check_batch(request.diffs.len())?;
        self.coordinator.session_user(&request.session_id)?;
        let encoding = encoding(request.dense);
        // Every diff must name its key so each result can be addressed.
        let keys = request
            .diffs
            .iter()
            .map(peek_key)
            .collect::<Result<Vec<_>, _>>()?;
        let mut results = Vec::with_capacity(keys.len());
        for (key, diff) in keys.into_iter().zip(&request.diffs) {
            results.push(self.save_one(key, diff, &request.session_id, encoding).await);
        }
        Ok(SaveResponse { results })
    }

    async fn save_one(
        &self,
        key: DatonKey,
        diff: &Json,
        session_id: &str,
        encoding: Encoding,
    ) -> SaveResult {
        match self.coordinator.save(diff, session_id).await {
            Ok(saved) => {
                let errors = if saved.denied.is_empty() {
                    Vec::new()
                } else {
                    let denied = ServerError::PermissionDenied(format!("not modifiable: {}", saved.denied.join(", ")));
                    let mut error = self.coordinator.item_error(&denied);
                    error.field_errors = saved.denied.iter().map(|name| denied_field(name)).collect();
                    vec![error]
                };
                SaveResult {
                    key: saved.key,
                    success: true,
                    new_key: saved.new_key,
                    daton: Some(encode_visible(&saved.content, encoding)),
                    errors,
                }
            }
            Err(err) => SaveResult::failed(key, self.coordinator.item_error(&err)),
        }
    }

    /// Changes the subscribe state of a batch of keys.
    pub async fn subscribe(&self, request: SubscribeRequest) -> ServerResult<SubscribeResponse> {
        self.check_batch(request.items.len())?;
        self.coordinator.session_user(&request.session_id)?;
        let mut errors = BTreeMap::new();
        for item in request.items {
            if let Err(err) = self
                .coordinator
                .change_lock_state(&item.key, &request.session_id, item.state)
            {
                errors.insert(item.key, self.coordinator.item_error(&err));
            }
        }
        Ok(SubscribeResponse { errors })
    }

    /// Holds the request open until a watched daton changes or the timeout.
    pub async fn long_poll(&self, request: LongPollRequest) -> ServerResult<LongPollResponse> {
        let updates = self
            .coordinator
            .long_poll(&request.session_id, Duration::from_millis(request.timeout_ms))
            .await?;
        let encoding = encoding(request.dense);
        Ok(LongPollResponse {
            datons: updates.iter().map(|v| encode_visible(v, encoding)).collect(),
        })
    }

    /// Ends a session.
    pub async fn quit(&self, request: QuitRequest) -> ServerResult<QuitResponse> {
        Ok(QuitResponse {
            ended: self.coordinator.quit(&request.session_id)?,
        })
    }

    fn check_batch(&self, len: usize) -> ServerResult<()> {
        let max = self.coordinator.config().max_batch;
        if len > max {
            return Err(ServerError::InvalidRequest(format!("too many items: {len} > {max}")));
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> ServerResult<T> {
    decode_request(body).map_err(|e| ServerError::InvalidRequest(e.to_string()))
}

fn encode<T: Serialize>(reply: &Result<T, ItemError>) -> Vec<u8> {
    match encode_reply(reply) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "reply encoding failed");
            FALLBACK_ERROR.to_vec()
        }
    }
}

fn denied_field(name: &str) -> FieldError {
    match name.split_once('.') {
        Some((table, column)) => FieldError::column(table, column, "not modifiable"),
        None => FieldError::daton(name, "not modifiable"),
    }
}

fn encoding(dense: bool) -> Encoding {
    if dense {
        Encoding::Dense
    } else {
        Encoding::Verbose
    }
}

fn encode_visible(visible: &VisibleDaton, encoding: Encoding) -> Json {
    encode_daton(&visible.def, &visible.daton, encoding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticAuthenticator, User};
    use crate::config::CoordinatorConfig;
    use retrodry_core::{ColDef, DataDictionary, DatonDef, TableDef, Value, WireType};
    use retrodry_protocol::{decode_reply, encode_request, GetItem, SubscribeItem, SubscribeState};
    use retrodry_storage::{InMemoryCoordinationStore, InMemoryDatabase};
    use serde_json::json;

    fn handler() -> RequestHandler {
        let db = InMemoryDatabase::new();
        db.seed("Widget", "WidgetId", [("Notes", Value::from("Has 6 sides"))]);
        let dictionary = DataDictionary::new().with(
            DatonDef::persiston(
                "Widget",
                TableDef::new("Widget")
                    .primary_key("WidgetId")
                    .column(ColDef::new("WidgetId", WireType::Int32))
                    .column(ColDef::new("Notes", WireType::Text).nullable()),
            )
            .build()
            .unwrap(),
        );
        let coordinator = Coordinator::new(
            CoordinatorConfig::default().with_max_batch(2),
            Arc::new(dictionary),
            Arc::new(db),
            Arc::new(InMemoryCoordinationStore::new()),
        )
        .with_authenticator(Arc::new(StaticAuthenticator::new().with_user("secret", User::new("alice"))));
        RequestHandler::new(Arc::new(coordinator))
    }

    async fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        handler: &RequestHandler,
        path: &str,
        request: &Req,
    ) -> Result<Resp, ItemError> {
        let body = handler.handle_post(path, &encode_request(request).unwrap()).await;
        decode_reply(&body).unwrap()
    }

    async fn start(handler: &RequestHandler) -> String {
        let response: StartSessionResponse = post(
            handler,
            paths::START_SESSION,
            &StartSessionRequest {
                credential: "secret".into(),
                language: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(response.data_dictionary.datons.len(), 1);
        response.session_id
    }

    #[tokio::test]
    async fn bad_credentials_and_paths_fail_the_request() {
        let handler = handler();
        let err = post::<_, StartSessionResponse>(
            &handler,
            paths::START_SESSION,
            &StartSessionRequest {
                credential: "wrong".into(),
                language: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthError);

        let body = handler.handle_post("/api/nope", b"{}").await;
        let reply: Result<QuitResponse, ItemError> = decode_reply(&body).unwrap();
        assert_eq!(reply.unwrap_err().code, ErrorCode::BadRequest);

        let body = handler.handle_post(paths::GET, b"not json").await;
        let reply: Result<GetResponse, ItemError> = decode_reply(&body).unwrap();
        assert_eq!(reply.unwrap_err().code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn get_reports_per_item() {
        let handler = handler();
        let session = start(&handler).await;
        let response: GetResponse = post(
            &handler,
            paths::GET,
            &GetRequest {
                session_id: session,
                items: vec![
                    GetItem {
                        key: DatonKey::row("Widget", 1),
                        also_lock: true,
                    },
                    GetItem {
                        key: DatonKey::row("Widget", 5),
                        also_lock: false,
                    },
                ],
                dense: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(response.results[0].daton.as_ref().unwrap()["Widget"]["Notes"], "Has 6 sides");
        assert!(response.results[0].lock_error.is_none());
        assert_eq!(response.results[1].error.as_ref().unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn missing_datons_are_not_left_locked() {
        let handler = handler();
        let first = start(&handler).await;
        let second = start(&handler).await;
        let missing = DatonKey::row("Widget", 999);
        let response: GetResponse = post(
            &handler,
            paths::GET,
            &GetRequest {
                session_id: first,
                items: vec![GetItem {
                    key: missing.clone(),
                    also_lock: true,
                }],
                dense: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(response.results[0].error.as_ref().unwrap().code, ErrorCode::NotFound);

        let response: SubscribeResponse = post(
            &handler,
            paths::SUBSCRIBE,
            &SubscribeRequest {
                session_id: second,
                items: vec![SubscribeItem {
                    key: missing,
                    state: SubscribeState::Locked,
                }],
            },
        )
        .await
        .unwrap();
        assert!(response.errors.is_empty());
    }

    #[tokio::test]
    async fn refused_lock_still_returns_content() {
        let handler = handler();
        let first = start(&handler).await;
        let second = start(&handler).await;
        let get = |session_id: String| GetRequest {
            session_id,
            items: vec![GetItem {
                key: DatonKey::row("Widget", 1),
                also_lock: true,
            }],
            dense: false,
        };
        let _: GetResponse = post(&handler, paths::GET, &get(first)).await.unwrap();
        let response: GetResponse = post(&handler, paths::GET, &get(second)).await.unwrap();
        assert_eq!(response.results[0].daton.as_ref().unwrap()["Widget"]["Notes"], "Has 6 sides");
        assert_eq!(response.results[0].lock_error.as_ref().unwrap().code, ErrorCode::LockConflict);
    }

    #[tokio::test]
    async fn batches_over_the_limit_are_rejected() {
        let handler = handler();
        let session = start(&handler).await;
        let item = SubscribeItem {
            key: DatonKey::row("Widget", 1),
            state: SubscribeState::Subscribed,
        };
        let err = post::<_, SubscribeResponse>(
            &handler,
            paths::SUBSCRIBE,
            &SubscribeRequest {
                session_id: session,
                items: vec![item.clone(), item.clone(), item],
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn save_round_trip() {
        let handler = handler();
        let session = start(&handler).await;
        let got: GetResponse = post(
            &handler,
            paths::GET,
            &GetRequest {
                session_id: session.clone(),
                items: vec![GetItem {
                    key: DatonKey::row("Widget", 1),
                    also_lock: false,
                }],
                dense: false,
            },
        )
        .await
        .unwrap();
        let version = got.results[0].daton.as_ref().unwrap()["Version"].clone();
        let diff = json!({
            "Key": "Widget|=1",
            "Version": version,
            "Widget": [{"Notes": "Has 7 sides"}]
        });
        let saved: SaveResponse = post(
            &handler,
            paths::SAVE,
            &SaveRequest {
                session_id: session.clone(),
                diffs: vec![diff],
                dense: false,
            },
        )
        .await
        .unwrap();
        let result = &saved.results[0];
        assert!(result.success, "{result:?}");
        assert_eq!(result.daton.as_ref().unwrap()["Widget"]["Notes"], "Has 7 sides");

        let quit: QuitResponse = post(&handler, paths::QUIT, &QuitRequest { session_id: session }).await.unwrap();
        assert!(quit.ended);
    }
}
