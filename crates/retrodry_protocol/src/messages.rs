//! Request and response bodies.
//!
//! Every message is a JSON object with PascalCase members. Daton and diff
//! payloads travel as already-encoded JSON documents (verbose or dense
//! daton JSON, diff JSON) so this crate never needs a schema.

use crate::error::ItemError;
use retrodry_core::{DatonKey, WireDataDictionary};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Per-session, per-key subscription state as requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubscribeState {
    /// Not subscribed; the client drops its cache entry.
    #[default]
    None,
    /// Receives pushes.
    Subscribed,
    /// Exclusive editor.
    Locked,
}

/// Opens a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartSessionRequest {
    /// Opaque credential checked by the server's authenticator.
    pub credential: String,
    /// Preferred language for prompts and messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Reply to [`StartSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartSessionResponse {
    /// The new session id.
    pub session_id: String,
    /// Every daton definition visible to the user.
    pub data_dictionary: WireDataDictionary,
}

/// One key to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetItem {
    /// Daton key.
    pub key: DatonKey,
    /// Also lock the daton (persistons only).
    #[serde(default)]
    pub also_lock: bool,
}

/// Fetches datons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetRequest {
    /// Session id.
    pub session_id: String,
    /// Keys to fetch.
    pub items: Vec<GetItem>,
    /// Ask for dense encoding.
    #[serde(default)]
    pub dense: bool,
}

/// Outcome of one fetched key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResult {
    /// The requested key.
    pub key: DatonKey,
    /// Encoded daton, when it was loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daton: Option<Json>,
    /// Why the daton could not be loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    /// Why a requested lock was not granted; the daton is still returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_error: Option<ItemError>,
}

impl GetResult {
    /// A loaded daton.
    pub fn loaded(key: DatonKey, daton: Json) -> Self {
        Self {
            key,
            daton: Some(daton),
            error: None,
            lock_error: None,
        }
    }

    /// A failed key.
    pub fn failed(key: DatonKey, error: ItemError) -> Self {
        Self {
            key,
            daton: None,
            error: Some(error),
            lock_error: None,
        }
    }
}

/// Reply to [`GetRequest`], one result per item in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResponse {
    /// Per-key results.
    pub results: Vec<GetResult>,
}

/// Saves persiston diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SaveRequest {
    /// Session id.
    pub session_id: String,
    /// Diff JSON documents.
    pub diffs: Vec<Json>,
    /// Ask for dense encoding of the saved datons.
    #[serde(default)]
    pub dense: bool,
}

/// Outcome of one saved diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SaveResult {
    /// Key the diff was addressed to.
    pub key: DatonKey,
    /// True if the write committed.
    pub success: bool,
    /// Permanent key of a newly created persiston.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_key: Option<DatonKey>,
    /// Canonical content after the save, including generated keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daton: Option<Json>,
    /// Failures, or partial rejections alongside a success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ItemError>,
}

impl SaveResult {
    /// A failed save.
    pub fn failed(key: DatonKey, error: ItemError) -> Self {
        Self {
            key,
            success: false,
            new_key: None,
            daton: None,
            errors: vec![error],
        }
    }
}

/// Reply to [`SaveRequest`], one result per diff in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SaveResponse {
    /// Per-diff results.
    pub results: Vec<SaveResult>,
}

/// One requested state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeItem {
    /// Daton key.
    pub key: DatonKey,
    /// Target state.
    pub state: SubscribeState,
}

/// Changes lock and subscription states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeRequest {
    /// Session id.
    pub session_id: String,
    /// Transitions to apply.
    pub items: Vec<SubscribeItem>,
}

/// Reply to [`SubscribeRequest`]: only the keys that could not transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeResponse {
    /// Errors by key.
    #[serde(default)]
    pub errors: BTreeMap<DatonKey, ItemError>,
}

/// Waits for pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LongPollRequest {
    /// Session id.
    pub session_id: String,
    /// How long the server may hold the request.
    pub timeout_ms: u64,
    /// Ask for dense encoding.
    #[serde(default)]
    pub dense: bool,
}

/// Reply to [`LongPollRequest`]; empty on timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LongPollResponse {
    /// New content of changed subscribed datons.
    #[serde(default)]
    pub datons: Vec<Json>,
}

/// Ends a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QuitRequest {
    /// Session id.
    pub session_id: String,
}

/// Reply to [`QuitRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QuitResponse {
    /// True if the session existed.
    pub ended: bool,
}

/// Body returned when a whole request fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    /// What went wrong.
    pub error: ItemError,
}
