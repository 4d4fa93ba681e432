//! # RetroDRY Protocol
//!
//! The logical request/response contract between a RetroDRY client session
//! and a coordinator, independent of how the bytes travel.
//!
//! Each request is a JSON body posted to one of the [`paths`]. A reply is
//! either the matching response message or an [`ErrorResponse`] when the
//! whole request failed (bad session, unparseable body). Batched requests
//! report failures per item inside a normal response.
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Usage
//!
//! ```
//! use retrodry_protocol::{decode_reply, encode_reply, ItemError, QuitResponse};
//!
//! let bytes = encode_reply(&Ok(QuitResponse { ended: true })).unwrap();
//! let reply: Result<QuitResponse, ItemError> = decode_reply(&bytes).unwrap();
//! assert!(reply.unwrap().ended);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;

pub use error::{ErrorCode, ItemError, ProtocolError, ProtocolResult};
pub use messages::{
    ErrorResponse, GetItem, GetRequest, GetResponse, GetResult, LongPollRequest, LongPollResponse,
    QuitRequest, QuitResponse, SaveRequest, SaveResponse, SaveResult, StartSessionRequest,
    StartSessionResponse, SubscribeItem, SubscribeRequest, SubscribeResponse, SubscribeState,
};

use serde::de::DeserializeOwned;
use serde::Serialize;

// No response body has a member by this name.
const ERROR_MEMBER: &str = "Error";

/// Endpoint paths.
pub mod paths {
    /// [`StartSessionRequest`](crate::StartSessionRequest).
    pub const START_SESSION: &str = "/api/session/start";
    /// [`GetRequest`](crate::GetRequest).
    pub const GET: &str = "/api/get";
    /// [`SaveRequest`](crate::SaveRequest).
    pub const SAVE: &str = "/api/save";
    /// [`SubscribeRequest`](crate::SubscribeRequest).
    pub const SUBSCRIBE: &str = "/api/subscribe";
    /// [`LongPollRequest`](crate::LongPollRequest).
    pub const LONG_POLL: &str = "/api/longpoll";
    /// [`QuitRequest`](crate::QuitRequest).
    pub const QUIT: &str = "/api/quit";

    /// Every endpoint.
    pub const ALL: [&str; 6] = [START_SESSION, GET, SAVE, SUBSCRIBE, LONG_POLL, QUIT];
}

/// Encodes a request body.
pub fn encode_request<T: Serialize>(request: &T) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

/// Decodes a request body.
pub fn decode_request<T: DeserializeOwned>(body: &[u8]) -> ProtocolResult<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Encodes a reply: the response, or an [`ErrorResponse`].
pub fn encode_reply<T: Serialize>(reply: &Result<T, ItemError>) -> ProtocolResult<Vec<u8>> {
    let bytes = match reply {
        Ok(response) => serde_json::to_vec(response)?,
        Err(error) => serde_json::to_vec(&ErrorResponse {
            error: error.clone(),
        })?,
    };
    Ok(bytes)
}

/// Decodes a reply produced by [`encode_reply`].
pub fn decode_reply<T: DeserializeOwned>(body: &[u8]) -> ProtocolResult<Result<T, ItemError>> {
    let json: serde_json::Value = serde_json::from_slice(body)?;
    if json.get(ERROR_MEMBER).is_some() {
        let failed: ErrorResponse = serde_json::from_value(json)?;
        return Ok(Err(failed.error));
    }
    Ok(Ok(serde_json::from_value(json)?))
}
