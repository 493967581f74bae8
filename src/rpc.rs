//! Engine Wire Envelope
//!
//! Single responsibility: Encode and decode the engine's JSON-RPC envelope.
//! Knows nothing about sessions, retries or dispatch.
//!
//! # Wire Format
//!
//! ## Request
//! ```text
//! {
//!     "jsonrpc": "2.0",
//!     "id": <u64>,           // Request ID for correlation
//!     "handle": <i32>,       // Object the method is invoked on (-1 = global)
//!     "method": <string>,
//!     "params": <array|object>,
//! }
//! ```
//!
//! ## Response
//! ```text
//! {
//!     "jsonrpc": "2.0",
//!     "id": <u64>,           // Matches request ID
//!     "result": <object>,    // or "error": { "code", "message", "parameter" }
//!     "change": [<handle>],  // Objects invalidated by this call
//!     "close": [<handle>],   // Objects closed by this call
//! }
//! ```
//!
//! ## Push
//! Messages without an `id` are pushed by the server: either a notification
//! (`method` + `params`) or a bare change list (`change` / `close`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{Result, SessionError};

/// Server-assigned identity of a live object within one connected session.
pub type Handle = i32;

/// Handle used for calls that are not bound to an object.
pub const GLOBAL_HANDLE: Handle = -1;

/// "Generic aborted" - transient, the call may be retried.
pub const GENERIC_ABORTED: i32 = 15;

/// "Calculation condition failed" - the object has no data to show.
pub const CALC_EVAL_CONDITION_FAILED: i32 = 7005;

/// Topic carrying the session state right after a dial.
pub const TOPIC_CONNECTED: &str = "OnConnected";

/// Topic sent when the proxy requires (re-)authentication.
pub const TOPIC_AUTHENTICATION: &str = "OnAuthenticationInformation";

/// Handles changed or closed by a call or a push.
///
/// A handle that is closed is never reported as changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeList {
    changed: Vec<Handle>,
    closed: Vec<Handle>,
}

impl ChangeList {
    pub fn new(changed: impl IntoIterator<Item = Handle>, closed: impl IntoIterator<Item = Handle>) -> Self {
        let mut list = Self::default();
        list.extend(changed, closed);
        list
    }

    pub fn changed(&self) -> &[Handle] {
        &self.changed
    }

    pub fn closed(&self) -> &[Handle] {
        &self.closed
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.closed.is_empty()
    }

    /// Accumulate more handles, keeping first-seen order and closed-wins.
    pub fn extend(
        &mut self,
        changed: impl IntoIterator<Item = Handle>,
        closed: impl IntoIterator<Item = Handle>,
    ) {
        for handle in closed {
            if !self.closed.contains(&handle) {
                self.closed.push(handle);
            }
        }
        for handle in changed {
            if !self.changed.contains(&handle) {
                self.changed.push(handle);
            }
        }
        if !self.closed.is_empty() {
            let closed: HashSet<Handle> = self.closed.iter().copied().collect();
            self.changed.retain(|h| !closed.contains(h));
        }
    }

    pub fn merge(&mut self, other: ChangeList) {
        self.extend(other.changed, other.closed);
    }
}

/// Outgoing call. The transport assigns the id.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub handle: Handle,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(handle: Handle, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: 0,
            handle,
            method: method.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl From<RpcError> for SessionError {
    fn from(e: RpcError) -> Self {
        SessionError::Remote {
            code: e.code,
            message: e.message,
            parameter: e.parameter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub change: Vec<Handle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub close: Vec<Handle>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            error: Some(RpcError {
                code,
                message: message.into(),
                parameter: None,
            }),
            ..Default::default()
        }
    }

    pub fn with_changes(mut self, changed: &[Handle], closed: &[Handle]) -> Self {
        self.change.extend_from_slice(changed);
        self.close.extend_from_slice(closed);
        self
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn changes(&self) -> ChangeList {
        ChangeList::new(self.change.iter().copied(), self.close.iter().copied())
    }

    /// Turn the response into the call result, surfacing engine errors.
    pub fn into_result(self) -> Result<Value> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error.into()),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Asynchronous server notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub topic: String,
    pub payload: Value,
}

/// Classified incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(RpcResponse),
    Push(PushEvent),
    Changes(ChangeList),
}

impl Incoming {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);

        if has_id && (value.get("result").is_some() || value.get("error").is_some()) {
            return Ok(Incoming::Response(serde_json::from_value(value)?));
        }

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            return Ok(Incoming::Push(PushEvent {
                topic: method.to_string(),
                payload: value.get("params").cloned().unwrap_or(Value::Null),
            }));
        }

        if value.get("change").is_some() || value.get("close").is_some() {
            let response: RpcResponse = serde_json::from_value(value)?;
            return Ok(Incoming::Changes(response.changes()));
        }

        Err(SessionError::Protocol(format!("Unrecognized frame: {}", text)))
    }
}

/// Session state reported on the `OnConnected` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Attached,
    Other(String),
}

impl SessionState {
    pub fn from_payload(payload: &Value) -> Self {
        match payload.get("qSessionState").and_then(Value::as_str) {
            Some("SESSION_CREATED") => SessionState::Created,
            Some("SESSION_ATTACHED") => SessionState::Attached,
            Some(other) => SessionState::Other(other.to_string()),
            None => SessionState::Other("missing session state".to_string()),
        }
    }
}
