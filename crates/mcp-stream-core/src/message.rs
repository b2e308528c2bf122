//! JSON-RPC 2.0 message envelopes carried between clients and the protocol engine.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

/// The `"jsonrpc": "2.0"` marker. Any other value fails to deserialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(Self)
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Str(&version),
                &"\"2.0\"",
            ))
        }
    }
}

/// Request identifier: a JSON number or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// A request expecting a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A one-way notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub result: Value,
}

/// Error payload of a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A failed reply. `id` is `null` when the request id could not be determined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion,
    pub id: Option<RequestId>,
    pub error: ErrorData,
}

/// Any JSON-RPC message.
///
/// Variant order matters for deserialization: a request is tried before a
/// notification so that an object carrying both `id` and `method` is a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// Build a request.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        })
    }

    /// Build a successful reply.
    #[must_use]
    pub const fn response(id: RequestId, result: Value) -> Self {
        Self::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion,
            id,
            result,
        })
    }

    /// Build an error reply.
    #[must_use]
    pub fn error(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion,
            id,
            error: ErrorData {
                code,
                message: message.into(),
                data: None,
            },
        })
    }

    /// The request id, for requests and replies.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Error(e) => e.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// The method name, for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) | Self::Error(_) => None,
        }
    }

    /// Whether this message expects a reply.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Whether this message is a reply (success or error).
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Error(_))
    }
}

/// A message on a session channel, optionally tied to the request that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub message: JsonRpcMessage,
    /// Routes a server-initiated message onto the HTTP stream of this request.
    pub related_request_id: Option<RequestId>,
}

impl SessionMessage {
    /// A message with no related request.
    #[must_use]
    pub const fn new(message: JsonRpcMessage) -> Self {
        Self {
            message,
            related_request_id: None,
        }
    }

    /// A message delivered on the stream of `request_id`.
    #[must_use]
    pub const fn related_to(message: JsonRpcMessage, request_id: RequestId) -> Self {
        Self {
            message,
            related_request_id: Some(request_id),
        }
    }
}

impl From<JsonRpcMessage> for SessionMessage {
    fn from(message: JsonRpcMessage) -> Self {
        Self::new(message)
    }
}
