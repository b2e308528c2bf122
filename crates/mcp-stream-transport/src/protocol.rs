//! Wire protocol for the streamable HTTP transport.

use axum::{http::HeaderMap, response::sse::Event};
use mcp_stream_core::{EventId, JsonRpcMessage};
use serde::Deserialize;
use serde_json::Value;

use crate::error::TransportError;

/// Header carrying the session identity on every request after the first.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
/// Header carrying the resume marker on stream-establishing requests.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";
/// JSON media type.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Server-Sent Events media type.
pub const CONTENT_TYPE_SSE: &str = "text/event-stream";
/// SSE event name used for every delivered message.
pub const SSE_EVENT_MESSAGE: &str = "message";
/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Body of a message-submitting request: one message or a batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ClientPayload {
    Batch(Vec<JsonRpcMessage>),
    Single(JsonRpcMessage),
}

impl ClientPayload {
    /// Parse a request body.
    ///
    /// # Errors
    /// Returns `Parse` for invalid JSON and `InvalidMessage` for JSON that is
    /// not a message or a non-empty batch of messages.
    pub fn parse(body: &[u8]) -> Result<Self, TransportError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| TransportError::Parse(e.to_string()))?;
        let payload: Self = serde_json::from_value(value)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        match payload {
            Self::Batch(ref messages) if messages.is_empty() => Err(
                TransportError::InvalidMessage("empty batch".to_string()),
            ),
            payload => Ok(payload),
        }
    }

    /// Whether the body was a JSON array.
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    /// The contained messages, in body order.
    #[must_use]
    pub fn into_messages(self) -> Vec<JsonRpcMessage> {
        match self {
            Self::Batch(messages) => messages,
            Self::Single(message) => vec![message],
        }
    }
}

/// A message on its way to an HTTP listener, tagged with its event id when
/// the session records events.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event_id: Option<EventId>,
    pub message: JsonRpcMessage,
}

impl Delivery {
    /// Render as an SSE event.
    #[must_use]
    pub fn to_sse_event(&self) -> Event {
        let event = Event::default().event(SSE_EVENT_MESSAGE);
        let event = match &self.event_id {
            Some(id) => event.id(id),
            None => event,
        };
        event.json_data(&self.message).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize message: {e}");
            Event::default().comment("serialization error")
        })
    }
}

/// Whether the `Accept` header lists `media_type`.
#[must_use]
pub fn accepts(headers: &HeaderMap, media_type: &str) -> bool {
    headers
        .get_all(axum::http::header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|item| item.split(';').next())
        .any(|item| item.trim().eq_ignore_ascii_case(media_type))
}

/// Whether the `Content-Type` header is JSON.
#[must_use]
pub fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
}
