//! Streamable HTTP session transport.
//!
//! One `StreamableHttpTransport` serves one session. It turns HTTP requests
//! into messages on the engine's inbound channel, and routes the engine's
//! outbound messages back to whichever HTTP response is waiting for them:
//!
//! - a reply (or a message related to a request) goes to the stream opened by
//!   the POST that carried that request;
//! - everything else goes to the session's standalone GET stream.
//!
//! With an event store attached, every routed message is recorded before it
//! is delivered, so a client can reconnect with `last-event-id` and pick up
//! where it left off.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    convert::Infallible,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::{
    Json,
    extract::Request,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
};
use futures::StreamExt;
use mcp_stream_core::{
    EventMessage, EventStore, JsonRpcMessage, RequestId, SessionId, SessionMessage,
    SessionStreams, StreamId,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::TransportError,
    protocol::{
        CONTENT_TYPE_JSON, CONTENT_TYPE_SSE, ClientPayload, Delivery, LAST_EVENT_ID_HEADER,
        MAX_BODY_BYTES, MCP_SESSION_ID_HEADER, accepts, is_json_content,
    },
};

/// Default capacity of the inbound and outbound session channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
/// Default interval between SSE keep-alive comments.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
/// Default number of answered request streams kept resumable per session.
pub const DEFAULT_RETAINED_REQUEST_STREAMS: usize = 64;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Answer POSTs with a single JSON body instead of an SSE stream.
    pub json_response: bool,
    /// Capacity of the inbound and outbound session channels.
    pub channel_capacity: usize,
    /// Interval between SSE keep-alive comments.
    pub keep_alive: Duration,
    /// Answered request streams kept in the event store for resumption.
    /// Older ones are forgotten as new requests finish.
    pub retained_request_streams: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            json_response: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            keep_alive: DEFAULT_KEEP_ALIVE,
            retained_request_streams: DEFAULT_RETAINED_REQUEST_STREAMS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StreamKey {
    Standalone,
    Request(RequestId),
}

type Listener = mpsc::UnboundedSender<Delivery>;

#[derive(Default)]
struct StreamTable {
    /// Streams that currently accept messages, with their attached listener.
    slots: HashMap<StreamKey, Option<Listener>>,
    /// Event store streams this session has written to.
    recorded: HashSet<StreamId>,
    /// Recorded request streams whose reply went out, oldest first.
    answered: VecDeque<StreamId>,
}

/// Per-session HTTP transport.
pub struct StreamableHttpTransport {
    session_id: SessionId,
    config: TransportConfig,
    event_store: Option<Arc<dyn EventStore>>,
    inbound_tx: mpsc::Sender<SessionMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<SessionMessage>>>,
    streams: tokio::sync::Mutex<StreamTable>,
    closed: CancellationToken,
}

impl StreamableHttpTransport {
    /// Create a transport for `session_id`. Resumability is enabled iff an
    /// event store is given.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        config: TransportConfig,
        event_store: Option<Arc<dyn EventStore>>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let mut table = StreamTable::default();
        table.slots.insert(StreamKey::Standalone, None);

        Self {
            session_id,
            config,
            event_store,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            streams: tokio::sync::Mutex::new(table),
            closed: CancellationToken::new(),
        }
    }

    /// Session this transport serves.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the session has been terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is terminated.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Hand out the engine's channel pair and the router that drains its output.
    ///
    /// # Errors
    /// Returns error if called more than once.
    pub fn connect(self: &Arc<Self>) -> Result<(SessionStreams, OutboundRouter), TransportError> {
        let inbound = self
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::AlreadyConnected)?;
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.channel_capacity.max(1));

        let streams = SessionStreams {
            inbound,
            outbound: outbound_tx,
        };
        let router = OutboundRouter {
            transport: Arc::clone(self),
            outbound: outbound_rx,
        };
        Ok((streams, router))
    }

    /// Terminate the session: drop every listener and forget recorded events.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        self.closed.cancel();
        let recorded = {
            let mut table = self.streams.lock().await;
            table.slots.clear();
            table.answered.clear();
            std::mem::take(&mut table.recorded)
        };
        if let Some(store) = &self.event_store {
            for stream_id in recorded {
                if let Err(e) = store.forget_stream(&stream_id).await {
                    tracing::warn!(session_id = %self.session_id, %stream_id, error = %e, "Failed to release stream");
                }
            }
        }
    }

    /// Handle one HTTP request for this session.
    pub async fn handle_request(&self, req: Request) -> Response {
        let result = if self.is_closed() {
            Err(TransportError::Terminated)
        } else {
            let method = req.method().clone();
            match method {
                Method::POST => self.handle_post(req).await,
                Method::GET => self.handle_get(req.headers()).await,
                Method::DELETE => self.handle_delete().await,
                _ => Err(TransportError::MethodNotAllowed),
            }
        };

        let mut response = result.unwrap_or_else(IntoResponse::into_response);
        if let Ok(value) = HeaderValue::from_str(&self.session_id) {
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
        response
    }

    async fn handle_post(&self, req: Request) -> Result<Response, TransportError> {
        let (parts, body) = req.into_parts();
        if !(accepts(&parts.headers, CONTENT_TYPE_JSON) && accepts(&parts.headers, CONTENT_TYPE_SSE)) {
            return Err(TransportError::NotAcceptable(
                "Client must accept both application/json and text/event-stream",
            ));
        }
        if !is_json_content(&parts.headers) {
            return Err(TransportError::UnsupportedMediaType);
        }

        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;
        let payload = ClientPayload::parse(&body)?;
        let is_batch = payload.is_batch();
        let messages = payload.into_messages();

        let request_ids: Vec<RequestId> = messages
            .iter()
            .filter(|m| m.is_request())
            .filter_map(|m| m.id().cloned())
            .collect();

        if request_ids.is_empty() {
            for message in messages {
                self.push_inbound(message).await?;
            }
            return Ok(StatusCode::ACCEPTED.into_response());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut table = self.streams.lock().await;
            if self.is_closed() {
                return Err(TransportError::Terminated);
            }
            for id in &request_ids {
                table
                    .slots
                    .insert(StreamKey::Request(id.clone()), Some(tx.clone()));
            }
        }
        drop(tx);

        for message in messages {
            if let Err(e) = self.push_inbound(message).await {
                let mut table = self.streams.lock().await;
                for id in &request_ids {
                    table.slots.remove(&StreamKey::Request(id.clone()));
                }
                return Err(e);
            }
        }

        if self.config.json_response {
            self.json_reply(rx, is_batch).await
        } else {
            Ok(self.sse_response(rx))
        }
    }

    async fn handle_get(&self, headers: &HeaderMap) -> Result<Response, TransportError> {
        if !accepts(headers, CONTENT_TYPE_SSE) {
            return Err(TransportError::NotAcceptable(
                "Client must accept text/event-stream",
            ));
        }

        let marker = headers
            .get(LAST_EVENT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        if let Some(marker) = marker {
            if let Some(response) = self.resume(marker).await? {
                return Ok(response);
            }
            // Lenient resume: an unusable marker degrades to a live stream.
            return self.attach_standalone(true).await;
        }

        self.attach_standalone(false).await
    }

    async fn handle_delete(&self) -> Result<Response, TransportError> {
        tracing::info!(session_id = %self.session_id, "Session terminated by client");
        self.close().await;
        Ok(StatusCode::OK.into_response())
    }

    async fn push_inbound(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.inbound_tx
            .send(SessionMessage::new(message))
            .await
            .map_err(|_| TransportError::Terminated)
    }

    async fn attach_standalone(&self, replace: bool) -> Result<Response, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut table = self.streams.lock().await;
            let Some(slot) = table.slots.get_mut(&StreamKey::Standalone) else {
                return Err(TransportError::Terminated);
            };
            if !replace && slot.as_ref().is_some_and(|listener| !listener.is_closed()) {
                return Err(TransportError::StreamConflict);
            }
            *slot = Some(tx);
        }
        tracing::debug!(session_id = %self.session_id, "Standalone stream attached");
        Ok(self.sse_response(rx))
    }

    /// Replay after `marker` and continue live on the stream it belongs to.
    ///
    /// Returns `None` when the marker cannot be used.
    async fn resume(&self, marker: &str) -> Result<Option<Response>, TransportError> {
        let Some(store) = &self.event_store else {
            return Ok(None);
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            // Held across replay so routing cannot slip a message in between
            // the replayed tail and the live listener.
            let mut table = self.streams.lock().await;
            let mut replayed: Vec<EventMessage> = Vec::new();
            let stream_id = store
                .replay_events_after(marker, &mut |event: EventMessage| replayed.push(event))
                .await?;

            let Some(stream_id) = stream_id else {
                tracing::info!(session_id = %self.session_id, %marker, "Replay miss, starting live");
                return Ok(None);
            };
            if !table.recorded.contains(&stream_id) {
                tracing::warn!(session_id = %self.session_id, %marker, "Resume marker belongs to another session");
                return Ok(None);
            }

            tracing::info!(
                session_id = %self.session_id,
                %stream_id,
                replayed = replayed.len(),
                "Resuming stream"
            );
            for event in replayed {
                let _ = tx.send(Delivery {
                    event_id: Some(event.event_id),
                    message: event.message,
                });
            }

            let live = table
                .slots
                .iter_mut()
                .find(|(key, _)| self.stream_id_for(key) == stream_id)
                .map(|(_, slot)| slot);
            match live {
                Some(slot) => *slot = Some(tx),
                // The request already got its reply; the stream ends after replay.
                None => drop(tx),
            }
        }

        Ok(Some(self.sse_response(rx)))
    }

    async fn json_reply(
        &self,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
        is_batch: bool,
    ) -> Result<Response, TransportError> {
        let mut replies = Vec::new();
        while let Some(delivery) = rx.recv().await {
            if delivery.message.is_reply() {
                replies.push(delivery.message);
            }
        }

        match (is_batch, replies.len()) {
            (_, 0) => Err(TransportError::Terminated),
            (false, 1) => Ok(Json(replies.remove(0)).into_response()),
            _ => Ok(Json(replies).into_response()),
        }
    }

    fn sse_response(&self, rx: mpsc::UnboundedReceiver<Delivery>) -> Response {
        let events = UnboundedReceiverStream::new(rx)
            .map(|delivery| Ok::<_, Infallible>(delivery.to_sse_event()));
        Sse::new(events)
            .keep_alive(KeepAlive::new().interval(self.config.keep_alive))
            .into_response()
    }

    /// Event store stream id for a slot. String request ids are quoted so
    /// that `1` and `"1"` never share a stream.
    fn stream_id_for(&self, key: &StreamKey) -> StreamId {
        match key {
            StreamKey::Standalone => self.session_id.clone(),
            StreamKey::Request(RequestId::Number(n)) => format!("{}/{n}", self.session_id),
            StreamKey::Request(RequestId::String(s)) => format!("{}/{s:?}", self.session_id),
        }
    }

    /// Forget answered request streams beyond the retention limit.
    async fn trim_answered(&self, table: &mut StreamTable) {
        let Some(store) = &self.event_store else {
            return;
        };
        while table.answered.len() > self.config.retained_request_streams {
            let Some(stream_id) = table.answered.pop_front() else {
                break;
            };
            table.recorded.remove(&stream_id);
            if let Err(e) = store.forget_stream(&stream_id).await {
                tracing::warn!(session_id = %self.session_id, %stream_id, error = %e, "Failed to release stream");
            }
        }
    }

    async fn route(&self, outgoing: SessionMessage) {
        let SessionMessage {
            message,
            related_request_id,
        } = outgoing;

        let key = if message.is_reply() {
            message.id().cloned().map(StreamKey::Request)
        } else {
            related_request_id.map(StreamKey::Request)
        }
        .unwrap_or(StreamKey::Standalone);

        let mut table = self.streams.lock().await;
        if !table.slots.contains_key(&key) {
            tracing::debug!(session_id = %self.session_id, ?key, "No stream for outbound message, dropping");
            return;
        }

        let stream_id = self.stream_id_for(&key);
        let event_id = match &self.event_store {
            Some(store) => match store.store_event(&stream_id, &message).await {
                Ok(event_id) => {
                    table.recorded.insert(stream_id.clone());
                    Some(event_id)
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "Failed to record event");
                    None
                }
            },
            None => None,
        };

        let is_final = message.is_reply() && matches!(key, StreamKey::Request(_));
        if let Some(slot) = table.slots.get_mut(&key) {
            if let Some(listener) = slot.as_ref() {
                if listener.send(Delivery { event_id, message }).is_err() {
                    tracing::debug!(session_id = %self.session_id, ?key, "Listener disconnected");
                    *slot = None;
                }
            }
        }
        if is_final {
            table.slots.remove(&key);
            if table.recorded.contains(&stream_id) {
                table.answered.push_back(stream_id);
                self.trim_answered(&mut table).await;
            }
        }
    }
}

/// Drains the engine's outbound channel into the transport's streams.
pub struct OutboundRouter {
    transport: Arc<StreamableHttpTransport>,
    outbound: mpsc::Receiver<SessionMessage>,
}

impl OutboundRouter {
    /// Route messages until the engine drops its sender.
    pub async fn run(mut self) {
        while let Some(message) = self.outbound.recv().await {
            self.transport.route(message).await;
        }
        tracing::debug!(session_id = %self.transport.session_id, "Outbound channel closed");
    }
}

#[cfg(test)]
pub(crate) fn json_body(message: &JsonRpcMessage) -> axum::body::Body {
    axum::body::Body::from(serde_json::to_vec(message).unwrap())
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::header};
    use mcp_stream_core::InMemoryEventStore;
    use serde_json::json;

    use super::*;

    fn transport(store: Option<Arc<dyn EventStore>>) -> Arc<StreamableHttpTransport> {
        Arc::new(StreamableHttpTransport::new(
            "sess".to_string(),
            TransportConfig::default(),
            store,
        ))
    }

    fn post(body: &JsonRpcMessage) -> Request {
        Request::builder()
            .method(Method::POST)
            .header(header::ACCEPT, "application/json, text/event-stream")
            .header(header::CONTENT_TYPE, "application/json")
            .body(json_body(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let transport = transport(None);
        assert!(transport.connect().is_ok());
        assert!(matches!(
            transport.connect(),
            Err(TransportError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_notification_post_is_accepted_and_forwarded() {
        let transport = transport(None);
        let (mut streams, _router) = transport.connect().unwrap();

        let note = JsonRpcMessage::notification("notifications/initialized", None);
        let response = transport.handle_request(post(&note)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[MCP_SESSION_ID_HEADER], "sess");

        let received = streams.inbound.recv().await.unwrap();
        assert_eq!(received.message, note);
    }

    #[tokio::test]
    async fn test_routing_records_events_per_stream() {
        let store = Arc::new(InMemoryEventStore::new());
        let transport = transport(Some(store.clone()));
        {
            let mut table = transport.streams.lock().await;
            table.slots.insert(StreamKey::Request(RequestId::Number(1)), None);
        }

        transport
            .route(SessionMessage::related_to(
                JsonRpcMessage::notification("notifications/message", None),
                RequestId::Number(1),
            ))
            .await;
        transport
            .route(SessionMessage::new(JsonRpcMessage::notification(
                "notifications/resources/updated",
                Some(json!({"uri": "http:///test_resource"})),
            )))
            .await;
        transport
            .route(SessionMessage::new(JsonRpcMessage::response(
                RequestId::Number(1),
                json!({}),
            )))
            .await;

        assert_eq!(store.stream_len("sess/1"), 2);
        assert_eq!(store.stream_len("sess"), 1);
        // The reply retired the request stream.
        let table = transport.streams.lock().await;
        assert!(!table.slots.contains_key(&StreamKey::Request(RequestId::Number(1))));
    }

    #[tokio::test]
    async fn test_numeric_and_string_ids_use_separate_streams() {
        let transport = transport(None);
        assert_eq!(
            transport.stream_id_for(&StreamKey::Request(RequestId::Number(1))),
            "sess/1"
        );
        assert_eq!(
            transport.stream_id_for(&StreamKey::Request(RequestId::from("1"))),
            "sess/\"1\""
        );
    }

    #[tokio::test]
    async fn test_answered_request_streams_are_bounded() {
        let store = Arc::new(InMemoryEventStore::new());
        let transport = Arc::new(StreamableHttpTransport::new(
            "sess".to_string(),
            TransportConfig {
                retained_request_streams: 2,
                ..TransportConfig::default()
            },
            Some(store.clone()),
        ));

        for n in 1..=3 {
            transport
                .streams
                .lock()
                .await
                .slots
                .insert(StreamKey::Request(RequestId::Number(n)), None);
            transport
                .route(SessionMessage::new(JsonRpcMessage::response(
                    RequestId::Number(n),
                    json!({}),
                )))
                .await;
        }

        assert_eq!(store.stream_len("sess/1"), 0);
        assert_eq!(store.stream_len("sess/2"), 1);
        assert_eq!(store.stream_len("sess/3"), 1);
        let table = transport.streams.lock().await;
        assert_eq!(table.recorded.len(), 2);
        assert_eq!(table.answered.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_for_unknown_request_is_dropped() {
        let store = Arc::new(InMemoryEventStore::new());
        let transport = transport(Some(store.clone()));

        transport
            .route(SessionMessage::new(JsonRpcMessage::response(
                RequestId::Number(99),
                json!({}),
            )))
            .await;
        assert_eq!(store.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_close_forgets_recorded_streams() {
        let store = Arc::new(InMemoryEventStore::new());
        let transport = transport(Some(store.clone()));
        transport
            .route(SessionMessage::new(JsonRpcMessage::notification("a", None)))
            .await;
        assert_eq!(store.stream_len("sess"), 1);

        transport.close().await;
        assert!(transport.is_closed());
        assert_eq!(store.stream_count(), 0);

        let response = transport
            .handle_request(post(&JsonRpcMessage::request(1, "ping", None)))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let transport = transport(None);
        let req = Request::builder()
            .method(Method::PUT)
            .body(Body::empty())
            .unwrap();
        let response = transport.handle_request(req).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, POST, DELETE");
    }

    #[tokio::test]
    async fn test_post_requires_both_accept_types() {
        let transport = transport(None);
        let req = Request::builder()
            .method(Method::POST)
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .body(json_body(&JsonRpcMessage::request(1, "ping", None)))
            .unwrap();
        let response = transport.handle_request(req).await;
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }
}
