//! Core traits for event storage and protocol execution.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{JsonRpcMessage, SessionMessage};

/// Session identifier, as presented in the `mcp-session-id` header.
pub type SessionId = String;

/// Event identifier, as presented in the `last-event-id` header.
pub type EventId = String;

/// Identifier of one ordered stream of events.
pub type StreamId = String;

/// A stored message paired with the id it was stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub message: JsonRpcMessage,
    pub event_id: EventId,
}

/// Event store error.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Event store error: {0}")]
    Internal(String),
}

/// Trait for event store backends used to resume interrupted streams.
///
/// A missing event id is not an error: `replay_events_after` returns
/// `Ok(None)` and the caller starts fresh.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store a message on a stream and return its freshly generated id.
    async fn store_event(
        &self,
        stream_id: &str,
        message: &JsonRpcMessage,
    ) -> Result<EventId, EventStoreError>;

    /// Deliver every event stored after `last_event_id` on the same stream,
    /// oldest first, and return that stream's id.
    async fn replay_events_after(
        &self,
        last_event_id: &str,
        deliver: &mut (dyn FnMut(EventMessage) + Send),
    ) -> Result<Option<StreamId>, EventStoreError>;

    /// Release everything retained for a stream that can no longer be resumed.
    async fn forget_stream(&self, _stream_id: &str) -> Result<(), EventStoreError> {
        Ok(())
    }
}

/// Channel pair handed to a protocol engine for one session.
#[derive(Debug)]
pub struct SessionStreams {
    /// Messages submitted by the client.
    pub inbound: mpsc::Receiver<SessionMessage>,
    /// Messages produced for the client.
    pub outbound: mpsc::Sender<SessionMessage>,
}

/// Engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Outbound channel closed")]
    ChannelClosed,
    #[error("Engine failed: {0}")]
    Failed(String),
}

/// Trait for the protocol engine that serves a session.
///
/// `run` returns when the inbound channel closes or the engine decides the
/// session is over. It may be dropped at any await point on shutdown.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Serve one session until it ends.
    async fn run(&self, streams: SessionStreams) -> Result<(), EngineError>;
}
