//! Core abstractions for resumable streamable-HTTP sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `JsonRpcMessage` - Tagged JSON-RPC 2.0 envelope
//! - `InMemoryEventStore` - Bounded per-stream event ledger for replay
//! - `EventStore` and `ProtocolEngine` traits

pub mod event_store;
pub mod message;
pub mod traits;

pub use event_store::{DEFAULT_MAX_EVENTS_PER_STREAM, InMemoryEventStore};
pub use message::{JsonRpcMessage, RequestId, SessionMessage};
pub use traits::{
    EngineError, EventId, EventMessage, EventStore, EventStoreError, ProtocolEngine, SessionId,
    SessionStreams, StreamId,
};
