//! Streamable HTTP transport for MCP sessions.
//!
//! Provides:
//! - Wire protocol helpers (headers, payload parsing, SSE framing)
//! - Per-session transport with resumable SSE streams
//! - Server context wiring the registry, supervisor and event store
//! - Axum router dispatching requests by `mcp-session-id`
//! - Authorization hook

pub mod auth;
pub mod context;
pub mod error;
pub mod protocol;
pub mod router;
pub mod streamable_http;

pub use auth::{AllowAll, AuthDecision, Authorizer, BearerTokenAuthorizer};
pub use context::{ServerConfig, ServerContext};
pub use error::{RouterError, TransportError};
pub use router::{MCP_PATH, router, router_with_authorizer};
pub use streamable_http::{OutboundRouter, StreamableHttpTransport, TransportConfig};
