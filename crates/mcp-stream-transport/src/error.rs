//! Transport and router errors and their HTTP renderings.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use mcp_stream_core::{
    EventStoreError, JsonRpcMessage, SessionId,
    message::{INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR},
};
use mcp_stream_session::{RegistryError, SupervisorError};

/// Error while handling a request on an existing session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not Acceptable: {0}")]
    NotAcceptable(&'static str),
    #[error("Unsupported Media Type: Content-Type must be application/json")]
    UnsupportedMediaType,
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    InvalidMessage(String),
    #[error("Failed to read request body: {0}")]
    Body(String),
    #[error("Conflict: Only one SSE stream is allowed per session")]
    StreamConflict,
    #[error("Session has been terminated")]
    Terminated,
    #[error("Method Not Allowed")]
    MethodNotAllowed,
    #[error("Transport already connected")]
    AlreadyConnected,
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

impl TransportError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Parse(_) | Self::InvalidMessage(_) | Self::Body(_) => StatusCode::BAD_REQUEST,
            Self::StreamConflict => StatusCode::CONFLICT,
            Self::Terminated => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::AlreadyConnected | Self::EventStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => PARSE_ERROR,
            Self::AlreadyConnected | Self::EventStore(_) => INTERNAL_ERROR,
            _ => INVALID_REQUEST,
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Transport failure");
        } else {
            tracing::debug!(error = %self, %status, "Rejected request");
        }

        let body = JsonRpcMessage::error(None, self.code(), self.to_string());
        let mut response = (status, Json(body)).into_response();
        if matches!(self, Self::MethodNotAllowed) {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, POST, DELETE"));
        }
        response
    }
}

/// Error while dispatching a request to a session.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Bad Request: No valid session ID provided")]
    UnknownSession(SessionId),
    #[error("Bad Request: Missing session ID")]
    MissingSession,
    #[error("Bad Request: Session ID header is not valid ASCII")]
    MalformedSession,
    #[error("Task supervisor unavailable: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<RegistryError> for RouterError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownSession(id) => Self::UnknownSession(id),
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        match self {
            Self::UnknownSession(ref session_id) => {
                tracing::debug!(%session_id, "Rejected unknown session");
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            Self::MissingSession | Self::MalformedSession => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            Self::Supervisor(ref err) => {
                // Lifecycle wiring is broken; nothing a client can do about it.
                tracing::error!(error = %err, "Cannot start session task");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
            Self::Transport(err) => err.into_response(),
        }
    }
}
