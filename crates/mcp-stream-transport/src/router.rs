//! HTTP entry point: maps requests to sessions by the `mcp-session-id` header.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::Method,
    middleware,
    response::{IntoResponse, Response},
    routing::any,
};

use crate::{
    auth::{self, Authorizer},
    context::ServerContext,
    error::RouterError,
    protocol::MCP_SESSION_ID_HEADER,
};

/// Path the MCP endpoint is mounted on.
pub const MCP_PATH: &str = "/mcp";

/// Build the MCP router.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route(MCP_PATH, any(handle_mcp))
        .with_state(ctx)
}

/// Build the MCP router behind an authorization check.
pub fn router_with_authorizer(ctx: Arc<ServerContext>, authorizer: Arc<dyn Authorizer>) -> Router {
    Router::new()
        .route(MCP_PATH, any(handle_mcp))
        .route_layer(middleware::from_fn_with_state(authorizer, auth::authorize))
        .with_state(ctx)
}

async fn handle_mcp(State(ctx): State<Arc<ServerContext>>, req: Request) -> Response {
    dispatch(&ctx, req)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn dispatch(ctx: &ServerContext, req: Request) -> Result<Response, RouterError> {
    let session_id = req
        .headers()
        .get(MCP_SESSION_ID_HEADER)
        .map(|value| value.to_str().map(str::to_string))
        .transpose()
        .map_err(|_| RouterError::MalformedSession)?;

    // Only a POST may open a new session.
    if session_id.is_none() && req.method() != Method::POST {
        return Err(RouterError::MissingSession);
    }

    let (session, created) = ctx.get_or_create_session(session_id.as_deref()).await?;
    if created {
        tracing::debug!(session_id = %session.id, "Dispatching to new session");
    }
    Ok(session.transport.handle_request(req).await)
}
