//! Request authorization hook.
//!
//! Runs before session dispatch, so an unauthorized request never creates or
//! touches a session.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
}

/// Decides whether a request may reach the MCP endpoint.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, parts: &Parts) -> AuthDecision;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _parts: &Parts) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// Accepts requests carrying `Authorization: Bearer <token>`.
///
/// Without a pinned token any well-formed bearer credential is accepted;
/// validating it is left to whatever sits in front of the server.
#[derive(Clone, Default)]
pub struct BearerTokenAuthorizer {
    token: Option<String>,
}

impl BearerTokenAuthorizer {
    /// Accept any bearer token.
    #[must_use]
    pub const fn any() -> Self {
        Self { token: None }
    }

    /// Accept only `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }
}

impl std::fmt::Debug for BearerTokenAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerTokenAuthorizer")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Authorizer for BearerTokenAuthorizer {
    fn authorize(&self, parts: &Parts) -> AuthDecision {
        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_bearer);

        match (presented, &self.token) {
            (Some(_), None) => AuthDecision::Allow,
            (Some(token), Some(expected)) if token == expected => AuthDecision::Allow,
            _ => AuthDecision::Deny,
        }
    }
}

/// Token from an `Authorization` value of the form `Bearer <token>`.
fn extract_bearer(value: &str) -> Option<&str> {
    let mut parts = value.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

/// Middleware rejecting requests the authorizer denies.
pub async fn authorize(
    State(authorizer): State<Arc<dyn Authorizer>>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    match authorizer.authorize(&parts) {
        AuthDecision::Allow => next.run(Request::from_parts(parts, body)).await,
        AuthDecision::Deny => {
            tracing::debug!(method = %parts.method, "Rejected unauthorized request");
            let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    fn parts(authorization: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/mcp");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("bearer   abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
        assert_eq!(extract_bearer("Bearer"), None);
        assert_eq!(extract_bearer("Bearer a b"), None);
    }

    #[test]
    fn test_bearer_authorizer() {
        let auth = BearerTokenAuthorizer::new("s3cret");
        assert_eq!(auth.authorize(&parts(Some("Bearer s3cret"))), AuthDecision::Allow);
        assert_eq!(auth.authorize(&parts(Some("Bearer wrong"))), AuthDecision::Deny);
        assert_eq!(auth.authorize(&parts(None)), AuthDecision::Deny);
        assert!(!format!("{auth:?}").contains("s3cret"));
    }

    #[test]
    fn test_any_bearer_token() {
        let auth = BearerTokenAuthorizer::any();
        assert_eq!(auth.authorize(&parts(Some("Bearer whatever"))), AuthDecision::Allow);
        assert_eq!(auth.authorize(&parts(Some("Basic dXNlcg=="))), AuthDecision::Deny);
        assert_eq!(auth.authorize(&parts(None)), AuthDecision::Deny);
    }

    #[test]
    fn test_allow_all() {
        assert_eq!(AllowAll.authorize(&parts(None)), AuthDecision::Allow);
    }
}
