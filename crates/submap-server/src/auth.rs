//! API token authentication.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::ServerError;
use crate::AppState;

/// Token presented in `Authorization: Token <t>` (or `Bearer <t>`).
pub fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

/// Reject requests without an accepted API token.
pub async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized =
        presented_token(request.headers()).is_some_and(|token| state.config.accepts_token(token));
    if !authorized {
        debug!(path = %request.uri().path(), "rejected unauthenticated request");
        return ServerError::Unauthorized.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_presented_token() {
        assert_eq!(presented_token(&headers("Token abc")), Some("abc"));
        assert_eq!(presented_token(&headers("bearer abc")), Some("abc"));
        assert_eq!(presented_token(&headers("Basic abc")), None);
        assert_eq!(presented_token(&headers("abc")), None);
        assert_eq!(presented_token(&HeaderMap::new()), None);
    }
}
