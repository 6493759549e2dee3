//! Custom Axum extractors.
//!
//! - [`Session`]: the session id of the request

use crate::middleware::SESSION_HEADER;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use correlate_core::id;

/// Session id of a request.
///
/// Taken from request extensions when [`session_layer`](crate::session_layer)
/// is installed, otherwise from the `x-session-id` header, otherwise a fresh
/// UUIDv7.
///
/// # Example
///
/// ```ignore
/// async fn handler(session: Session) -> String {
///     format!("Session: {}", session.0)
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session(pub String);

impl Session {
    /// Read the session header, or generate a new session id.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let session = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(id::new_session, str::to_string);
        Self(session)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(session) = parts.extensions.get::<Self>() {
            return Ok(session.clone());
        }
        Ok(Self::from_headers(&parts.headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use uuid::Uuid;

    #[test]
    fn blank_header_generates_session() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("  "));
        let session = Session::from_headers(&headers);
        assert!(Uuid::parse_str(&session.0).is_ok());
    }

    #[test]
    fn header_is_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static(" s-1 "));
        assert_eq!(Session::from_headers(&headers), Session("s-1".to_string()));
    }
}
