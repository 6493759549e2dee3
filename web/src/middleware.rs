//! Axum middleware for session tracking.
//!
//! The session id ties every Detail and Summary record of one client
//! interaction together.
//!
//! # Flow
//!
//! 1. **Extract** the session from the `x-session-id` header (or generate a UUIDv7)
//! 2. **Store** it in request extensions as a [`Session`]
//! 3. **Create tracing span** with the session field
//! 4. **Echo** the session in the response `x-session-id` header
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use correlate_web::middleware::session_layer;
//!
//! let app = Router::new()
//!     .route("/register", post(register))
//!     .layer(session_layer());
//! ```

use crate::extractors::Session;
use axum::{extract::Request, http::HeaderValue, response::Response};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

/// Header carrying the session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Create a layer that adds session tracking to all requests.
#[must_use]
pub const fn session_layer() -> SessionLayer {
    SessionLayer
}

/// Layer for session tracking.
#[derive(Clone, Copy, Debug)]
pub struct SessionLayer;

impl<S> Layer<S> for SessionLayer {
    type Service = SessionMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionMiddleware { inner }
    }
}

/// Middleware service for session tracking.
#[derive(Clone, Debug)]
pub struct SessionMiddleware<S> {
    inner: S,
}

impl<S> Service<Request> for SessionMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let session = Session::from_headers(req.headers());
        req.extensions_mut().insert(session.clone());

        let span = tracing::info_span!(
            "http_request",
            session = %session.0,
            method = %req.method(),
            uri = %req.uri(),
        );

        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.instrument(span).await?;

            if let Ok(value) = HeaderValue::from_str(&session.0) {
                response.headers_mut().insert(SESSION_HEADER, value);
            }

            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/test", get(|session: Session| async move { session.0 }))
            .layer(session_layer())
    }

    #[tokio::test]
    async fn session_generated_if_missing() {
        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();

        let response = app().oneshot(request).await.unwrap();

        let session = response
            .headers()
            .get(SESSION_HEADER)
            .expect("Session header should be present")
            .to_str()
            .unwrap()
            .to_string();
        assert!(uuid::Uuid::parse_str(&session).is_ok());

        // The handler saw the same session the response echoes.
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body, session.as_bytes());
    }

    #[tokio::test]
    async fn session_preserved_from_request() {
        let request = Request::builder()
            .uri("/test")
            .header(SESSION_HEADER, "sess-from-client")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        let session = response
            .headers()
            .get(SESSION_HEADER)
            .expect("Session header should be present")
            .to_str()
            .unwrap();
        assert_eq!(session, "sess-from-client");
    }
}
