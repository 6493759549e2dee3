//! Scripted HTTP transport
//!
//! [`ScriptedTransport`] answers requests from per-route scripts so fan-out
//! tests do not depend on the order concurrent requests arrive in.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use async_trait::async_trait;
use correlate_runtime::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use http::{Method, StatusCode};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Outcome = Result<HttpResponse, TransportError>;

#[derive(Default)]
struct Route {
    outcomes: VecDeque<Outcome>,
    delay: Option<Duration>,
}

/// Transport answering from scripted outcomes keyed by method and URL.
///
/// Outcomes for a route are consumed in order; the last one repeats.
/// Unscripted routes answer `404`.
///
/// # Example
///
/// ```
/// use correlate_testing::ScriptedTransport;
/// use correlate_runtime::transport::{HttpRequest, Transport};
/// use http::{Method, StatusCode};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport =
///     ScriptedTransport::new().respond(Method::GET, "http://svc/ping", StatusCode::OK, "pong");
/// let response = transport.send(&HttpRequest::new(Method::GET, "http://svc/ping")).await?;
/// assert_eq!(response.body, b"pong");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    routes: Arc<Mutex<HashMap<(Method, String), Route>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("routes", &self.routes.lock().unwrap().len())
            .field("requests", &self.requests.lock().unwrap().len())
            .finish()
    }
}

impl ScriptedTransport {
    /// Create a transport with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a response to the script of `method url`.
    #[must_use]
    pub fn respond(
        self,
        method: Method,
        url: &str,
        status: StatusCode,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        self.push(method, url, Ok(HttpResponse::new(status, body)));
        self
    }

    /// Append a transport failure to the script of `method url`.
    #[must_use]
    pub fn fail(self, method: Method, url: &str, error: TransportError) -> Self {
        self.push(method, url, Err(error));
        self
    }

    /// Delay every answer on `method url`.
    #[must_use]
    pub fn delay(self, method: Method, url: &str, delay: Duration) -> Self {
        self.routes
            .lock()
            .unwrap()
            .entry((method, url.to_string()))
            .or_default()
            .delay = Some(delay);
        self
    }

    fn push(&self, method: Method, url: &str, outcome: Outcome) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, url.to_string()))
            .or_default()
            .outcomes
            .push_back(outcome);
    }

    /// Every request received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests received for `method url`.
    #[must_use]
    pub fn request_count(&self, method: &Method, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == *method && r.url == url)
            .count()
    }

    fn next(&self, request: &HttpRequest) -> (Outcome, Option<Duration>) {
        let mut routes = self.routes.lock().unwrap();
        let Some(route) = routes.get_mut(&(request.method.clone(), request.url.clone())) else {
            return (Ok(HttpResponse::new(StatusCode::NOT_FOUND, "")), None);
        };
        let outcome = if route.outcomes.len() > 1 {
            route.outcomes.pop_front()
        } else {
            route.outcomes.front().cloned()
        };
        (
            outcome.unwrap_or_else(|| Ok(HttpResponse::new(StatusCode::NOT_FOUND, ""))),
            route.delay,
        )
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let (outcome, delay) = self.next(request);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}
