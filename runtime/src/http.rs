//! Logged HTTP fan-out.
//!
//! [`HttpCaller::request`] dispatches a list of requests concurrently and
//! records each one in the caller's transaction:
//!
//! 1. an output request event (`<node>.<cmd>`, protocol `http.<METHOD>`)
//!    holding the URL, headers, query and body actually sent
//! 2. an input response event under the same invoke id once the exchange ends
//! 3. a summary block with the status code, or `"500"` and the error text
//!    when no response was received
//!
//! Each request runs on its own task. At most `max_concurrency` run at once
//! (a semaphore permit is taken before spawning) and each has its own
//! `worker_timeout` covering every retry attempt. Responses come back in the
//! order the requests were given.

use crate::metrics::HttpMetrics;
use crate::retry::RetryConfig;
use crate::transport::{HttpRequest, ReqwestTransport, RetryTransport, Transport, TransportError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use correlate_core::id;
use correlate_core::{Direction, ErrorDetail, NewEvent, Payload, Transaction};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Fan-out limits.
///
/// # Default Values
///
/// - `max_concurrency`: 100
/// - `worker_timeout`: 15 seconds
/// - `retry`: [`RetryConfig::default`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpCallerConfig {
    /// Maximum number of requests in flight at once
    pub max_concurrency: usize,
    /// Deadline of one request, all retry attempts included
    pub worker_timeout: Duration,
    /// Transport-level retry policy
    pub retry: RetryConfig,
}

impl Default for HttpCallerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
            worker_timeout: Duration::from_secs(15),
            retry: RetryConfig::default(),
        }
    }
}

/// Basic credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasicAuth {
    /// User name.
    pub username: String,
    /// Password; masked in the detail log.
    pub password: String,
}

/// One request of a fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestAttributes {
    /// Method.
    pub method: Method,
    /// URL template; `{name}` and `:name` segments are substituted from `params`.
    pub url: String,
    /// Node name used in the logs.
    pub node: String,
    /// Command name used in the logs.
    pub cmd: String,
    /// Invoke id; generated from the node name when unset.
    pub invoke: Option<String>,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Path parameters.
    pub params: Vec<(String, String)>,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
    /// Basic authentication.
    pub auth: Option<BasicAuth>,
    /// Per-exchange timeout (one attempt).
    pub timeout: Option<Duration>,
    /// Overrides the caller's `max_attempts`.
    pub retry_count: Option<u32>,
}

impl RequestAttributes {
    /// Describe a request to `url`, logged as `node.cmd`.
    #[must_use]
    pub fn new(
        method: Method,
        url: impl Into<String>,
        node: impl Into<String>,
        cmd: impl Into<String>,
    ) -> Self {
        Self {
            method,
            url: url.into(),
            node: node.into(),
            cmd: cmd.into(),
            invoke: None,
            headers: Vec::new(),
            params: Vec::new(),
            query: Vec::new(),
            body: None,
            auth: None,
            timeout: None,
            retry_count: None,
        }
    }

    /// Set the invoke id.
    #[must_use]
    pub fn invoke(mut self, invoke: impl Into<String>) -> Self {
        self.invoke = Some(invoke.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add a path parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Add a query parameter.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set basic authentication.
    #[must_use]
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(BasicAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the per-exchange timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the number of attempts.
    #[must_use]
    pub const fn retry_count(mut self, attempts: u32) -> Self {
        self.retry_count = Some(attempts);
        self
    }

    /// URL with path parameters substituted and the query string appended.
    #[must_use]
    pub fn resolved_url(&self) -> String {
        let mut url = self.url.clone();
        for (name, value) in &self.params {
            let braced = format!("{{{name}}}");
            let colon = format!(":{name}");
            if url.contains(&braced) {
                url = url.replace(&braced, value);
            } else if url.contains(&colon) {
                url = url.replace(&colon, value);
            }
        }

        if !self.query.is_empty() {
            let mut query = self.query.clone();
            query.sort();
            let encoded: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&encoded.join("&"));
        }
        url
    }

    fn protocol(&self) -> String {
        format!("http.{}", self.method)
    }

    fn build(&self) -> Result<HttpRequest, TransportError> {
        let mut request = HttpRequest::new(self.method.clone(), self.resolved_url());
        request.timeout = self.timeout;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }
        if let Some(body) = &self.body {
            request.body = serde_json::to_vec(body)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            headers
                .entry(CONTENT_TYPE)
                .or_insert(HeaderValue::from_static("application/json"));
        }
        if let Some(auth) = &self.auth {
            let credentials = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
            let value = format!("Basic {credentials}");
            let value = HeaderValue::try_from(value)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        request.headers = headers;
        Ok(request)
    }

    fn process_log(&self) -> Value {
        serde_json::json!({
            "header": pairs_to_json(&self.headers),
            "url": self.resolved_url(),
            "queryString": pairs_to_json(&self.query),
            "body": self.body,
            "method": self.method.as_str(),
            "retryCount": self.retry_count,
            "timeout": self.timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            "auth": self.auth,
        })
    }
}

fn pairs_to_json(pairs: &[(String, String)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Outcome of one request of a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    /// Status code; `500` when no response was received.
    pub status: u16,
    /// Status line text or the transport error.
    pub status_text: String,
    /// Body, parsed as JSON when possible.
    pub body: Value,
    /// Transport error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    fn failed(error: &TransportError) -> Self {
        Self {
            status: 500,
            status_text: error.to_string(),
            body: Value::Null,
            error: Some(error.to_string()),
        }
    }

    /// Whether a response with a 2xx status was received.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

/// Dispatches logged HTTP requests.
#[derive(Debug)]
pub struct HttpCaller<T = ReqwestTransport> {
    transport: Arc<RetryTransport<T>>,
    config: HttpCallerConfig,
    semaphore: Arc<Semaphore>,
}

impl<T> Clone for HttpCaller<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

impl HttpCaller<ReqwestTransport> {
    /// Caller over a default `reqwest` client with default limits.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ReqwestTransport::default(), HttpCallerConfig::default())
    }
}

impl<T: Transport + 'static> HttpCaller<T> {
    /// Create a caller over `transport`.
    #[must_use]
    pub fn new(transport: T, config: HttpCallerConfig) -> Self {
        Self {
            transport: Arc::new(RetryTransport::new(transport, config.retry)),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
        }
    }

    /// Dispatch `requests` concurrently, logging each in `txn`.
    ///
    /// Never fails as a whole: a request that received no response yields an
    /// [`ApiResponse`] with status `500` and the error text.
    pub async fn request(
        &self,
        txn: &Transaction,
        requests: Vec<RequestAttributes>,
    ) -> Vec<ApiResponse> {
        let mut handles = Vec::with_capacity(requests.len());

        for attrs in requests {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    handles.push(Err(TransportError::Request(e.to_string())));
                    continue;
                },
            };
            let transport = Arc::clone(&self.transport);
            let txn = txn.clone();
            let config = self.config;

            handles.push(Ok(tokio::spawn(async move {
                let response = dispatch(&transport, &txn, &attrs, config).await;
                drop(permit);
                response
            })));
        }

        let mut responses = Vec::with_capacity(handles.len());
        for handle in handles {
            let response = match handle {
                Ok(join) => match join.await {
                    Ok(response) => response,
                    Err(e) => {
                        ApiResponse::failed(&TransportError::Request(format!("worker failed: {e}")))
                    },
                },
                Err(e) => ApiResponse::failed(&e),
            };
            responses.push(response);
        }
        responses
    }
}

async fn dispatch<T: Transport>(
    transport: &RetryTransport<T>,
    txn: &Transaction,
    attrs: &RequestAttributes,
    config: HttpCallerConfig,
) -> ApiResponse {
    let invoke = attrs.invoke.clone().unwrap_or_else(|| id::generate_x_tid(&attrs.node));
    let protocol = attrs.protocol();
    let detail = txn.detail();
    let summary = txn.summary();

    detail.record(
        NewEvent::new(
            Direction::RequestOut,
            &attrs.node,
            &attrs.cmd,
            &invoke,
            Some(Payload::Structured(attrs.process_log())),
            Payload::Structured(attrs.process_log()),
        )
        .with_protocol(&protocol),
    );

    let retry = attrs.retry_count.map_or(config.retry, |attempts| RetryConfig {
        max_attempts: attempts,
        ..config.retry
    });

    let started = Instant::now();
    let outcome = match attrs.build() {
        Ok(request) => {
            let timeout = config.worker_timeout;
            tokio::time::timeout(timeout, transport.send_with(&request, &retry))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Timeout(format!("worker timeout after {timeout:?}")))
                })
        },
        Err(e) => Err(e),
    };

    let response = match outcome {
        Ok(response) => {
            let status = response.status;
            let body = serde_json::from_slice::<Value>(&response.body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&response.body).into_owned())
            });
            let status_text = status.canonical_reason().unwrap_or("unknown").to_string();
            summary.add_success_block(&attrs.node, &attrs.cmd, status.as_str(), &status_text);
            ApiResponse {
                status: status.as_u16(),
                status_text,
                body,
                error: None,
            }
        },
        Err(e) => {
            tracing::warn!(node = %attrs.node, cmd = %attrs.cmd, error = %e, "HTTP request failed");
            summary.add_error_block(&attrs.node, &attrs.cmd, "500", &e.to_string());
            ApiResponse::failed(&e)
        },
    };

    HttpMetrics::record_call(response.status, started.elapsed());

    let data = match &response.error {
        Some(error) => {
            Payload::Error(ErrorDetail::new(error).with_code(response.status.to_string()))
        },
        None => Payload::from_serialize(&response),
    };
    detail.record(
        NewEvent::new(Direction::ResponseIn, &attrs.node, &attrs.cmd, &invoke, None, data)
            .with_protocol(&protocol),
    );
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use async_trait::async_trait;
    use correlate_core::{
        CorrelationLogger, Inbound, LogConfig, LogSink, Sinks, SystemClock, TransactionMeta,
    };
    use http::StatusCode;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl LogSink for Capture {
        fn write_line(&self, line: &str) -> std::io::Result<()> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            if request.url.contains("down") {
                return Err(TransportError::InvalidRequest("refused".into()));
            }
            let body = json!({"url": request.url, "method": request.method.as_str()});
            Ok(HttpResponse::new(StatusCode::OK, body.to_string()))
        }
    }

    fn transaction() -> Transaction {
        let sinks = Sinks::shared(Arc::new(Capture::default()) as Arc<dyn LogSink>);
        let logger =
            CorrelationLogger::with_sinks(LogConfig::default(), sinks, Arc::new(SystemClock));
        logger.open(TransactionMeta::new("profile.get"), Inbound::new("client", Payload::Empty))
    }

    #[test]
    fn resolves_path_params_and_query() {
        let url = "http://svc/users/{id}/orders/:order";
        let attrs = RequestAttributes::new(Method::GET, url, "svc", "get")
            .param("id", "42")
            .param("order", "7")
            .query("q", "a b")
            .query("page", "1");
        assert_eq!(attrs.resolved_url(), "http://svc/users/42/orders/7?page=1&q=a%20b");
    }

    #[test]
    fn basic_auth_header_is_encoded() {
        let request = RequestAttributes::new(Method::GET, "http://svc", "svc", "get")
            .basic_auth("user", "pass")
            .build()
            .unwrap();
        assert_eq!(request.headers[AUTHORIZATION], "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn fan_out_logs_every_request_in_order() {
        let txn = transaction();
        let caller = HttpCaller::new(Echo, HttpCallerConfig::default());

        let responses = caller
            .request(
                &txn,
                vec![
                    RequestAttributes::new(Method::GET, "http://svc/a", "svc", "get_a"),
                    RequestAttributes::new(Method::POST, "http://down/b", "peer", "post_b")
                        .json(json!({"x": 1})),
                    RequestAttributes::new(Method::GET, "http://svc/c", "svc", "get_c"),
                ],
            )
            .await;

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].body["url"], "http://svc/a");
        assert_eq!(responses[1].status, 500);
        assert!(responses[1].error.is_some());
        assert_eq!(responses[2].body["url"], "http://svc/c");

        let output = txn.detail().output_events();
        assert_eq!(output.len(), 3);
        assert!(
            output
                .iter()
                .all(|e| e.protocol.as_deref().is_some_and(|p| p.starts_with("http.")))
        );

        let input = txn.detail().input_events();
        assert_eq!(input.len(), 4);
        assert!(input[1..].iter().all(|e| e.elapsed.is_some()));

        let blocks = txn.summary().blocks();
        let peer = blocks.iter().find(|b| b.node == "peer").unwrap();
        assert_eq!(peer.results[0].code, "500");
        assert_eq!(blocks.iter().map(correlate_core::SummaryBlock::count).sum::<usize>(), 3);
    }

    #[test]
    fn auth_password_is_masked_in_process_log() {
        let attrs = RequestAttributes::new(Method::GET, "http://svc", "svc", "get")
            .basic_auth("u", "secret");
        let masked = correlate_core::Masker::default().mask_value(&attrs.process_log());
        assert_eq!(masked["auth"]["password"], "******");
    }
}
