//! HTTP transport: "send a request, get a response".
//!
//! [`ReqwestTransport`] performs a single exchange. [`RetryTransport`] wraps
//! any [`Transport`] and retries connection and timeout failures with the
//! backoff of [`crate::retry`]. Any other error ends the call. A response is a
//! success at this layer whatever its status code; deciding that a 500 should
//! be retried is the caller's policy.
//!
//! Request bodies are held in memory, so every attempt sends the same bytes.

use crate::retry::{self, RetryConfig, RetryError};
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Transport-level failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not connect to the peer
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The exchange timed out
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The exchange failed after connecting
    #[error("Request failed: {0}")]
    Request(String),

    /// The request could not be built (bad URL, bad header)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_builder() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// A fully buffered HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL, query string included.
    pub url: String,
    /// Headers.
    pub headers: HeaderMap,
    /// Body bytes; empty for no body.
    pub body: Vec<u8>,
    /// Per-exchange timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Create a request without headers or body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            timeout: None,
        }
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: StatusCode,
    /// Headers.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Create a response with the given status and body.
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Sends one request and returns its response.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the exchange.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if no response was received.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Transport backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wrap an existing client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse { status, headers, body })
    }
}

/// Retries transport-level failures of the wrapped transport.
#[derive(Debug, Clone)]
pub struct RetryTransport<T> {
    inner: T,
    config: RetryConfig,
}

impl<T: Transport> RetryTransport<T> {
    /// Wrap `inner`.
    #[must_use]
    pub const fn new(inner: T, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Send with an explicit retry configuration.
    ///
    /// # Errors
    ///
    /// Returns the last [`TransportError`] once attempts are exhausted, or the
    /// first non-retryable one.
    pub async fn send_with(
        &self,
        request: &HttpRequest,
        config: &RetryConfig,
    ) -> Result<HttpResponse, TransportError> {
        let inner = &self.inner;
        // Non-retryable errors end the loop as a successful attempt.
        let outcome = retry::execute(config, move || async move {
            match inner.send(request).await {
                Err(e) if !e.is_retryable() => Ok(Err(e)),
                other => other.map(Ok),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(RetryError::Exhausted { source, .. }) => Err(source),
            Err(RetryError::Cancelled { attempts }) => {
                Err(TransportError::Request(format!("cancelled after {attempts} attempts")))
            },
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryTransport<T> {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.send_with(request, &self.config).await
    }
}
