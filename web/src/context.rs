//! Handler context for HTTP requests.
//!
//! [`HttpContext`] is an Axum extractor. It buffers the request, opens the
//! transaction when the handler calls [`HttpContext::common_log`], and turns
//! [`HttpContext::respond`] into both the closing Detail/Summary records and
//! the JSON response sent to the client.

use crate::error::AppError;
use crate::extractors::Session;
use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRef, FromRequest, FromRequestParts, Query, RawPathParams, Request},
    http::{HeaderMap, Method, StatusCode, Uri, Version},
    response::{IntoResponse, Response},
    Json, RequestPartsExt,
};
use correlate_core::{id, CorrelationLogger, Inbound, Payload, Transaction, TransactionMeta};
use correlate_runtime::ContextError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Node name of the calling client.
pub const CLIENT_NODE: &str = "client";

/// Largest request body buffered by the extractor.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug)]
enum State {
    Idle,
    Open(Transaction),
    Closed,
}

/// The context bound to one HTTP request.
///
/// # Example
///
/// ```ignore
/// async fn register(mut ctx: HttpContext) -> Result<Response, AppError> {
///     let request: Register = ctx.read_json()?;
///     let txn = ctx.common_log("service.register")?.clone();
///     txn.record_call("mongo", "insertOne", payload, users.insert(&request)).await?;
///     Ok(ctx.respond(201, &json!({ "message": "created" })))
/// }
/// ```
pub struct HttpContext {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    params: Vec<(String, String)>,
    body: Bytes,
    session: String,
    logger: CorrelationLogger,
    state: State,
}

impl std::fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContext")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("session", &self.session)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl HttpContext {
    /// Request method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Request headers.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Session id of the request.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.session
    }

    /// First query value named `key`.
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        lookup(&self.query, key)
    }

    /// Path parameter named `key` of the matched route.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        lookup(&self.params, key)
    }

    /// The raw request body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the decode error if the body is not valid JSON for `T`.
    pub fn read_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The document recorded as the first detail input event:
    /// `{headers, query, body}`.
    #[must_use]
    pub fn read_input(&self) -> Value {
        let headers: Map<String, Value> = self
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let query: Map<String, Value> = self
            .query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let body = if self.body.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(&self.body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()))
        };
        json!({ "headers": headers, "query": query, "body": body })
    }

    /// Open the transaction for `scenario`.
    ///
    /// The request is recorded as the first detail input event, with protocol
    /// `<version>.<METHOD>` (e.g. `HTTP/1.1.POST`).
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AlreadyOpened`] if called twice.
    pub fn common_log(&mut self, scenario: &str) -> Result<&Transaction, ContextError> {
        self.common_log_as(scenario, "")
    }

    /// Like [`common_log`](Self::common_log), recording the caller `identity`
    /// (empty means `anonymous`).
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AlreadyOpened`] if a transaction was already opened.
    pub fn common_log_as(
        &mut self,
        scenario: &str,
        identity: &str,
    ) -> Result<&Transaction, ContextError> {
        if !matches!(self.state, State::Idle) {
            return Err(ContextError::AlreadyOpened);
        }

        let inbound = Inbound::new(CLIENT_NODE, Payload::Structured(self.read_input()))
            .raw(Payload::RawBytes(self.body.to_vec()))
            .protocol(format!("{:?}.{}", self.version, self.method));
        let meta = TransactionMeta::new(scenario)
            .session(&self.session)
            .init_invoke(id::init_invoke())
            .identity(identity);

        self.state = State::Open(self.logger.open(meta, inbound));
        self.transaction()
    }

    /// The open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotOpened`] before [`common_log`](Self::common_log)
    /// or after [`respond`](Self::respond).
    pub const fn transaction(&self) -> Result<&Transaction, ContextError> {
        match &self.state {
            State::Open(txn) => Ok(txn),
            State::Idle | State::Closed => Err(ContextError::NotOpened),
        }
    }

    /// Close the transaction with `code` and `data` and build the JSON response.
    ///
    /// Codes outside the HTTP range are sent as `500`. Calling it again only
    /// builds the response.
    pub fn respond<T: Serialize + ?Sized>(&mut self, code: u16, data: &T) -> Response {
        let payload = Payload::from_serialize(data);
        let body = payload.to_value();
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(txn) => txn.close(CLIENT_NODE, code, payload),
            State::Idle => {
                tracing::debug!(session = %self.session, "Respond without an open transaction");
            },
            State::Closed => {
                tracing::debug!(session = %self.session, "Respond called more than once");
            },
        }

        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }

    /// Respond with `{"message": error}`.
    pub fn error(&mut self, code: u16, error: &dyn std::fmt::Display) -> Response {
        self.respond(code, &json!({ "message": error.to_string() }))
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

impl Drop for HttpContext {
    fn drop(&mut self) {
        if let State::Open(txn) = std::mem::replace(&mut self.state, State::Closed) {
            tracing::warn!(
                session = %self.session,
                scenario = txn.scenario(),
                "Context dropped without a response"
            );
            txn.close_with(CLIENT_NODE, 500, "no_response", Payload::Empty);
        }
    }
}

#[async_trait]
impl<S> FromRequest<S> for HttpContext
where
    S: Send + Sync,
    CorrelationLogger: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let (mut parts, body) = req.into_parts();

        let params = parts
            .extract::<RawPathParams>()
            .await
            .map(|params| params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
            .unwrap_or_default();
        let query = parts
            .extract::<Query<Vec<(String, String)>>>()
            .await
            .map(|Query(pairs)| pairs)
            .unwrap_or_default();
        let Ok(Session(session)) = Session::from_request_parts(&mut parts, state).await;

        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| AppError::payload_too_large(format!("Failed to read body: {e}")))?;

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            query,
            params,
            body,
            session,
            logger: CorrelationLogger::from_ref(state),
            state: State::Idle,
        })
    }
}
