//! Transactions and the logger that opens them.
//!
//! A [`CorrelationLogger`] is created once per process and cloned freely. Each
//! inbound unit of work (consumer message, HTTP request) opens one
//! [`Transaction`], which owns exactly one [`DetailLog`] and one
//! [`SummaryLog`]. Opening records the inbound message itself as the first
//! detail input event.
//!
//! # Example
//!
//! ```
//! use correlate_core::{CorrelationLogger, Inbound, LogConfig, TransactionMeta};
//! use serde_json::json;
//!
//! let logger = CorrelationLogger::new(LogConfig::default()).unwrap();
//! let txn = logger.open(
//!     TransactionMeta::new("service.register").session("abc"),
//!     Inbound::new("client", json!({"email": "a@b.c"}).into()),
//! );
//!
//! txn.summary().add_success_block("mongo", "insertOne", "200", "success");
//! txn.close("client", 200, json!({"message": "success"}).into());
//! ```

use crate::config::LogConfig;
use crate::detail::{DetailLog, Direction, NewEvent, RecordHeader};
use crate::environment::{self, Clock, SystemClock};
use crate::error::LogError;
use crate::id;
use crate::masking::Masker;
use crate::payload::{ErrorDetail, Payload};
use crate::sink::Sinks;
use crate::summary::SummaryLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// Identity of a transaction. Unset fields are generated on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionMeta {
    session: Option<String>,
    init_invoke: Option<String>,
    scenario: String,
    identity: Option<String>,
}

impl TransactionMeta {
    /// Start describing a transaction of the given scenario.
    #[must_use]
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            ..Self::default()
        }
    }

    /// Caller-supplied session id.
    #[must_use]
    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into()).filter(|s| !s.is_empty());
        self
    }

    /// Root correlation id.
    #[must_use]
    pub fn init_invoke(mut self, init_invoke: impl Into<String>) -> Self {
        self.init_invoke = Some(init_invoke.into()).filter(|s| !s.is_empty());
        self
    }

    /// Caller identity.
    #[must_use]
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into()).filter(|s| !s.is_empty());
        self
    }
}

/// The inbound message or request that opens a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    node: String,
    protocol: Option<String>,
    raw: Option<Payload>,
    data: Payload,
}

impl Inbound {
    /// Inbound event from `node` carrying `data`.
    #[must_use]
    pub fn new(node: impl Into<String>, data: Payload) -> Self {
        Self {
            node: node.into(),
            protocol: None,
            raw: None,
            data,
        }
    }

    /// Protocol tag of the inbound event.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Verbatim wire payload of the inbound event.
    #[must_use]
    pub fn raw(mut self, raw: Payload) -> Self {
        self.raw = Some(raw);
        self
    }
}

struct LoggerInner {
    config: LogConfig,
    sinks: Sinks,
    clock: Arc<dyn Clock>,
    masker: Masker,
    host: String,
    instance: String,
}

/// Opens transactions. Cheap to clone.
#[derive(Clone)]
pub struct CorrelationLogger {
    inner: Arc<LoggerInner>,
}

impl std::fmt::Debug for CorrelationLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationLogger")
            .field("app_name", &self.inner.config.app_name)
            .field("instance", &self.inner.instance)
            .field("sinks", &self.inner.sinks)
            .finish_non_exhaustive()
    }
}

impl CorrelationLogger {
    /// Create a logger writing to the sinks enabled in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if a file sink cannot be opened.
    pub fn new(config: LogConfig) -> Result<Self, LogError> {
        let sinks = Sinks::from_config(&config)?;
        Ok(Self::with_sinks(config, sinks, Arc::new(SystemClock)))
    }

    /// Create a logger with explicit sinks and clock.
    #[must_use]
    pub fn with_sinks(config: LogConfig, sinks: Sinks, clock: Arc<dyn Clock>) -> Self {
        let masker = Masker::new(&config.masking);
        let instance = environment::instance_id(config.instance.as_deref());
        Self {
            inner: Arc::new(LoggerInner {
                config,
                sinks,
                clock,
                masker,
                host: environment::hostname(),
                instance,
            }),
        }
    }

    /// Application name written into every record.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.inner.config.app_name
    }

    /// Open a transaction and record `inbound` as its first input event.
    #[must_use]
    pub fn open(&self, meta: TransactionMeta, inbound: Inbound) -> Transaction {
        let inner = &self.inner;
        let started_at = inner.clock.now();

        let header = RecordHeader {
            host: inner.host.clone(),
            app_name: inner.config.app_name.clone(),
            instance: inner.instance.clone(),
            session: meta.session.unwrap_or_else(id::new_session),
            init_invoke: meta
                .init_invoke
                .unwrap_or_else(|| id::default_init_invoke(&inner.config.app_name, started_at)),
            scenario: meta.scenario,
            identity: meta.identity.unwrap_or_else(|| "anonymous".to_string()),
        };

        let detail = Arc::new(DetailLog::new(
            header.clone(),
            inner.config.detail.raw_data,
            inner.masker.clone(),
            inner.sinks.clone(),
            Arc::clone(&inner.clock),
        ));
        let summary = Arc::new(SummaryLog::new(
            header.clone(),
            inner.sinks.clone(),
            Arc::clone(&inner.clock),
        ));

        let mut first = NewEvent::new(
            Direction::RequestIn,
            inbound.node,
            header.scenario.clone(),
            header.init_invoke.clone(),
            inbound.raw,
            inbound.data,
        );
        first.protocol = inbound.protocol;
        detail.record(first);

        tracing::debug!(
            session = %header.session,
            init_invoke = %header.init_invoke,
            scenario = %header.scenario,
            "Transaction opened"
        );

        Transaction {
            header,
            started_at,
            detail,
            summary,
        }
    }
}

/// One correlated unit of work.
#[derive(Debug, Clone)]
pub struct Transaction {
    header: RecordHeader,
    started_at: DateTime<Utc>,
    detail: Arc<DetailLog>,
    summary: Arc<SummaryLog>,
}

impl Transaction {
    /// Session id.
    #[must_use]
    pub fn session(&self) -> &str {
        &self.header.session
    }

    /// Root correlation id.
    #[must_use]
    pub fn init_invoke(&self) -> &str {
        &self.header.init_invoke
    }

    /// Logical operation name.
    #[must_use]
    pub fn scenario(&self) -> &str {
        &self.header.scenario
    }

    /// Caller identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.header.identity
    }

    /// When the transaction was opened.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The detail log.
    #[must_use]
    pub const fn detail(&self) -> &Arc<DetailLog> {
        &self.detail
    }

    /// The summary log.
    #[must_use]
    pub const fn summary(&self) -> &Arc<SummaryLog> {
        &self.summary
    }

    /// Split into the two logs.
    #[must_use]
    pub fn into_parts(self) -> (Arc<DetailLog>, Arc<SummaryLog>) {
        (self.detail, self.summary)
    }

    /// Record a downstream call around `call`.
    ///
    /// The request is logged as an output event under a fresh invoke id; the
    /// outcome is logged as the matching input event and as a summary block
    /// (`"200"`/`"success"` or `"500"`/error text). The result is returned
    /// unchanged so the handler decides the response code.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `call`.
    pub async fn record_call<F, T, E>(
        &self,
        node: &str,
        cmd: &str,
        request: Payload,
        call: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        let invoke = id::generate_x_tid(node);
        self.detail.add_output_request(node, cmd, &invoke, None, request);

        let result = call.await;
        match &result {
            Ok(value) => {
                self.detail
                    .add_input_response(node, cmd, &invoke, None, Payload::from_serialize(value));
                self.summary.add_success_block(node, cmd, "200", "success");
            },
            Err(e) => {
                let desc = e.to_string();
                self.detail
                    .add_input_response(node, cmd, &invoke, None, ErrorDetail::new(&desc).into());
                self.summary.add_error_block(node, cmd, "500", &desc);
            },
        }
        result
    }

    /// Terminate the transaction with the response sent to `node`.
    ///
    /// Appends the final output event, flushes the detail log if it holds any
    /// events, and ends the summary with `code` and its [`response_desc`]
    /// unless it was already ended.
    pub fn close(&self, node: &str, code: u16, data: Payload) {
        self.close_with(node, code, &response_desc(code), data);
    }

    /// Like [`close`](Self::close) with an explicit summary description.
    pub fn close_with(&self, node: &str, code: u16, desc: &str, data: Payload) {
        self.detail.add_output_response(
            node,
            &self.header.scenario,
            &self.header.init_invoke,
            None,
            data,
        );
        self.detail.auto_end();

        if self.summary.is_end() {
            tracing::debug!(init_invoke = %self.header.init_invoke, "Summary already ended");
            return;
        }
        if let Err(e) = self.summary.end(&code.to_string(), desc) {
            tracing::warn!(
                init_invoke = %self.header.init_invoke,
                error = %e,
                "Summary end failed"
            );
        }
    }
}

/// Description written as `ResponseDesc` for a response code: the HTTP
/// reason phrase with spaces replaced by `_`, or `"unknown"`.
#[must_use]
pub fn response_desc(code: u16) -> String {
    http::StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .map_or_else(|| "unknown".to_string(), |reason| reason.replace(' ', "_"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sink::LogSink;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl LogSink for Capture {
        fn write_line(&self, line: &str) -> std::io::Result<()> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    impl Capture {
        fn records(&self, log_type: &str) -> Vec<Value> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|l| serde_json::from_str::<Value>(l).unwrap())
                .filter(|r| r["LogType"] == log_type)
                .collect()
        }
    }

    fn logger() -> (CorrelationLogger, Arc<Capture>) {
        let capture = Arc::new(Capture::default());
        let config = LogConfig {
            app_name: "profile".into(),
            instance: Some("pod-1".into()),
            ..LogConfig::default()
        };
        let sinks = Sinks::shared(Arc::clone(&capture) as Arc<dyn LogSink>);
        (CorrelationLogger::with_sinks(config, sinks, Arc::new(SystemClock)), capture)
    }

    #[test]
    fn open_generates_missing_identity() {
        let (logger, _) = logger();
        let txn = logger.open(
            TransactionMeta::new("service.register"),
            Inbound::new("client", Payload::Empty),
        );

        assert!(!txn.session().is_empty());
        assert!(txn.init_invoke().starts_with("profile_"));
        assert_eq!(txn.identity(), "anonymous");
        assert_eq!(txn.detail().event_count(), 1);
        assert_eq!(txn.detail().input_events()[0].invoke, txn.init_invoke());
    }

    #[test]
    fn register_scenario_writes_one_record_of_each_kind() {
        let (logger, capture) = logger();
        let txn = logger.open(
            TransactionMeta::new("service.register").session("s-1").init_invoke("x-tid:root"),
            Inbound::new("client", json!({"email": "annabel@example.com"}).into())
                .protocol("kafka"),
        );

        txn.detail().add_output_request("mongo", "insertOne", "inv-1", None, Payload::Empty);
        txn.detail().add_input_request("mongo", "insertOne", "inv-1", None, Payload::Empty);
        txn.close("client", 200, json!({"message": "success"}).into());

        let details = capture.records("Detail");
        let summaries = capture.records("Summary");
        assert_eq!(details.len(), 1);
        assert_eq!(summaries.len(), 1);

        let detail = &details[0];
        assert_eq!(detail["Session"], "s-1");
        assert_eq!(detail["Instance"], "pod-1");
        assert_eq!(detail["Input"].as_array().unwrap().len(), 2);
        assert_eq!(detail["Output"].as_array().unwrap().len(), 2);
        assert_eq!(detail["Input"][0]["Protocol"], "kafka");
        assert_eq!(detail["Input"][0]["Data"]["email"], "ann****@example.com");
        assert!(detail["Input"][1]["ResTime"].is_string());
        assert_eq!(summaries[0]["ResponseResult"], "200");
        assert_eq!(summaries[0]["ResponseDesc"], "OK");
    }

    #[test]
    fn close_keeps_an_already_ended_summary() {
        let (logger, capture) = logger();
        let txn = logger.open(
            TransactionMeta::new("otp.verify"),
            Inbound::new("client", Payload::Empty),
        );

        txn.summary().end("401", "Unauthorized").unwrap();
        txn.close("client", 200, Payload::Empty);

        let summaries = capture.records("Summary");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0]["ResponseResult"], "401");
    }

    #[tokio::test]
    async fn record_call_logs_both_outcomes() {
        let (logger, _) = logger();
        let txn = logger.open(
            TransactionMeta::new("service.register"),
            Inbound::new("client", Payload::Empty),
        );

        let ok: Result<u32, String> = txn
            .record_call("mongo", "insertOne", json!({"doc": 1}).into(), async { Ok(7) })
            .await;
        let err: Result<u32, String> = txn
            .record_call("mongo", "insertOne", Payload::Empty, async {
                Err("duplicate key".to_string())
            })
            .await;

        assert_eq!(ok, Ok(7));
        assert!(err.is_err());

        let blocks = txn.summary().blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].count(), 2);
        assert_eq!(blocks[0].results[1].code, "500");
        assert_eq!(blocks[0].results[1].desc, "duplicate key");

        let input = txn.detail().input_events();
        assert_eq!(input.len(), 3);
        assert!(input[1].elapsed.is_some());
        assert!(matches!(input[2].data, Payload::Error(_)));
    }

    #[test]
    fn response_desc_uses_reason_phrase() {
        assert_eq!(response_desc(200), "OK");
        assert_eq!(response_desc(404), "Not_Found");
        assert_eq!(response_desc(500), "Internal_Server_Error");
        assert_eq!(response_desc(799), "unknown");
    }
}
