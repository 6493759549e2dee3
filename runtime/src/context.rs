//! Handler context for consumed messages.
//!
//! A [`ConsumerContext`] is created by the lifecycle manager for every
//! delivered message and handed to the business handler by value. The
//! handler opens the transaction with [`ConsumerContext::common_log`],
//! performs its logged calls, and terminates the transaction with
//! [`ConsumerContext::respond`]. A context dropped while its transaction is
//! still open closes it with `500` / `no_response`.

use crate::error::ContextError;
use correlate_core::id;
use correlate_core::{
    BrokerError, CorrelationLogger, ErrorDetail, Inbound, InboundMessage, OutboundRecord, Payload,
    Producer, RecordMetadata, Transaction, TransactionMeta,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Node name of inbound messages and final responses.
pub const CONSUMER_NODE: &str = "kafka_consumer";

/// Node name of produced records.
pub const PRODUCER_NODE: &str = "kafka_producer";

/// Options of [`ConsumerContext::send_message`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    key: Option<String>,
    headers: Vec<(String, String)>,
}

impl SendOptions {
    /// Set the record key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a record header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Open(Transaction),
    Closed,
}

/// The context bound to one consumed message.
pub struct ConsumerContext {
    message: InboundMessage,
    x_tid: String,
    logger: CorrelationLogger,
    producer: Option<Arc<dyn Producer>>,
    state: State,
}

impl std::fmt::Debug for ConsumerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerContext")
            .field("topic", &self.message.topic)
            .field("offset", &self.message.offset)
            .field("x_tid", &self.x_tid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ConsumerContext {
    /// Bind a context to `message`.
    #[must_use]
    pub fn new(
        message: InboundMessage,
        x_tid: impl Into<String>,
        logger: CorrelationLogger,
        producer: Option<Arc<dyn Producer>>,
    ) -> Self {
        Self {
            message,
            x_tid: x_tid.into(),
            logger,
            producer,
            state: State::Idle,
        }
    }

    /// The consumed message.
    #[must_use]
    pub const fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Correlation id assigned to this message.
    #[must_use]
    pub fn x_tid(&self) -> &str {
        &self.x_tid
    }

    /// The message value as text.
    #[must_use]
    pub fn read_input(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.message.payload)
    }

    /// The message value decoded from JSON.
    ///
    /// # Errors
    ///
    /// Returns the decoding error if the value is not a valid `T`.
    pub fn read_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.message.payload)
    }

    /// Session carried by the message: a `session` header, or
    /// `header.session` inside a JSON value.
    #[must_use]
    pub fn incoming_session(&self) -> Option<String> {
        self.message
            .header("session")
            .map(str::to_string)
            .or_else(|| {
                let body = self.message.json_payload()?;
                body.pointer("/header/session")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|s| !s.is_empty())
    }

    /// Open the transaction of this message under `scenario`.
    ///
    /// The message itself is recorded as the first detail input event.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::AlreadyOpened`] if called twice.
    pub fn common_log(&mut self, scenario: &str) -> Result<&Transaction, ContextError> {
        if !matches!(self.state, State::Idle) {
            return Err(ContextError::AlreadyOpened);
        }

        let session = self
            .incoming_session()
            .unwrap_or_else(|| id::generate_x_tid(&self.message.topic));
        let value = self.message.to_log_value();
        let inbound = Inbound::new(CONSUMER_NODE, Payload::Structured(value.clone()))
            .raw(Payload::Structured(value))
            .protocol("kafka");
        let meta = TransactionMeta::new(scenario).session(session).init_invoke(&self.x_tid);

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

    /// Publish `value` (as JSON) to `topic`, logged as `kafka_producer.<topic>`.
    ///
    /// Without an open transaction the record is still published, unlogged.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Broker`] if no producer is configured, the
    /// value cannot be encoded, or the broker rejects the record.
    pub async fn send_message<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        options: SendOptions,
    ) -> Result<RecordMetadata, ContextError> {
        let producer = self
            .producer
            .as_ref()
            .ok_or_else(|| BrokerError::ConnectionFailed("no producer configured".to_string()))?;
        let value =
            serde_json::to_value(value).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let payload =
            serde_json::to_vec(&value).map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let mut record = OutboundRecord::new(topic, payload);
        if let Some(key) = &options.key {
            record = record.with_key(key.as_bytes());
        }
        for (name, header) in &options.headers {
            record = record.with_header(name.as_str(), header.as_bytes());
        }

        let txn = self.transaction().ok();
        let invoke = id::generate_x_tid(topic);
        if let Some(txn) = txn {
            let logged = json!({
                "topic": topic,
                "key": options.key,
                "headers": options.headers.iter().cloned().collect::<BTreeMap<_, _>>(),
                "value": value,
            });
            txn.detail().add_output_request(
                PRODUCER_NODE,
                topic,
                &invoke,
                Some(Payload::Structured(logged.clone())),
                Payload::Structured(logged),
            );
        }

        match producer.send(record).await {
            Ok(metadata) => {
                if let Some(txn) = txn {
                    txn.detail().add_input_response(
                        PRODUCER_NODE,
                        topic,
                        &invoke,
                        None,
                        Payload::from_serialize(&metadata),
                    );
                    txn.summary().add_success_block(PRODUCER_NODE, topic, "200", "success");
                }
                Ok(metadata)
            },
            Err(e) => {
                tracing::warn!(topic, error = %e, "Produce failed");
                if let Some(txn) = txn {
                    txn.detail().add_input_response(
                        PRODUCER_NODE,
                        topic,
                        &invoke,
                        None,
                        ErrorDetail::new(&e).with_code("500").into(),
                    );
                    txn.summary().add_error_block(PRODUCER_NODE, topic, "500", &e.to_string());
                }
                Err(e.into())
            },
        }
    }

    /// Terminate the transaction with `code` and `data`.
    ///
    /// Subsequent calls are no-ops.
    pub fn respond(&mut self, code: u16, data: impl Into<Payload>) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(txn) => txn.close(CONSUMER_NODE, code, data.into()),
            State::Idle => {
                tracing::debug!(x_tid = %self.x_tid, "Respond without an open transaction");
            },
            State::Closed => {
                tracing::debug!(x_tid = %self.x_tid, "Respond called more than once");
            },
        }
    }
}

impl Drop for ConsumerContext {
    fn drop(&mut self) {
        if let State::Open(txn) = std::mem::replace(&mut self.state, State::Closed) {
            tracing::warn!(
                x_tid = %self.x_tid,
                scenario = txn.scenario(),
                "Context dropped without a response"
            );
            txn.close_with(CONSUMER_NODE, 500, "no_response", Payload::Empty);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use correlate_core::{BrokerFuture, LogConfig, LogSink, Sinks, SystemClock};
    use serde_json::Value;
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

    struct Accepting {
        fail: bool,
    }

    impl Producer for Accepting {
        fn send(&self, record: OutboundRecord) -> BrokerFuture<'_, RecordMetadata> {
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(BrokerError::PublishFailed {
                        topic: record.topic,
                        reason: "leader not available".into(),
                    });
                }
                Ok(RecordMetadata {
                    topic_name: record.topic,
                    partition: 0,
                    offset: 12,
                    error_code: 0,
                    timestamp: 0,
                })
            })
        }
    }

    fn context(message: InboundMessage, producer_fails: bool) -> (ConsumerContext, Arc<Capture>) {
        let capture = Arc::new(Capture::default());
        let sinks = Sinks::shared(Arc::clone(&capture) as Arc<dyn LogSink>);
        let logger =
            CorrelationLogger::with_sinks(LogConfig::default(), sinks, Arc::new(SystemClock));
        let producer: Arc<dyn Producer> = Arc::new(Accepting { fail: producer_fails });
        (ConsumerContext::new(message, "x-tid:abc:1", logger, Some(producer)), capture)
    }

    #[test]
    fn session_comes_from_header_then_body() {
        let message = InboundMessage::new("t", b"{}".to_vec()).with_header("session", "h-1");
        let (ctx, _) = context(message, false);
        assert_eq!(ctx.incoming_session().as_deref(), Some("h-1"));

        let message = InboundMessage::new("t", br#"{"header":{"session":"b-1"}}"#.to_vec());
        let (ctx, _) = context(message, false);
        assert_eq!(ctx.incoming_session().as_deref(), Some("b-1"));

        let (mut ctx, _) = context(InboundMessage::new("register", b"{}".to_vec()), false);
        assert!(ctx.incoming_session().is_none());
        let txn = ctx.common_log("service.register").unwrap();
        assert!(txn.session().starts_with("regis-"));
        assert_eq!(txn.init_invoke(), "x-tid:abc:1");
    }

    #[test]
    fn common_log_opens_once() {
        let (mut ctx, _) = context(InboundMessage::new("t", b"{}".to_vec()), false);
        assert!(matches!(ctx.transaction(), Err(ContextError::NotOpened)));
        ctx.common_log("s").unwrap();
        assert!(matches!(ctx.common_log("s"), Err(ContextError::AlreadyOpened)));
    }

    #[test]
    fn respond_closes_once() {
        let message = InboundMessage::new("t", br#"{"email":"annabel@example.com"}"#.to_vec());
        let (mut ctx, capture) = context(message, false);
        ctx.common_log("service.register").unwrap();
        ctx.respond(200, json!({"message": "success"}));
        ctx.respond(500, Payload::Empty);
        drop(ctx);

        let details = capture.records("Detail");
        let summaries = capture.records("Summary");
        assert_eq!(details.len(), 1);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0]["ResponseResult"], "200");
        assert_eq!(details[0]["Input"][0]["Event"], "kafka_consumer.service.register");
        assert_eq!(details[0]["Input"][0]["Data"]["body"]["email"], "ann****@example.com");
        assert_eq!(details[0]["Output"][0]["Data"]["message"], "success");
    }

    #[test]
    fn drop_without_response_closes_with_500() {
        let (mut ctx, capture) = context(InboundMessage::new("t", b"{}".to_vec()), false);
        ctx.common_log("s").unwrap();
        drop(ctx);

        let summaries = capture.records("Summary");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0]["ResponseResult"], "500");
        assert_eq!(summaries[0]["ResponseDesc"], "no_response");
    }

    #[tokio::test]
    async fn send_message_is_logged() {
        let (mut ctx, _) = context(InboundMessage::new("t", b"{}".to_vec()), false);
        ctx.common_log("s").unwrap();

        let metadata = ctx
            .send_message("mail.send", &json!({"to": "a@b.c"}), SendOptions::default().key("k"))
            .await
            .unwrap();
        assert_eq!(metadata.offset, 12);

        let txn = ctx.transaction().unwrap();
        let output = txn.detail().output_events();
        assert_eq!(output[0].event, "kafka_producer.mail.send");
        let input = txn.detail().input_events();
        assert_eq!(input[1].data.to_value()["topicName"], "mail.send");
        assert!(input[1].elapsed.is_some());
        assert_eq!(txn.summary().blocks()[0].results[0].code, "200");
        ctx.respond(200, Payload::Empty);
    }

    #[tokio::test]
    async fn failed_send_records_error_block() {
        let (mut ctx, _) = context(InboundMessage::new("t", b"{}".to_vec()), true);
        ctx.common_log("s").unwrap();

        let err = ctx.send_message("mail.send", "hello", SendOptions::default()).await.unwrap_err();
        assert!(matches!(err, ContextError::Broker(BrokerError::PublishFailed { .. })));

        let blocks = ctx.transaction().unwrap().summary().blocks();
        assert_eq!(blocks[0].results[0].code, "500");
        ctx.respond(500, Payload::Empty);
    }
}
