//! Message broker boundary.
//!
//! The lifecycle manager talks to the broker only through these traits:
//!
//! - [`ConsumerGroupConnector`] establishes a [`ConsumerGroupClient`] (once per manager)
//! - [`ConsumerGroupClient`] subscribes, receives, commits, and pauses/resumes delivery
//! - [`Producer`] performs a synchronous produce and reports where the record landed
//!
//! # Implementations
//!
//! - `InMemoryConsumerGroup` / `InMemoryProducer` in `correlate-testing`
//! - `RedpandaConnector` / `RedpandaProducer` in `correlate-redpanda`
//!
//! # Dyn Compatibility
//!
//! The traits return `Pin<Box<dyn Future>>` instead of using `async fn` so
//! they can be held as `Arc<dyn ConsumerGroupClient>` by the worker loop and
//! by every handler context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A consume iteration failed; the loop retries immediately
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// Failed to commit a message offset
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Failed to publish a record to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to pause or resume delivery
    #[error("Pause/resume failed: {0}")]
    PauseFailed(String),

    /// A record could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// One message delivered by the consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundMessage {
    /// Topic the message was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Message key.
    pub key: Option<Vec<u8>>,
    /// Message headers, in broker order.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Broker timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Message value.
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Create a message with only topic and payload set.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name`, as UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
    }

    /// The payload parsed as JSON, if it is JSON.
    #[must_use]
    pub fn json_payload(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// Headers as a JSON object (non-UTF-8 values are written lossily).
    #[must_use]
    pub fn headers_json(&self) -> Value {
        Value::Object(
            self.headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(String::from_utf8_lossy(v).into_owned())))
                .collect(),
        )
    }

    /// The document recorded as the first detail input event:
    /// `{header, body, topic, partition, offset, timestamp}`.
    #[must_use]
    pub fn to_log_value(&self) -> Value {
        let body = self
            .json_payload()
            .unwrap_or_else(|| Value::String(String::from_utf8_lossy(&self.payload).into_owned()));
        json!({
            "header": self.headers_json(),
            "body": body,
            "topic": self.topic,
            "partition": self.partition,
            "offset": self.offset,
            "timestamp": self.timestamp.map(|t| t.to_rfc3339()),
        })
    }
}

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutboundRecord {
    /// Destination topic.
    pub topic: String,
    /// Optional key.
    pub key: Option<Vec<u8>>,
    /// Headers.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Value.
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    /// Create a record.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Set the key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Where a produced record landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// Topic written to.
    pub topic_name: String,
    /// Partition written to.
    pub partition: i32,
    /// Offset assigned by the broker.
    pub offset: i64,
    /// Broker error code (`0` on success).
    pub error_code: i32,
    /// Produce timestamp in milliseconds since the epoch.
    pub timestamp: i64,
}

/// A connected consumer-group member.
///
/// Owned by the lifecycle manager; never handed to business code.
pub trait ConsumerGroupClient: Send + Sync {
    /// Join the group for `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the subscription is rejected.
    fn subscribe(&self, topics: &[&str]) -> Result<(), BrokerError>;

    /// Wait for the next message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if the iteration failed. The
    /// caller retries immediately; backoff is the client's own concern.
    fn recv(&self) -> BrokerFuture<'_, InboundMessage>;

    /// Mark `message` as consumed (commit its offset).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CommitFailed`] if the commit was rejected.
    fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError>;

    /// Stop fetching from every assigned partition.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PauseFailed`] on failure.
    fn pause_all(&self) -> Result<(), BrokerError>;

    /// Resume fetching from every assigned partition.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PauseFailed`] on failure.
    fn resume_all(&self) -> Result<(), BrokerError>;

    /// Generation id of the current group membership.
    fn generation_id(&self) -> i32;
}

/// Establishes consumer-group clients.
pub trait ConsumerGroupConnector: Send + Sync {
    /// Connect a new client.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the broker is unreachable
    /// or the client configuration is rejected.
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn ConsumerGroupClient>>;
}

/// Synchronous producer.
pub trait Producer: Send + Sync {
    /// Publish `record` and wait for the broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker rejected the
    /// record or the delivery timed out.
    fn send(&self, record: OutboundRecord) -> BrokerFuture<'_, RecordMetadata>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_value_parses_json_body() {
        let message = InboundMessage::new("service.register", br#"{"email":"a@b.c"}"#.to_vec())
            .with_header("session", "s-1");

        let value = message.to_log_value();
        assert_eq!(value["body"]["email"], "a@b.c");
        assert_eq!(value["header"]["session"], "s-1");
        assert_eq!(value["topic"], "service.register");
        assert_eq!(message.header("session"), Some("s-1"));
    }

    #[test]
    fn log_value_keeps_text_body() {
        let message = InboundMessage::new("t", b"plain text".to_vec());
        assert_eq!(message.to_log_value()["body"], "plain text");
        assert!(message.header("session").is_none());
    }

    #[test]
    fn record_metadata_uses_camel_case() {
        let metadata = RecordMetadata {
            topic_name: "t".into(),
            partition: 1,
            offset: 42,
            error_code: 0,
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&metadata).unwrap_or_default();
        assert_eq!(value["topicName"], "t");
        assert_eq!(value["errorCode"], 0);
    }
}
