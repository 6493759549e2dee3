//! Redpanda/Kafka broker adapter for the correlation runtime.
//!
//! This crate implements the broker traits from `correlate-core` on top of
//! rdkafka, so the consumer-group lifecycle manager and the handler context's
//! logged produce can run against any Kafka-compatible cluster.
//!
//! - [`RedpandaConnector`] creates a [`RedpandaClient`] (a `StreamConsumer`
//!   with manual offset commits)
//! - [`RedpandaProducer`] wraps a `FutureProducer` and waits for the broker
//!   acknowledgement of every record
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - The lifecycle manager commits a message after its handler has finished
//! - If the process crashes before commit, the message is redelivered
//! - Ordering is guaranteed within a partition
//!
//! # Example
//!
//! ```no_run
//! use correlate_redpanda::{ConsumerConfig, RedpandaConnector, RedpandaProducer};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = RedpandaConnector::new(
//!     ConsumerConfig::builder()
//!         .brokers("localhost:9092")
//!         .group_id("register-service")
//!         .auto_offset_reset("earliest")
//!         .build()?,
//! );
//!
//! let producer = RedpandaProducer::builder()
//!     .brokers("localhost:9092")
//!     .acks("all")
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use correlate_core::broker::{
    BrokerError, BrokerFuture, ConsumerGroupClient, ConsumerGroupConnector, InboundMessage,
    OutboundRecord, Producer, RecordMetadata,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext as KafkaConsumerContext, Rebalance,
    StreamConsumer,
};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// Consumer-group settings.
///
/// # Example
///
/// ```
/// use correlate_redpanda::ConsumerConfig;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ConsumerConfig::builder()
///     .brokers("localhost:9092")
///     .group_id("mailer")
///     .session_timeout(Duration::from_secs(10))
///     .build()?;
/// assert_eq!(config.auto_offset_reset(), "latest");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    brokers: String,
    group_id: String,
    auto_offset_reset: String,
    session_timeout: Duration,
    properties: Vec<(String, String)>,
}

impl ConsumerConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }

    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Where a new group starts reading.
    #[must_use]
    pub fn auto_offset_reset(&self) -> &str {
        &self.auto_offset_reset
    }

    /// Group session timeout.
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// The rdkafka client configuration for these settings.
    ///
    /// Auto-commit is always disabled; offsets are committed per message.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }
}

/// Builder for [`ConsumerConfig`].
#[derive(Debug, Default)]
pub struct ConsumerConfigBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
    properties: Vec<(String, String)>,
}

impl ConsumerConfigBuilder {
    /// Set broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the offset reset policy (`earliest`, `latest`). Default: `latest`.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the group session timeout. Default: 6 seconds.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Pass an extra librdkafka property through (e.g. `security.protocol`).
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers or the group id
    /// are missing.
    pub fn build(self) -> Result<ConsumerConfig, BrokerError> {
        let brokers = self
            .brokers
            .filter(|b| !b.is_empty())
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let group_id = self
            .group_id
            .filter(|g| !g.is_empty())
            .ok_or_else(|| {
                BrokerError::ConnectionFailed("Consumer group not configured".to_string())
            })?;

        Ok(ConsumerConfig {
            brokers,
            group_id,
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "latest".to_string()),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
            properties: self.properties,
        })
    }
}

/// rdkafka context tracking group generations.
///
/// Every partition assignment starts a new generation; the count is what
/// [`ConsumerGroupClient::generation_id`] reports.
#[derive(Debug, Default)]
pub struct GroupContext {
    generation: AtomicI32,
}

impl GroupContext {
    /// Generations observed so far.
    #[must_use]
    pub fn generation(&self) -> i32 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl ClientContext for GroupContext {}

impl KafkaConsumerContext for GroupContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(generation, partitions = partitions.count(), "Partitions assigned");
            },
            Rebalance::Revoke(partitions) => {
                tracing::info!(partitions = partitions.count(), "Partitions revoked");
            },
            Rebalance::Error(error) => {
                tracing::warn!(error = %error, "Rebalance failed");
            },
        }
    }
}

/// Creates [`RedpandaClient`]s from a [`ConsumerConfig`].
#[derive(Debug, Clone)]
pub struct RedpandaConnector {
    config: ConsumerConfig,
}

impl RedpandaConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new(config: ConsumerConfig) -> Self {
        Self { config }
    }

    /// The consumer settings.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}

impl ConsumerGroupConnector for RedpandaConnector {
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn ConsumerGroupClient>> {
        Box::pin(async move {
            let consumer: StreamConsumer<GroupContext> = self
                .config
                .client_config()
                .create_with_context(GroupContext::default())
                .map_err(|e| {
                    BrokerError::ConnectionFailed(format!("Failed to create consumer: {e}"))
                })?;

            tracing::info!(
                brokers = %self.config.brokers,
                group_id = %self.config.group_id,
                auto_offset_reset = %self.config.auto_offset_reset,
                "Consumer created"
            );

            let client: Arc<dyn ConsumerGroupClient> = Arc::new(RedpandaClient { consumer });
            Ok(client)
        })
    }
}

/// Consumer-group member backed by an rdkafka `StreamConsumer`.
pub struct RedpandaClient {
    consumer: StreamConsumer<GroupContext>,
}

impl std::fmt::Debug for RedpandaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaClient")
            .field("generation", &self.generation_id())
            .finish_non_exhaustive()
    }
}

impl ConsumerGroupClient for RedpandaClient {
    fn subscribe(&self, topics: &[&str]) -> Result<(), BrokerError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| BrokerError::SubscriptionFailed {
                topics: topics.iter().map(|t| (*t).to_string()).collect(),
                reason: e.to_string(),
            })?;
        tracing::info!(topics = ?topics, "Subscribed");
        Ok(())
    }

    fn recv(&self) -> BrokerFuture<'_, InboundMessage> {
        Box::pin(async move {
            let message = self
                .consumer
                .recv()
                .await
                .map_err(|e| BrokerError::ConsumeFailed(e.to_string()))?;
            Ok(to_inbound(&message))
        })
    }

    fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        let next = Offset::Offset(message.offset + 1);
        offsets
            .add_partition_offset(&message.topic, message.partition, next)
            .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;

        tracing::debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Committed offset"
        );
        Ok(())
    }

    fn pause_all(&self) -> Result<(), BrokerError> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| BrokerError::PauseFailed(e.to_string()))?;
        self.consumer
            .pause(&assignment)
            .map_err(|e| BrokerError::PauseFailed(e.to_string()))
    }

    fn resume_all(&self) -> Result<(), BrokerError> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| BrokerError::PauseFailed(e.to_string()))?;
        self.consumer
            .resume(&assignment)
            .map_err(|e| BrokerError::PauseFailed(e.to_string()))
    }

    fn generation_id(&self) -> i32 {
        self.consumer.context().generation()
    }
}

/// Convert an rdkafka message into the broker-neutral form.
fn to_inbound<M: Message>(message: &M) -> InboundMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    let value = header.value.map(<[u8]>::to_vec).unwrap_or_default();
                    (header.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// Synchronous producer backed by an rdkafka `FutureProducer`.
///
/// Each [`Producer::send`] waits until the broker acknowledges the record
/// (or the delivery timeout expires).
pub struct RedpandaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl std::fmt::Debug for RedpandaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaProducer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedpandaProducer {
    /// Create a producer with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start building a producer.
    #[must_use]
    pub fn builder() -> RedpandaProducerBuilder {
        RedpandaProducerBuilder::default()
    }
}

impl Producer for RedpandaProducer {
    fn send(&self, record: OutboundRecord) -> BrokerFuture<'_, RecordMetadata> {
        Box::pin(async move {
            let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
            for (key, value) in &record.headers {
                headers = headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_slice()),
                });
            }

            let mut kafka_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&record.topic)
                .payload(record.payload.as_slice())
                .headers(headers);
            if let Some(key) = &record.key {
                kafka_record = kafka_record.key(key.as_slice());
            }

            match self.producer.send(kafka_record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(topic = %record.topic, partition, offset, "Record produced");
                    Ok(RecordMetadata {
                        topic_name: record.topic.clone(),
                        partition,
                        offset,
                        error_code: 0,
                        timestamp: Utc::now().timestamp_millis(),
                    })
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %record.topic,
                        error = %kafka_error,
                        "Failed to produce record"
                    );
                    Err(BrokerError::PublishFailed {
                        topic: record.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }
}

/// Builder for [`RedpandaProducer`].
#[derive(Debug, Default)]
pub struct RedpandaProducerBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaProducerBuilder {
    /// Set broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set required acknowledgements (`0`, `1`, `all`). Default: `1`.
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Set compression (`none`, `gzip`, `snappy`, `lz4`, `zstd`). Default: `none`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the delivery timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn client_config(&self, brokers: &str, timeout: Duration) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", self.acks.as_deref().unwrap_or("1"))
            .set("compression.type", self.compression.as_deref().unwrap_or("none"));
        config
    }

    /// Build the producer.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaProducer, BrokerError> {
        let brokers = self
            .brokers
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = self
            .client_config(brokers, timeout)
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks = self.acks.as_deref().unwrap_or("1"),
            compression = self.compression.as_deref().unwrap_or("none"),
            "Producer created"
        );

        Ok(RedpandaProducer { producer, timeout })
    }
}
