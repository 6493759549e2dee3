//! In-memory broker for consumer and producer tests
//!
//! - [`InMemoryConsumerGroup`]: connector and consumer-group client backed by a queue
//! - [`InMemoryProducer`]: records produced records and assigns offsets

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use correlate_core::{
    BrokerError, BrokerFuture, ConsumerGroupClient, ConsumerGroupConnector, InboundMessage,
    OutboundRecord, Producer, RecordMetadata,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, watch};

struct GroupInner {
    queue: Mutex<VecDeque<Result<InboundMessage, BrokerError>>>,
    ready: Notify,
    offsets: Mutex<HashMap<String, i64>>,
    committed: Mutex<Vec<InboundMessage>>,
    commit_count: watch::Sender<usize>,
    subscriptions: Mutex<Vec<String>>,
    refuse_connect: Mutex<Option<BrokerError>>,
    connects: AtomicUsize,
    paused: AtomicBool,
    generation: AtomicI32,
}

/// Queue-backed consumer group.
///
/// The same value acts as the [`ConsumerGroupConnector`] handed to the
/// manager and as the client it connects to, so a test keeps a clone to feed
/// messages and inspect commits.
///
/// # Example
///
/// ```
/// use correlate_testing::InMemoryConsumerGroup;
///
/// let group = InMemoryConsumerGroup::new();
/// group.publish("service.register", br#"{"email":"a@b.c"}"#.to_vec());
/// assert_eq!(group.pending(), 1);
/// ```
#[derive(Clone)]
pub struct InMemoryConsumerGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for InMemoryConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConsumerGroup")
            .field("pending", &self.pending())
            .field("committed", &self.committed().len())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryConsumerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConsumerGroup {
    /// Create an empty group at generation 1.
    #[must_use]
    pub fn new() -> Self {
        let (commit_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(GroupInner {
                queue: Mutex::new(VecDeque::new()),
                ready: Notify::new(),
                offsets: Mutex::new(HashMap::new()),
                committed: Mutex::new(Vec::new()),
                commit_count,
                subscriptions: Mutex::new(Vec::new()),
                refuse_connect: Mutex::new(None),
                connects: AtomicUsize::new(0),
                paused: AtomicBool::new(false),
                generation: AtomicI32::new(1),
            }),
        }
    }

    /// Enqueue a message as-is.
    pub fn push(&self, message: InboundMessage) {
        self.inner.queue.lock().unwrap().push_back(Ok(message));
        self.inner.ready.notify_one();
    }

    /// Enqueue `payload` on `topic` with the next offset of that topic.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> InboundMessage {
        let offset = {
            let mut offsets = self.inner.offsets.lock().unwrap();
            let next = offsets.entry(topic.to_string()).or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };
        let mut message = InboundMessage::new(topic, payload);
        message.offset = offset;
        message.timestamp = Some(chrono::Utc::now());
        self.push(message.clone());
        message
    }

    /// Make the next `recv` fail with `error`.
    pub fn push_error(&self, error: BrokerError) {
        self.inner.queue.lock().unwrap().push_back(Err(error));
        self.inner.ready.notify_one();
    }

    /// Make the next `connect` fail with `error`.
    pub fn refuse_next_connect(&self, error: BrokerError) {
        *self.inner.refuse_connect.lock().unwrap() = Some(error);
    }

    /// Set the group generation reported to the manager.
    pub fn set_generation(&self, generation: i32) {
        self.inner.generation.store(generation, Ordering::SeqCst);
    }

    /// Messages not yet delivered.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Committed messages, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<InboundMessage> {
        self.inner.committed.lock().unwrap().clone()
    }

    /// Committed offsets, in commit order.
    #[must_use]
    pub fn committed_offsets(&self) -> Vec<i64> {
        self.committed().iter().map(|m| m.offset).collect()
    }

    /// Wait until at least `count` messages have been committed.
    pub async fn wait_for_commits(&self, count: usize) {
        let mut commits = self.inner.commit_count.subscribe();
        let _ = commits.wait_for(|committed| *committed >= count).await;
    }

    /// Topics subscribed so far.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().unwrap().clone()
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Whether delivery is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }
}

impl ConsumerGroupConnector for InMemoryConsumerGroup {
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn ConsumerGroupClient>> {
        Box::pin(async move {
            if let Some(error) = self.inner.refuse_connect.lock().unwrap().take() {
                return Err(error);
            }
            self.inner.connects.fetch_add(1, Ordering::SeqCst);
            let client: Arc<dyn ConsumerGroupClient> = Arc::new(self.clone());
            Ok(client)
        })
    }
}

impl ConsumerGroupClient for InMemoryConsumerGroup {
    fn subscribe(&self, topics: &[&str]) -> Result<(), BrokerError> {
        if topics.is_empty() {
            return Err(BrokerError::SubscriptionFailed {
                topics: Vec::new(),
                reason: "no topics".to_string(),
            });
        }
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .extend(topics.iter().map(|t| (*t).to_string()));
        Ok(())
    }

    fn recv(&self) -> BrokerFuture<'_, InboundMessage> {
        Box::pin(async move {
            loop {
                let next = self.inner.queue.lock().unwrap().pop_front();
                if let Some(next) = next {
                    return next;
                }
                self.inner.ready.notified().await;
            }
        })
    }

    fn commit(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let count = {
            let mut committed = self.inner.committed.lock().unwrap();
            committed.push(message.clone());
            committed.len()
        };
        self.inner.commit_count.send_replace(count);
        Ok(())
    }

    fn pause_all(&self) -> Result<(), BrokerError> {
        self.inner.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume_all(&self) -> Result<(), BrokerError> {
        self.inner.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn generation_id(&self) -> i32 {
        self.inner.generation.load(Ordering::SeqCst)
    }
}

/// Producer that keeps every record in memory.
///
/// # Example
///
/// ```
/// use correlate_testing::InMemoryProducer;
/// use correlate_core::{OutboundRecord, Producer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = InMemoryProducer::new();
/// let metadata = producer.send(OutboundRecord::new("mail.send", b"{}".to_vec())).await?;
/// assert_eq!(metadata.offset, 0);
/// assert_eq!(producer.sent_to("mail.send").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProducer {
    sent: Arc<Mutex<Vec<OutboundRecord>>>,
    offsets: Arc<Mutex<HashMap<String, i64>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl InMemoryProducer {
    /// Create an empty producer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every following record with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(reason.into());
    }

    /// Accept records again.
    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Every accepted record.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundRecord> {
        self.sent.lock().unwrap().clone()
    }

    /// Accepted records for `topic`.
    #[must_use]
    pub fn sent_to(&self, topic: &str) -> Vec<OutboundRecord> {
        self.sent().into_iter().filter(|r| r.topic == topic).collect()
    }
}

impl Producer for InMemoryProducer {
    fn send(&self, record: OutboundRecord) -> BrokerFuture<'_, RecordMetadata> {
        Box::pin(async move {
            if let Some(reason) = self.failure.lock().unwrap().clone() {
                return Err(BrokerError::PublishFailed {
                    topic: record.topic,
                    reason,
                });
            }

            let offset = {
                let mut offsets = self.offsets.lock().unwrap();
                let next = offsets.entry(record.topic.clone()).or_insert(0);
                let offset = *next;
                *next += 1;
                offset
            };
            let metadata = RecordMetadata {
                topic_name: record.topic.clone(),
                partition: 0,
                offset,
                error_code: 0,
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            self.sent.lock().unwrap().push(record);
            Ok(metadata)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_waits_for_publish() {
        let group = InMemoryConsumerGroup::new();
        let client = group.connect().await.unwrap();
        client.subscribe(&["t"]).unwrap();

        let waiting = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.recv().await })
        };
        tokio::task::yield_now().await;
        group.publish("t", b"a".to_vec());

        let message = waiting.await.unwrap().unwrap();
        assert_eq!(message.offset, 0);
        client.commit(&message).unwrap();
        group.wait_for_commits(1).await;
        assert_eq!(group.committed_offsets(), vec![0]);
        assert_eq!(group.subscriptions(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn refused_connect_happens_once() {
        let group = InMemoryConsumerGroup::new();
        group.refuse_next_connect(BrokerError::ConnectionFailed("down".into()));
        assert!(group.connect().await.is_err());
        assert!(group.connect().await.is_ok());
        assert_eq!(group.connect_count(), 1);
    }

    #[tokio::test]
    async fn producer_assigns_offsets_per_topic() {
        let producer = InMemoryProducer::new();
        producer.send(OutboundRecord::new("a", b"1".to_vec())).await.unwrap();
        let second = producer.send(OutboundRecord::new("a", b"2".to_vec())).await.unwrap();
        let other = producer.send(OutboundRecord::new("b", b"3".to_vec())).await.unwrap();
        assert_eq!(second.offset, 1);
        assert_eq!(other.offset, 0);

        producer.fail_with("leader not available");
        let err = producer.send(OutboundRecord::new("a", b"4".to_vec())).await.unwrap_err();
        assert!(matches!(err, BrokerError::PublishFailed { .. }));
        assert_eq!(producer.sent_to("a").len(), 2);
    }
}
