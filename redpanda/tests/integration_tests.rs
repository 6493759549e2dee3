//! Integration tests against a running Redpanda/Kafka broker.
//!
//! These tests are marked as `#[ignore]` by default because they need a
//! broker reachable at `REDPANDA_BROKERS` (default `localhost:9092`) with
//! topic auto-creation enabled.
//!
//! To run explicitly:
//! ```bash
//! REDPANDA_BROKERS=localhost:9092 \
//!     cargo test -p correlate-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)]

use correlate_core::broker::{ConsumerGroupClient, ConsumerGroupConnector, OutboundRecord, Producer};
use correlate_core::LogConfig;
use correlate_redpanda::{ConsumerConfig, RedpandaConnector, RedpandaProducer};
use correlate_runtime::{ConsumerContext, ConsumerGroupManager};
use correlate_testing::memory_logger;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn brokers() -> String {
    std::env::var("REDPANDA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string())
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

fn connector(group_id: &str) -> RedpandaConnector {
    RedpandaConnector::new(
        ConsumerConfig::builder()
            .brokers(brokers())
            .group_id(group_id)
            .auto_offset_reset("earliest")
            .build()
            .expect("valid consumer config"),
    )
}

#[tokio::test]
#[ignore = "requires a running broker"]
async fn produce_then_consume_round_trip() {
    let topic = unique("correlate-roundtrip");
    let producer = RedpandaProducer::new(&brokers()).expect("producer");

    let metadata = producer
        .send(
            OutboundRecord::new(topic.as_str(), br#"{"hello":"world"}"#.to_vec())
                .with_key("k1")
                .with_header("session", "sess-int"),
        )
        .await
        .expect("produce");
    assert_eq!(metadata.topic_name, topic);
    assert_eq!(metadata.error_code, 0);

    let client = connector(&unique("correlate-group")).connect().await.expect("connect");
    client.subscribe(&[topic.as_str()]).expect("subscribe");

    let message = tokio::time::timeout(Duration::from_secs(30), client.recv())
        .await
        .expect("message within timeout")
        .expect("recv");
    assert_eq!(message.topic, topic);
    assert_eq!(message.offset, metadata.offset);
    assert_eq!(message.key.as_deref(), Some(b"k1".as_slice()));
    assert_eq!(message.header("session"), Some("sess-int"));
    assert_eq!(message.json_payload().unwrap()["hello"], "world");
    assert!(client.generation_id() >= 1);

    client.commit(&message).expect("commit");
}

#[tokio::test]
#[ignore = "requires a running broker"]
async fn manager_consumes_and_logs_from_broker() {
    let topic = unique("correlate-register");
    let producer = Arc::new(RedpandaProducer::new(&brokers()).expect("producer"));
    producer
        .send(OutboundRecord::new(
            topic.as_str(),
            br#"{"email":"annabel@example.com","password":"secret"}"#.to_vec(),
        ))
        .await
        .expect("produce");

    let (logger, sink) = memory_logger(LogConfig::default());
    let manager = ConsumerGroupManager::new(Arc::new(connector(&unique("correlate-group"))), logger)
        .with_producer(producer);
    let handle = manager.handle();

    let scenario = topic.clone();
    let handler = move |mut ctx: ConsumerContext| {
        let scenario = scenario.clone();
        async move {
            ctx.common_log(&scenario)?;
            ctx.respond(200, json!({ "message": "success" }));
            anyhow::Ok(())
        }
    };

    let stopper = {
        let sink = sink.clone();
        tokio::spawn(async move {
            for _ in 0..300 {
                if !sink.summaries().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            handle.shutdown().unwrap();
        })
    };

    manager.consume(&topic, handler).await.expect("consume");
    stopper.await.unwrap();

    let summaries = sink.summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["ResponseResult"], "200");
    assert_eq!(sink.details()[0]["Input"][0]["Data"]["body"]["password"], "******");
}
