//! End-to-end consumer tests over the in-memory broker

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use correlate_core::{LogConfig, Payload};
use correlate_runtime::{
    ConsumerContext, ConsumerGroupManager, ConsumerLifecycleState, LifecycleError, SendOptions,
};
use correlate_testing::{InMemoryConsumerGroup, InMemoryProducer, memory_logger};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

#[derive(Debug, Deserialize)]
struct Register {
    email: String,
    password: String,
}

async fn insert_one(email: &str) -> Result<serde_json::Value, std::io::Error> {
    Ok(json!({ "insertedId": format!("user:{email}") }))
}

async fn register(mut ctx: ConsumerContext) -> anyhow::Result<()> {
    let request: Register = ctx.read_json()?;
    let txn = ctx.common_log("service.register")?.clone();

    let inserted = txn
        .record_call(
            "mongo",
            "insertOne",
            Payload::Structured(json!({ "email": request.email, "password": request.password })),
            insert_one(&request.email),
        )
        .await;

    match inserted {
        Ok(_) => ctx.respond(200, json!({ "message": "success" })),
        Err(e) => ctx.respond(500, json!({ "message": e.to_string() })),
    }
    Ok(())
}

#[tokio::test]
async fn register_scenario_emits_one_detail_and_one_summary() {
    let group = InMemoryConsumerGroup::new();
    let (logger, sink) = memory_logger(LogConfig::default());
    let manager = ConsumerGroupManager::new(Arc::new(group.clone()), logger);
    let handle = manager.handle();

    group.publish(
        "service.register",
        br#"{"email":"annabel@example.com","password":"secret"}"#.to_vec(),
    );

    let stopper = {
        let group = group.clone();
        tokio::spawn(async move {
            group.wait_for_commits(1).await;
            handle.shutdown().unwrap();
        })
    };
    manager.consume("service.register", register).await.unwrap();
    stopper.await.unwrap();

    let details = sink.details();
    let summaries = sink.summaries();
    assert_eq!(details.len(), 1);
    assert_eq!(summaries.len(), 1);

    let detail = &details[0];
    assert_eq!(detail["Scenario"], "service.register");
    assert_eq!(detail["Input"].as_array().unwrap().len(), 2);
    assert_eq!(detail["Output"].as_array().unwrap().len(), 2);
    assert_eq!(detail["Input"][0]["Event"], "kafka_consumer.service.register");
    assert_eq!(detail["Input"][0]["Data"]["body"]["password"], "******");
    assert_eq!(detail["Input"][0]["Data"]["body"]["email"], "ann****@example.com");
    assert_eq!(detail["Output"][0]["Event"], "mongo.insertOne");
    assert!(detail["Input"][1]["ResTime"].is_string());
    assert!(detail["InitInvoke"].as_str().unwrap().starts_with("x-tid:"));
    assert!(detail["InitInvoke"].as_str().unwrap().ends_with(":1"));

    let summary = &summaries[0];
    assert_eq!(summary["ResponseResult"], "200");
    assert_eq!(summary["ResponseDesc"], "OK");
    assert_eq!(summary["Sequences"][0]["Node"], "mongo");
    assert_eq!(summary["Sequences"][0]["Result"][0]["Result"], "200");

    assert_eq!(group.committed_offsets(), vec![0]);
    assert_eq!(manager.state(), ConsumerLifecycleState::Stopped);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_handler() {
    let group = InMemoryConsumerGroup::new();
    let (logger, sink) = memory_logger(LogConfig::default());
    let manager = ConsumerGroupManager::new(Arc::new(group.clone()), logger);
    let handle = manager.handle();

    let started = Arc::new(Notify::new());
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

    group.publish("orders", br#"{"id":1}"#.to_vec());
    group.publish("orders", br#"{"id":2}"#.to_vec());

    let handler = {
        let started = Arc::clone(&started);
        move |mut ctx: ConsumerContext| {
            let started = Arc::clone(&started);
            let release_rx = Arc::clone(&release_rx);
            async move {
                ctx.common_log("order.create")?;
                started.notify_one();
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                ctx.respond(201, json!({ "created": true }));
                anyhow::Ok(())
            }
        }
    };

    let consumer = tokio::spawn(async move { manager.consume("orders", handler).await });

    started.notified().await;
    handle.shutdown().unwrap();
    handle.wait_for(ConsumerLifecycleState::ShuttingDown).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!consumer.is_finished());
    assert!(group.committed().is_empty());

    release_tx.send(()).unwrap();
    consumer.await.unwrap().unwrap();

    // The second message was never delivered.
    assert_eq!(group.committed_offsets(), vec![0]);
    assert_eq!(group.pending(), 1);
    assert_eq!(sink.summaries().len(), 1);
    assert_eq!(sink.summaries()[0]["ResponseResult"], "201");
    assert_eq!(handle.state(), ConsumerLifecycleState::Stopped);
    assert!(matches!(handle.pause(), Err(LifecycleError::ControlClosed)));
}

#[tokio::test]
async fn send_message_is_logged_and_produced() {
    let group = InMemoryConsumerGroup::new();
    let producer = InMemoryProducer::new();
    let (logger, sink) = memory_logger(LogConfig::default());
    let manager = ConsumerGroupManager::new(Arc::new(group.clone()), logger)
        .with_producer(Arc::new(producer.clone()));
    let handle = manager.handle();

    group.push(
        correlate_core::InboundMessage::new("service.register", br#"{"email":"a@b.c"}"#.to_vec())
            .with_header("session", "sess-42"),
    );

    let handler = |mut ctx: ConsumerContext| async move {
        ctx.common_log("service.register")?;
        ctx.send_message(
            "mail.send",
            &json!({ "to": "a@b.c", "template": "welcome" }),
            SendOptions::default().key("a@b.c"),
        )
        .await?;
        ctx.respond(200, json!({ "message": "success" }));
        anyhow::Ok(())
    };

    let stopper = {
        let group = group.clone();
        tokio::spawn(async move {
            group.wait_for_commits(1).await;
            handle.shutdown().unwrap();
        })
    };
    manager.consume("service.register", handler).await.unwrap();
    stopper.await.unwrap();

    let sent = producer.sent_to("mail.send");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key.as_deref(), Some(b"a@b.c".as_slice()));

    let detail = &sink.details()[0];
    assert_eq!(detail["Session"], "sess-42");
    assert_eq!(detail["Output"][0]["Event"], "kafka_producer.mail.send");
    assert_eq!(detail["Input"][1]["Data"]["topicName"], "mail.send");

    let summary = &sink.summaries()[0];
    assert_eq!(summary["Sequences"][0]["Node"], "kafka_producer");
    assert_eq!(summary["Sequences"][0]["Cmd"], "mail.send");
}

#[tokio::test]
async fn handler_errors_and_consume_errors_do_not_stop_the_loop() {
    let group = InMemoryConsumerGroup::new();
    let (logger, sink) = memory_logger(LogConfig::default());
    let manager = ConsumerGroupManager::new(Arc::new(group.clone()), logger);
    let handle = manager.handle();

    group.publish("t", b"not json".to_vec());
    group.push_error(correlate_core::BrokerError::ConsumeFailed("rebalance in progress".into()));
    group.publish("t", br#"{"ok":true}"#.to_vec());

    let handler = |mut ctx: ConsumerContext| async move {
        ctx.common_log("t.handle")?;
        let value: serde_json::Value = ctx.read_json()?;
        ctx.respond(200, value);
        anyhow::Ok(())
    };

    let stopper = {
        let group = group.clone();
        tokio::spawn(async move {
            group.wait_for_commits(2).await;
            handle.shutdown().unwrap();
        })
    };
    manager.consume("t", handler).await.unwrap();
    stopper.await.unwrap();

    assert_eq!(group.committed_offsets(), vec![0, 1]);
    let results: Vec<_> = sink
        .summaries()
        .iter()
        .map(|s| s["ResponseResult"].as_str().unwrap().to_string())
        .collect();
    // The first handler bailed out before responding; its context closed the transaction.
    assert_eq!(results, vec!["500", "200"]);
    assert_eq!(sink.summaries()[0]["ResponseDesc"], "no_response");
}

#[tokio::test]
async fn pause_stops_delivery_until_resume() {
    let group = InMemoryConsumerGroup::new();
    let (logger, _sink) = memory_logger(LogConfig::default());
    let manager = Arc::new(ConsumerGroupManager::new(Arc::new(group.clone()), logger));
    let handle = manager.handle();

    let consumer = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .consume("t", |_ctx: ConsumerContext| async { anyhow::Ok(()) })
                .await
        })
    };
    handle.wait_for(ConsumerLifecycleState::Running).await.unwrap();

    handle.pause().unwrap();
    handle.wait_for(ConsumerLifecycleState::Paused).await.unwrap();
    assert!(group.is_paused());

    group.publish("t", b"{}".to_vec());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(group.committed().is_empty());
    // Fetched from the client but held back.
    assert_eq!(group.pending(), 0);

    handle.resume().unwrap();
    group.wait_for_commits(1).await;
    assert!(!group.is_paused());

    handle.shutdown().unwrap();
    consumer.await.unwrap().unwrap();
    assert_eq!(group.connect_count(), 1);
    assert_eq!(group.subscriptions(), vec!["t".to_string()]);
}
