//! End-to-end tests against a NATS JetStream container.

#![cfg(feature = "nats")]

use mq_client::{
    ConsumerClient, ConsumerConfig, MqConfig, NatsConnector, ProducerClient, ProducerConfig,
    ReceivedMessage, TopicMessage,
};
use std::sync::Arc;
use std::time::Duration;
use test_utils::{TestDataBuilder, TestNats};
use tokio::sync::{mpsc, watch};

fn config(nats: &TestNats, builder: &TestDataBuilder) -> MqConfig {
    MqConfig::new([nats.name_server()])
        .with_producer(ProducerConfig::new(builder.group("producer")).with_topic_queue_nums(2))
        .with_consumer(
            ConsumerConfig::new(builder.group("consumer"))
                .with_monitoring_time(0)
                .with_batch_size(8),
        )
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_send_and_listen() {
    let nats = TestNats::new().await;
    let builder = TestDataBuilder::from_test_name("test_send_and_listen");
    let topic = builder.topic("orders");

    let producer = ProducerClient::new(Arc::new(NatsConnector));
    producer
        .init_with_config(config(&nats, &builder), None)
        .await
        .unwrap();

    let receipt = producer
        .send_sync(
            &TopicMessage::new(&topic, "hello")
                .with_tag("created")
                .with_key(builder.key(0)),
        )
        .await
        .unwrap();
    assert_eq!(receipt.topic, topic);
    assert!(!receipt.msg_id.is_empty());
    assert_eq!(nats.stream_messages(&topic).await, 1);

    let consumer = ConsumerClient::new(Arc::new(NatsConnector));
    consumer
        .init_with_config(config(&nats, &builder), None)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (stop, shutdown) = watch::channel(false);
    let listener = tokio::spawn({
        let consumer = consumer.clone();
        let topic = topic.clone();
        async move {
            consumer
                .message_listener_full(
                    &topic,
                    move |message: ReceivedMessage| {
                        let _ = tx.send(message);
                    },
                    None,
                    shutdown,
                )
                .await
        }
    });

    let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for message")
        .unwrap();
    assert_eq!(message.body(), b"hello");
    assert_eq!(message.tag(), Some("created"));
    assert_eq!(message.keys(), vec![builder.key(0)]);
    assert_eq!(message.msg_id, receipt.msg_id);

    stop.send(true).unwrap();
    listener.await.unwrap().unwrap();

    consumer.close().await.unwrap();
    producer.close().await.unwrap();
    assert!(consumer.close_error().await.is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_health_check_after_close() {
    let nats = TestNats::new().await;
    let builder = TestDataBuilder::from_test_name("test_health_check_after_close");

    let consumer = ConsumerClient::new(Arc::new(NatsConnector));
    consumer
        .init_with_config(config(&nats, &builder), None)
        .await
        .unwrap();
    consumer.close().await.unwrap();

    let outcome = consumer.check().await.unwrap();
    assert!(matches!(
        outcome,
        mq_client::CheckOutcome::Reinitialized { error: None, .. }
    ));
    consumer.close().await.unwrap();
}
