//! Producer client.

use crate::broker::{Connector, ProducerConnection, ProducerOptions};
use crate::config::MqConfig;
use crate::error::{MqError, Role};
use crate::health::ErrorCallback;
use crate::loader::ConfigLoader;
use crate::message::{validate_body, validate_topic, SendReceipt, TopicMessage, WireMessage};
use crate::metrics::MqMetrics;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info};

/// Live connection plus its one-time start.
#[derive(Clone)]
struct ProducerHandle {
    connection: Arc<dyn ProducerConnection>,
    started: Arc<OnceCell<()>>,
    max_message_size: usize,
    metrics: MqMetrics,
}

impl ProducerHandle {
    async fn ensure_started(&self) -> Result<(), MqError> {
        self.started
            .get_or_try_init(|| self.connection.start())
            .await
            .map(|_| ())
    }
}

#[derive(Default)]
struct ProducerState {
    loader: ConfigLoader,
    handle: Option<ProducerHandle>,
    close_error: Option<MqError>,
}

/// Sends messages to the broker.
///
/// Cheap to clone; clones share the connection.
///
/// # Example
///
/// ```no_run
/// use mq_client::{InMemoryBroker, MqConfig, ProducerClient, TopicMessage};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), mq_client::MqError> {
/// let producer = ProducerClient::new(Arc::new(InMemoryBroker::new()));
/// producer
///     .init_with_config(MqConfig::new(["127.0.0.1:4222"]), None)
///     .await?;
///
/// let receipt = producer
///     .send_sync(&TopicMessage::new("orders", "created").with_tag("eu"))
///     .await?;
/// println!("stored as {}", receipt.msg_id);
/// producer.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProducerClient {
    connector: Arc<dyn Connector>,
    state: Arc<Mutex<ProducerState>>,
}

impl ProducerClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            state: Arc::new(Mutex::new(ProducerState::default())),
        }
    }

    /// Use a custom loader (e.g. one with a preconfigured HTTP client).
    pub fn with_loader(self, loader: ConfigLoader) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProducerState {
                loader,
                ..Default::default()
            })),
            ..self
        }
    }

    /// Initialize from a YAML document at a URL or path.
    ///
    /// An empty `location` reuses the last one. Does nothing when a
    /// connection already exists.
    pub async fn init(&self, location: &str) -> Result<(), MqError> {
        let mut state = self.state.lock().await;
        state.loader.set_location(location);

        if state.loader.location().is_none() {
            error!("Producer configuration location is empty");
            return Err(MqError::EmptySource);
        }
        if state.handle.is_some() {
            debug!("Producer already initialized");
            return Ok(());
        }

        let config = state.loader.load().await?;
        let handle = self.connect(&config).inspect_err(|e| {
            error!(error = %e, "Failed to create producer");
        })?;
        state.handle = Some(handle);
        Ok(())
    }

    /// Initialize from a structured configuration.
    ///
    /// Failures are passed to `on_error` and returned.
    pub async fn init_with_config(
        &self,
        config: MqConfig,
        on_error: Option<ErrorCallback>,
    ) -> Result<(), MqError> {
        let mut state = self.state.lock().await;
        if state.handle.is_some() {
            debug!("Producer already initialized");
            return Ok(());
        }

        let result = config.validate().and_then(|_| self.connect(&config));
        match result {
            Ok(handle) => {
                state.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to create producer");
                if let Some(on_error) = on_error {
                    on_error(&e);
                }
                Err(e)
            }
        }
    }

    fn connect(&self, config: &MqConfig) -> Result<ProducerHandle, MqError> {
        let producer = &config.producer;
        producer.log_level.apply();

        let connection = self
            .connector
            .connect_producer(&config.name_servers, &ProducerOptions::from(producer))?;

        info!(
            name_servers = ?config.name_servers,
            group = %producer.group,
            retry_count = producer.retry_count,
            "Producer created"
        );
        Ok(ProducerHandle {
            connection,
            started: Arc::new(OnceCell::new()),
            max_message_size: producer.max_message_size,
            metrics: MqMetrics::new(&producer.group),
        })
    }

    async fn prepare(&self, message: &TopicMessage) -> Result<ProducerHandle, MqError> {
        let handle = self
            .state
            .lock()
            .await
            .handle
            .clone()
            .ok_or(MqError::NotInitialized(Role::Producer))?;

        validate_topic(&message.topic)?;
        validate_body(&message.body, handle.max_message_size)?;
        handle.ensure_started().await.inspect_err(|e| {
            error!(error = %e, "Failed to start producer");
        })?;
        Ok(handle)
    }

    /// Send a message and wait until the broker stored it.
    pub async fn send_sync(&self, message: &TopicMessage) -> Result<SendReceipt, MqError> {
        let handle = self.prepare(message).await?;

        match handle.connection.send_sync(WireMessage::from(message)).await {
            Ok(receipt) => {
                handle.metrics.message_sent(&message.topic);
                debug!(
                    topic = %receipt.topic,
                    msg_id = %receipt.msg_id,
                    queue_id = receipt.queue_id,
                    queue_offset = receipt.queue_offset,
                    "Message sent"
                );
                Ok(receipt)
            }
            Err(e) => {
                handle
                    .metrics
                    .send_failed(&message.topic, &e.kind().to_string());
                error!(topic = %message.topic, error = %e, "Failed to send message");
                Err(e)
            }
        }
    }

    /// Send a message without waiting for the broker.
    pub async fn send_one_way(&self, message: &TopicMessage) -> Result<(), MqError> {
        let handle = self.prepare(message).await?;

        match handle.connection.send_one_way(WireMessage::from(message)).await {
            Ok(()) => {
                handle.metrics.message_sent(&message.topic);
                Ok(())
            }
            Err(e) => {
                handle
                    .metrics
                    .send_failed(&message.topic, &e.kind().to_string());
                error!(topic = %message.topic, error = %e, "Failed to send message one-way");
                Err(e)
            }
        }
    }

    /// Shut the connection down. Calling it again is a no-op.
    ///
    /// The shutdown error, if any, stays available through
    /// [`ProducerClient::close_error`]; the connection is released either way.
    pub async fn close(&self) -> Result<(), MqError> {
        let mut state = self.state.lock().await;
        let Some(handle) = state.handle.take() else {
            return Ok(());
        };

        let result = handle.connection.shutdown().await;
        match &result {
            Ok(()) => info!("Producer closed"),
            Err(e) => error!(error = %e, "Failed to close producer"),
        }
        state.close_error = result.clone().err();
        result
    }

    /// Error of the last close that actually shut a connection down.
    pub async fn close_error(&self) -> Option<MqError> {
        self.state.lock().await.close_error.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::Fault;
    use crate::broker::{InMemoryBroker, MockConnector, MockProducerConnection};
    use crate::config::ProducerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> MqConfig {
        MqConfig::new(["127.0.0.1:4222"]).with_producer(ProducerConfig::new("test-producer"))
    }

    async fn producer(broker: &InMemoryBroker) -> ProducerClient {
        let client = ProducerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config(), None).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_send_before_init_fails() {
        let client = ProducerClient::new(Arc::new(InMemoryBroker::new()));
        let err = client
            .send_sync(&TopicMessage::new("T", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::NotInitialized(Role::Producer)));
        assert!(client.send_one_way(&TopicMessage::new("T", "hello")).await.is_err());
    }

    #[tokio::test]
    async fn test_init_empty_location() {
        let client = ProducerClient::new(Arc::new(InMemoryBroker::new()));
        assert!(matches!(client.init("").await, Err(MqError::EmptySource)));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let broker = InMemoryBroker::new();
        let client = producer(&broker).await;

        let receipt = client
            .send_sync(&TopicMessage::new("T", "hello").with_tag("tg").with_key("k1"))
            .await
            .unwrap();
        assert_eq!(receipt.topic, "T");

        let sent = broker.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "T");
        assert_eq!(sent[0].body, b"hello");
        assert_eq!(sent[0].tag(), Some("tg"));
        assert_eq!(sent[0].keys(), vec!["k1"]);
    }

    #[tokio::test]
    async fn test_starts_lazily_once() {
        let broker = InMemoryBroker::new();
        let client = producer(&broker).await;
        assert_eq!(broker.starts(), 0);

        for _ in 0..3 {
            client
                .send_one_way(&TopicMessage::new("T", "hello"))
                .await
                .unwrap();
        }
        assert_eq!(broker.starts(), 1);
        assert_eq!(broker.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_start_failure_is_returned_and_retried() {
        let broker = InMemoryBroker::new();
        let client = producer(&broker).await;

        broker.inject(Fault::Start, "no route to broker");
        let err = client
            .send_sync(&TopicMessage::new("T", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::Start { .. }));

        broker.clear_faults();
        assert!(client.send_sync(&TopicMessage::new("T", "hello")).await.is_ok());
    }

    #[tokio::test]
    async fn test_validation() {
        let broker = InMemoryBroker::new();
        let client = producer(&broker).await;

        let err = client
            .send_sync(&TopicMessage::new("bad topic", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::InvalidTopic { .. }));

        let err = client
            .send_sync(&TopicMessage::new("T", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::InvalidMessage(_)));

        let oversized = vec![b'x'; 4 * 1024 * 1024 + 1];
        let err = client
            .send_sync(&TopicMessage::new("T", oversized))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::InvalidMessage(_)));
        assert!(broker.sent().is_empty());
    }

    #[tokio::test]
    async fn test_double_init_constructs_once() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect_producer()
            .times(1)
            .returning(|_, _| Ok(Arc::new(MockProducerConnection::new())));

        let client = ProducerClient::new(Arc::new(connector));
        client.init_with_config(config(), None).await.unwrap();
        client.init_with_config(config(), None).await.unwrap();
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_init_error_reaches_callback() {
        let broker = InMemoryBroker::new();
        broker.inject(Fault::Connect, "refused");
        let client = ProducerClient::new(Arc::new(broker));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let on_error: ErrorCallback = Arc::new(move |e: &MqError| {
            assert!(matches!(e, MqError::Connect { .. }));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(client.init_with_config(config(), Some(on_error)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let client = ProducerClient::new(Arc::new(InMemoryBroker::new()));
        let err = client
            .init_with_config(MqConfig::new(Vec::<String>::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_records_error() {
        let broker = InMemoryBroker::new();
        let client = producer(&broker).await;

        broker.inject(Fault::Shutdown, "socket already closed");
        assert!(client.close().await.is_err());
        assert!(!client.is_connected().await);
        assert!(matches!(
            client.close_error().await,
            Some(MqError::Shutdown { .. })
        ));

        // Second close is a no-op and keeps the recorded error
        assert!(client.close().await.is_ok());
        assert!(client.close_error().await.is_some());

        // A later successful close clears it
        broker.clear_faults();
        client.init_with_config(config(), None).await.unwrap();
        client.close().await.unwrap();
        assert!(client.close_error().await.is_none());
    }

    #[tokio::test]
    async fn test_init_from_file() {
        let path = std::env::temp_dir().join(format!("mq-producer-{}.yml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "go:\n  rocketmq:\n    name_servers: [\"127.0.0.1:9876\"]\n    producer:\n      group: file-producer\n",
        )
        .unwrap();

        let broker = InMemoryBroker::new();
        let client = ProducerClient::new(Arc::new(broker.clone()));
        client.init(path.to_str().unwrap()).await.unwrap();
        client.init("").await.unwrap();
        assert_eq!(broker.producers_created(), 1);

        std::fs::remove_file(path).unwrap();
    }
}
