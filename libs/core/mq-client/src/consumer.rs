//! Push consumer client.

use crate::broker::{ConsumerConnection, Connector, PushConsumerOptions};
use crate::config::{ConsumerConfig, MqConfig};
use crate::dispatch::Dispatcher;
use crate::error::{InitSource, MqError, Role};
use crate::handler::{BodyHandler, FullHandler, MessageHandler, TopicBodyHandler};
use crate::health::{CheckOutcome, ErrorCallback, HealthChecker, InitCallback, InitReport};
use crate::loader::ConfigLoader;
use crate::message::{validate_topic, ReceivedMessage};
use crate::metrics::MqMetrics;
use crate::version;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

struct ConsumerState {
    loader: ConfigLoader,
    /// Configuration handed over through `init_with_config`
    given_config: Option<MqConfig>,
    /// Configuration of the current connection
    active: Option<ConsumerConfig>,
    connection: Option<Arc<dyn ConsumerConnection>>,
    subscriptions: HashMap<String, Arc<dyn MessageHandler>>,
    callback: Option<InitCallback>,
    checker: Option<HealthChecker>,
    /// Bumped by `close`; a health tick from an older loop does nothing
    loop_epoch: u64,
    close_error: Option<MqError>,
    metrics: MqMetrics,
}

struct ConsumerInner {
    connector: Arc<dyn Connector>,
    state: Mutex<ConsumerState>,
    /// Bumped by every `close`, releasing waiting subscriptions
    closes: watch::Sender<u64>,
}

/// Receives messages pushed by the broker.
///
/// Consumers are clustered: within one group every message reaches exactly
/// one instance. Clones share the connection and subscriptions.
#[derive(Clone)]
pub struct ConsumerClient {
    inner: Arc<ConsumerInner>,
}

/// A registered topic listener.
///
/// Dropping the handle keeps the subscription; use [`Subscription::unsubscribe`]
/// or [`ConsumerClient::close`] to stop delivery.
pub struct Subscription {
    client: ConsumerClient,
    topic: String,
    closes: watch::Receiver<u64>,
    epoch: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Resolves once the consumer is closed.
    pub async fn closed(&self) {
        let epoch = self.epoch;
        let mut closes = self.closes.clone();
        // A dropped sender means the client is gone, which counts as closed
        let _ = closes.wait_for(|current| *current != epoch).await;
    }

    /// Stop delivery for this topic.
    pub async fn unsubscribe(self) -> Result<(), MqError> {
        self.client.unsubscribe(&self.topic).await
    }
}

impl ConsumerClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::build(connector, ConfigLoader::new())
    }

    /// Use a custom loader (e.g. one with a preconfigured HTTP client).
    pub fn with_loader(self, loader: ConfigLoader) -> Self {
        Self::build(self.inner.connector.clone(), loader)
    }

    fn build(connector: Arc<dyn Connector>, loader: ConfigLoader) -> Self {
        let (closes, _) = watch::channel(0);
        Self {
            inner: Arc::new(ConsumerInner {
                connector,
                state: Mutex::new(ConsumerState {
                    loader,
                    given_config: None,
                    active: None,
                    connection: None,
                    subscriptions: HashMap::new(),
                    callback: None,
                    checker: None,
                    loop_epoch: 0,
                    close_error: None,
                    metrics: MqMetrics::new(""),
                }),
                closes,
            }),
        }
    }

    /// Initialize from a YAML document at a URL or path.
    ///
    /// An empty `location` reuses the last one. Does nothing when a
    /// connection already exists. The outcome is returned and also reported
    /// to `callback`, which is kept for later health-check reports.
    pub async fn init(&self, location: &str, callback: Option<InitCallback>) -> Result<(), MqError> {
        let mut state = self.inner.state.lock().await;
        if callback.is_some() {
            state.callback = callback;
        }
        state.loader.set_location(location);

        if state.connection.is_some() {
            debug!("Consumer already initialized");
            return Ok(());
        }

        let location = state.loader.location().map(str::to_string);
        let result = match location {
            Some(location) => {
                self.establish(&mut state, &InitSource::Location(location))
                    .await
            }
            None => {
                error!("Consumer configuration location is empty");
                Err(MqError::EmptySource)
            }
        };
        self.finish_init(state, result)
    }

    /// Initialize from a structured configuration.
    pub async fn init_with_config(
        &self,
        config: MqConfig,
        callback: Option<InitCallback>,
    ) -> Result<(), MqError> {
        let mut state = self.inner.state.lock().await;
        if callback.is_some() {
            state.callback = callback;
        }

        if state.connection.is_some() {
            debug!("Consumer already initialized");
            return Ok(());
        }

        state.given_config = Some(config);
        let result = self.establish(&mut state, &InitSource::Config).await;
        self.finish_init(state, result)
    }

    /// Start the health check if needed and report the init outcome.
    fn finish_init(
        &self,
        mut state: tokio::sync::MutexGuard<'_, ConsumerState>,
        result: Result<(), MqError>,
    ) -> Result<(), MqError> {
        if state.checker.is_none() {
            let interval = state
                .active
                .as_ref()
                .or(state.given_config.as_ref().map(|c| &c.consumer))
                .cloned()
                .unwrap_or_default()
                .monitoring_interval();

            if let Some(interval) = interval {
                state.checker = Some(self.spawn_checker(interval, state.loop_epoch));
            }
        }

        let callback = state.callback.clone();
        drop(state);

        let report = match &result {
            Ok(()) => InitReport::initialized(version()),
            Err(e) => {
                error!(error = %e, "Failed to initialize consumer");
                InitReport::failed(e.clone())
            }
        };
        if let Some(callback) = callback {
            callback(report);
        }
        result
    }

    /// Build a connection from `via`; the state must have no connection.
    async fn establish(&self, state: &mut ConsumerState, via: &InitSource) -> Result<(), MqError> {
        let config = match via {
            InitSource::Location(_) => state.loader.load().await?,
            InitSource::Config => {
                let config = state.given_config.clone().ok_or(MqError::NoInitSource)?;
                config.validate()?;
                config
            }
        };

        let consumer = config.consumer;
        consumer.log_level.apply();
        let connection = self
            .inner
            .connector
            .connect_consumer(&config.name_servers, &PushConsumerOptions::from(&consumer))?;

        info!(
            name_servers = ?config.name_servers,
            group = %consumer.group,
            source = %via,
            "Consumer created"
        );
        state.metrics = MqMetrics::new(&consumer.group);
        state.active = Some(consumer);
        state.connection = Some(connection);
        Ok(())
    }

    fn spawn_checker(&self, interval: std::time::Duration, epoch: u64) -> HealthChecker {
        let client: Weak<ConsumerInner> = Arc::downgrade(&self.inner);

        HealthChecker::spawn(interval, move || {
            let client = client.clone();
            async move {
                let Some(inner) = client.upgrade() else {
                    return false;
                };
                ConsumerClient { inner }.run_check(epoch).await
            }
        })
    }

    /// One health tick of the loop started at `epoch`.
    ///
    /// Returns false, without touching the connection, once `close` has
    /// ended that loop.
    async fn run_check(&self, epoch: u64) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.loop_epoch != epoch {
            debug!("Consumer closed, health check skipped");
            return false;
        }

        let report = match self.check_locked(&mut state).await {
            Ok(outcome) => outcome.report(&version()),
            Err(e) => Some(InitReport {
                check_error: Some(e),
                ..Default::default()
            }),
        };
        let callback = state.callback.clone();
        drop(state);

        if let (Some(report), Some(callback)) = (report, callback) {
            callback(report);
        }
        true
    }

    /// Check the connection and rebuild it once if it is missing or dead.
    ///
    /// A connection that has not started consuming yet counts as healthy.
    /// The location wins over a structured configuration when both were
    /// used. Subscriptions of the lost connection are registered again.
    /// Fails only when there is nothing to rebuild from.
    pub async fn check(&self) -> Result<CheckOutcome, MqError> {
        let mut state = self.inner.state.lock().await;
        self.check_locked(&mut state).await
    }

    async fn check_locked(&self, state: &mut ConsumerState) -> Result<CheckOutcome, MqError> {
        if let Some(connection) = &state.connection {
            if state.subscriptions.is_empty() || connection.is_connected() {
                return Ok(CheckOutcome::Healthy);
            }
        }

        let via = match (state.loader.location(), &state.given_config) {
            (Some(location), _) => InitSource::Location(location.to_string()),
            (None, Some(_)) => InitSource::Config,
            (None, None) => {
                warn!("Consumer connection lost and no configuration to rebuild it");
                return Err(MqError::NoInitSource);
            }
        };
        warn!(source = %via, "Consumer connection lost, re-initializing");

        if let Some(stale) = state.connection.take() {
            if let Err(e) = stale.shutdown().await {
                debug!(error = %e, "Failed to shut down lost connection");
            }
        }

        let result = match self.establish(state, &via).await {
            Ok(()) => self.resubscribe(state).await,
            Err(e) => Err(e),
        };
        state.metrics.reconnected();

        if let Err(e) = &result {
            error!(source = %via, error = %e, "Consumer re-initialization failed");
        }
        Ok(CheckOutcome::Reinitialized {
            via,
            error: result.err(),
        })
    }

    async fn resubscribe(&self, state: &mut ConsumerState) -> Result<(), MqError> {
        if state.subscriptions.is_empty() {
            return Ok(());
        }
        let (Some(connection), Some(config)) = (state.connection.clone(), state.active.clone())
        else {
            return Err(MqError::NotInitialized(Role::Consumer));
        };

        for (topic, handler) in &state.subscriptions {
            let dispatcher = Dispatcher::new(topic, handler.clone(), &config, state.metrics.clone());
            connection.subscribe(topic, Arc::new(dispatcher)).await?;
        }
        connection.start().await?;
        info!(topics = state.subscriptions.len(), "Consumer subscriptions restored");
        Ok(())
    }

    /// Register `handler` for `topic` and start consuming.
    ///
    /// If starting fails the connection is shut down and released.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, MqError> {
        validate_topic(topic).inspect_err(|e| {
            error!(topic = %topic, error = %e, "Refusing to subscribe");
        })?;

        let mut state = self.inner.state.lock().await;
        let (Some(connection), Some(config)) = (state.connection.clone(), state.active.clone())
        else {
            error!(topic = %topic, "Subscribe called before the consumer was initialized");
            return Err(MqError::NotInitialized(Role::Consumer));
        };

        let dispatcher = Dispatcher::new(topic, handler.clone(), &config, state.metrics.clone());
        connection
            .subscribe(topic, Arc::new(dispatcher))
            .await
            .inspect_err(|e| {
                error!(topic = %topic, error = %e, "Failed to subscribe");
            })?;

        if let Err(start_error) = connection.start().await {
            let error = match connection.shutdown().await {
                Ok(()) => start_error,
                Err(shutdown_error) => MqError::join(start_error, shutdown_error),
            };
            error!(topic = %topic, error = %error, "Failed to start consumer, connection closed");
            state.connection = None;
            return Err(error);
        }

        state.subscriptions.insert(topic.to_string(), handler);
        info!(topic = %topic, group = %config.group, "Subscribed");

        let closes = self.inner.closes.subscribe();
        let epoch = *closes.borrow();
        Ok(Subscription {
            client: self.clone(),
            topic: topic.to_string(),
            closes,
            epoch,
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqError> {
        let mut state = self.inner.state.lock().await;
        state.subscriptions.remove(topic);
        if let Some(connection) = &state.connection {
            connection.unsubscribe(topic).await?;
        }
        info!(topic = %topic, "Unsubscribed");
        Ok(())
    }

    /// Listen on `topic`, passing each body to `listener`.
    ///
    /// Blocks until the client is closed or `shutdown` turns `true`
    /// (dropping its sender counts as `true`). Subscribe and start failures
    /// go to `on_error` and are returned.
    pub async fn message_listener<F>(
        &self,
        topic: &str,
        listener: F,
        on_error: Option<ErrorCallback>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), MqError>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.listen(topic, Arc::new(BodyHandler(listener)), on_error, shutdown)
            .await
    }

    /// Like [`ConsumerClient::message_listener`], with the full message.
    pub async fn message_listener_full<F>(
        &self,
        topic: &str,
        listener: F,
        on_error: Option<ErrorCallback>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), MqError>
    where
        F: Fn(ReceivedMessage) + Send + Sync + 'static,
    {
        self.listen(topic, Arc::new(FullHandler(listener)), on_error, shutdown)
            .await
    }

    /// Like [`ConsumerClient::message_listener`], with the topic and body.
    pub async fn message_listener_with_topic<F>(
        &self,
        topic: &str,
        listener: F,
        on_error: Option<ErrorCallback>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), MqError>
    where
        F: Fn(&str, Vec<u8>) + Send + Sync + 'static,
    {
        self.listen(topic, Arc::new(TopicBodyHandler(listener)), on_error, shutdown)
            .await
    }

    async fn listen(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        on_error: Option<ErrorCallback>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MqError> {
        let report = |e: MqError| {
            if let Some(on_error) = &on_error {
                on_error(&e);
            }
            Err(e)
        };

        let subscription = match self.subscribe(topic, handler).await {
            Ok(subscription) => subscription,
            Err(e) => return report(e),
        };

        info!(topic = %topic, "Listening");
        let closed = tokio::select! {
            _ = subscription.closed() => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        };

        if closed {
            info!(topic = %topic, "Consumer closed, listener released");
            return Ok(());
        }
        info!(topic = %topic, "Shutdown requested, listener released");
        match subscription.unsubscribe().await {
            Ok(()) => Ok(()),
            Err(e) => report(e),
        }
    }

    /// Stop the health check, shut the connection down and release every
    /// waiting listener. Calling it again is a no-op.
    ///
    /// A shutdown error is returned and kept for [`ConsumerClient::close_error`];
    /// the connection is released either way.
    pub async fn close(&self) -> Result<(), MqError> {
        let mut state = self.inner.state.lock().await;
        state.loop_epoch += 1;
        state.subscriptions.clear();
        let checker = state.checker.take();
        let connection = state.connection.take();
        drop(state);

        if let Some(checker) = checker {
            checker.stop().await;
        }

        let result = match connection {
            Some(connection) => {
                let result = connection.shutdown().await;
                match &result {
                    Ok(()) => info!("Consumer closed"),
                    Err(e) => error!(error = %e, "Failed to close consumer"),
                }
                self.inner.state.lock().await.close_error = result.clone().err();
                result
            }
            None => Ok(()),
        };

        self.inner.closes.send_modify(|closes| *closes += 1);
        result
    }

    /// Error of the last close that actually shut a connection down.
    pub async fn close_error(&self) -> Option<MqError> {
        self.inner.state.lock().await.close_error.clone()
    }

    /// Whether a connection exists and reports itself alive.
    pub async fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::Fault;
    use crate::broker::{InMemoryBroker, MockConnector, MockConsumerConnection};
    use crate::config::DispatchMode;
    use crate::message::TopicMessage;
    use crate::producer::ProducerClient;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config(group: &str) -> MqConfig {
        MqConfig::new(["127.0.0.1:4222"]).with_consumer(
            ConsumerConfig::new(group)
                .with_monitoring_time(0)
                .with_batch_size(4),
        )
    }

    fn reports() -> (InitCallback, Arc<StdMutex<Vec<InitReport>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: InitCallback = Arc::new(move |report: InitReport| sink.lock().unwrap().push(report));
        (callback, seen)
    }

    async fn producer(broker: &InMemoryBroker) -> ProducerClient {
        let producer = ProducerClient::new(Arc::new(broker.clone()));
        producer
            .init_with_config(MqConfig::new(["127.0.0.1:4222"]), None)
            .await
            .unwrap();
        producer
    }

    fn channel_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn MessageHandler> = Arc::new(FullHandler(move |message: ReceivedMessage| {
            let _ = tx.send(message);
        }));
        (handler, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ReceivedMessage>) -> ReceivedMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_double_init_constructs_once() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect_consumer()
            .times(1)
            .returning(|_, _| Ok(Arc::new(MockConsumerConnection::new())));

        let client = ConsumerClient::new(Arc::new(connector));
        client.init_with_config(config("g"), None).await.unwrap();
        client.init_with_config(config("g"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_init_reports_version() {
        let client = ConsumerClient::new(Arc::new(InMemoryBroker::new()));
        let (callback, seen) = reports();

        client
            .init_with_config(config("g"), Some(callback))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].version.as_deref(), Some(version().as_str()));
        assert!(seen[0].is_ok());
    }

    #[tokio::test]
    async fn test_init_failure_reported() {
        let broker = InMemoryBroker::new();
        broker.inject(Fault::Connect, "refused");
        let client = ConsumerClient::new(Arc::new(broker));
        let (callback, seen) = reports();

        let err = client
            .init_with_config(config("g"), Some(callback))
            .await
            .unwrap_err();
        assert!(matches!(err, MqError::Connect { .. }));

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0].init_error, Some(MqError::Connect { .. })));
        assert!(seen[0].version.is_none());
    }

    #[tokio::test]
    async fn test_init_empty_location() {
        let client = ConsumerClient::new(Arc::new(InMemoryBroker::new()));
        let err = client.init("", None).await.unwrap_err();
        assert!(matches!(err, MqError::EmptySource));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.is_connected().await);
        assert!(client.close_error().await.is_none());
        assert_eq!(broker.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_close_error_recorded() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();

        broker.inject(Fault::Shutdown, "already gone");
        assert!(client.close().await.is_err());
        assert!(matches!(
            client.close_error().await,
            Some(MqError::Shutdown { .. })
        ));
        assert!(!client.is_connected().await);
        assert!(client.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_before_init() {
        let client = ConsumerClient::new(Arc::new(InMemoryBroker::new()));
        let (handler, _rx) = channel_handler();
        let err = client.subscribe("T", handler).await.unwrap_err();
        assert!(matches!(err, MqError::NotInitialized(Role::Consumer)));
    }

    #[tokio::test]
    async fn test_malformed_topic_reaches_callback_without_blocking() {
        let client = ConsumerClient::new(Arc::new(InMemoryBroker::new()));
        client.init_with_config(config("g"), None).await.unwrap();

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        let on_error: ErrorCallback = Arc::new(move |e: &MqError| sink.lock().unwrap().push(e.clone()));
        let (_stop, shutdown) = watch::channel(false);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            client.message_listener("bad topic!", |_| {}, Some(on_error), shutdown),
        )
        .await
        .expect("listener must not block on a bad topic");

        assert!(matches!(result, Err(MqError::InvalidTopic { .. })));
        assert!(matches!(
            errors.lock().unwrap().as_slice(),
            [MqError::InvalidTopic { .. }]
        ));
    }

    #[tokio::test]
    async fn test_start_failure_closes_connection() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();

        broker.inject(Fault::Start, "broker unreachable");
        broker.inject(Fault::Shutdown, "not running");
        let (handler, _rx) = channel_handler();
        let err = client.subscribe("T", handler).await.unwrap_err();

        assert!(matches!(err, MqError::Joined { .. }));
        assert!(err.to_string().contains("broker unreachable"));
        assert!(err.to_string().contains("not running"));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_listener_receives_and_releases_on_close() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_stop, shutdown) = watch::channel(false);
        let listener = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .message_listener_with_topic(
                        "T",
                        move |topic, body| {
                            let _ = tx.send((topic.to_string(), body));
                        },
                        None,
                        shutdown,
                    )
                    .await
            }
        });

        producer(&broker)
            .await
            .send_sync(&TopicMessage::new("T", "hello"))
            .await
            .unwrap();

        let (topic, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic, "T");
        assert_eq!(body, b"hello");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!listener.is_finished());

        client.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("close must release the listener")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_listener_released_by_shutdown_signal() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();

        let (stop, shutdown) = watch::channel(false);
        let listener = tokio::spawn({
            let client = client.clone();
            async move { client.message_listener("T", |_| {}, None, shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!listener.is_finished());

        stop.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        // The client itself stays usable
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_full_message_metadata() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();
        let (handler, mut rx) = channel_handler();
        let _subscription = client.subscribe("T", handler).await.unwrap();

        producer(&broker)
            .await
            .send_sync(
                &TopicMessage::new("T", "hello")
                    .with_tag("tg")
                    .with_keys(["k1", "k2"])
                    .with_sharding_key("order-1"),
            )
            .await
            .unwrap();

        let message = recv(&mut rx).await;
        assert_eq!(message.topic(), "T");
        assert_eq!(message.body(), b"hello");
        assert_eq!(message.tag(), Some("tg"));
        assert_eq!(message.keys(), vec!["k1", "k2"]);
        assert_eq!(message.sharding_key(), Some("order-1"));
        assert!(!message.msg_id.is_empty());
        assert!(message.born_timestamp > 0);
    }

    #[tokio::test]
    async fn test_clustered_delivery() {
        let broker = InMemoryBroker::new();
        let (first_handler, mut first) = channel_handler();
        let (second_handler, mut second) = channel_handler();
        let (audit_handler, mut audit) = channel_handler();

        let mut subscriptions = Vec::new();
        for (group, handler) in [
            ("billing", first_handler),
            ("billing", second_handler),
            ("audit", audit_handler),
        ] {
            let client = ConsumerClient::new(Arc::new(broker.clone()));
            client.init_with_config(config(group), None).await.unwrap();
            subscriptions.push(client.subscribe("T", handler).await.unwrap());
        }

        let producer = producer(&broker).await;
        for i in 0..12 {
            producer
                .send_sync(&TopicMessage::new("T", format!("m{i}")))
                .await
                .unwrap();
        }

        for _ in 0..12 {
            recv(&mut audit).await;
        }

        let mut billing = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while billing.len() < 12 && tokio::time::Instant::now() < deadline {
            tokio::select! {
                Some(m) = first.recv() => billing.push(m.msg_id),
                Some(m) = second.recv() => billing.push(m.msg_id),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(first.try_recv().is_err() && second.try_recv().is_err());

        billing.sort();
        billing.dedup();
        assert_eq!(billing.len(), 12);
    }

    #[tokio::test]
    async fn test_ordered_mode_preserves_sharding_key_order() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        let mut config = config("g");
        config.consumer = config.consumer.with_dispatch(DispatchMode::Ordered);
        client.init_with_config(config, None).await.unwrap();

        let (handler, mut rx) = channel_handler();
        let _subscription = client.subscribe("T", handler).await.unwrap();

        let producer = producer(&broker).await;
        for i in 0..10 {
            producer
                .send_one_way(&TopicMessage::new("T", format!("{i}")).with_sharding_key("order-42"))
                .await
                .unwrap();
        }

        let mut bodies = Vec::new();
        for _ in 0..10 {
            bodies.push(String::from_utf8(recv(&mut rx).await.into_body()).unwrap());
        }
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn test_check_healthy() {
        let client = ConsumerClient::new(Arc::new(InMemoryBroker::new()));
        client.init_with_config(config("g"), None).await.unwrap();
        let (handler, _rx) = channel_handler();
        let _subscription = client.subscribe("T", handler).await.unwrap();

        assert!(matches!(client.check().await, Ok(CheckOutcome::Healthy)));
    }

    #[tokio::test]
    async fn test_check_without_source() {
        let client = ConsumerClient::new(Arc::new(InMemoryBroker::new()));
        assert!(matches!(client.check().await, Err(MqError::NoInitSource)));
    }

    #[tokio::test]
    async fn test_check_reinitializes_once_from_config() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(broker.consumers_created(), 1);

        let outcome = client.check().await.unwrap();
        assert!(matches!(
            outcome,
            CheckOutcome::Reinitialized {
                via: InitSource::Config,
                error: None
            }
        ));
        assert_eq!(broker.consumers_created(), 2);
        assert!(matches!(client.check().await, Ok(CheckOutcome::Healthy)));
        assert_eq!(broker.consumers_created(), 2);
    }

    #[tokio::test]
    async fn test_check_prefers_location_over_config() {
        let path = std::env::temp_dir().join(format!("mq-consumer-{}.yml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "mq:\n  name_servers: [\"127.0.0.1:4222\"]\n  consumer:\n    group: from-file\n    monitoring_time: 0\n",
        )
        .unwrap();
        let location = path.to_str().unwrap().to_string();

        let client = ConsumerClient::new(Arc::new(InMemoryBroker::new()));
        client.init(&location, None).await.unwrap();
        client.close().await.unwrap();
        client.init_with_config(config("from-struct"), None).await.unwrap();
        client.close().await.unwrap();

        let outcome = client.check().await.unwrap();
        match outcome {
            CheckOutcome::Reinitialized { via, error } => {
                assert_eq!(via, InitSource::Location(location));
                assert!(error.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_check_resubscribes_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();
        let (handler, mut rx) = channel_handler();
        let subscription = client.subscribe("T", handler).await.unwrap();

        broker.drop_connections();
        assert!(!client.is_connected().await);

        let outcome = client.check().await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Reinitialized { error: None, .. }));
        assert!(client.is_connected().await);

        producer(&broker)
            .await
            .send_sync(&TopicMessage::new("T", "after reconnect"))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.body(), b"after reconnect");

        // Reconnects do not release listeners
        assert!(
            tokio::time::timeout(Duration::from_millis(50), subscription.closed())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_check_reports_reinit_failure() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();
        let (handler, _rx) = channel_handler();
        let _subscription = client.subscribe("T", handler).await.unwrap();
        broker.drop_connections();
        broker.inject(Fault::Connect, "still down");

        let outcome = client.check().await.unwrap();
        let report = outcome.report(&version()).unwrap();
        assert!(matches!(report.check_error, Some(MqError::ConnectionLost { .. })));
        assert!(matches!(report.init_error, Some(MqError::Connect { .. })));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_check_healthy_without_subscriptions() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        client.init_with_config(config("g"), None).await.unwrap();
        broker.drop_connections();

        // Nothing consumes yet, so a lost connection is not rebuilt
        assert!(matches!(client.check().await, Ok(CheckOutcome::Healthy)));
        assert_eq!(broker.consumers_created(), 1);
    }

    #[tokio::test]
    async fn test_tick_after_close_does_not_reconnect() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        let mut config = config("g");
        config.consumer.monitoring_time = 3600;
        client.init_with_config(config, None).await.unwrap();
        let epoch = client.inner.state.lock().await.loop_epoch;

        client.close().await.unwrap();

        // A tick that was already running when close began
        assert!(!client.run_check(epoch).await);
        assert!(!client.is_connected().await);
        assert_eq!(broker.consumers_created(), 1);

        // The loop of a later init keeps working
        let epoch = client.inner.state.lock().await.loop_epoch;
        assert!(client.run_check(epoch).await);
        assert_eq!(broker.consumers_created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_reports_through_callback() {
        let broker = InMemoryBroker::new();
        let client = ConsumerClient::new(Arc::new(broker.clone()));
        let (callback, seen) = reports();

        let mut config = config("g");
        config.consumer.monitoring_time = 5;
        client.init_with_config(config, Some(callback)).await.unwrap();
        client.close().await.unwrap();

        // Closing stopped the loop: nothing is rebuilt
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(broker.consumers_created(), 1);

        // A failed init still starts a new loop, which rebuilds the connection
        client.init("", None).await.unwrap_err();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(broker.consumers_created(), 2);
        let seen = seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|report| matches!(report.check_error, Some(MqError::ConnectionLost { .. }))));
    }
}
