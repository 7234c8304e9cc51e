//! NATS JetStream backend.
//!
//! - a topic is a stream named after the topic, capturing `<topic>.*`
//! - queue `q` of a topic is the subject `<topic>.<q>`
//! - a consumer group is a durable pull consumer shared by every instance
//! - message properties travel as `Mq-<PROPERTY>` headers

use super::{
    BatchListener, ConsumeOutcome, ConsumerConnection, Connector, ProducerConnection,
    ProducerOptions, PushConsumerOptions, QueueSelector,
};
use crate::error::{MqError, Role};
use crate::message::{
    ReceivedMessage, SendReceipt, WireMessage, PROPERTY_KEYS, PROPERTY_SHARDING_KEY, PROPERTY_TAGS,
};
use async_nats::connection::State;
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::{AckPolicy, PullConsumer};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{AckKind, Context};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";
const BORN_TIMESTAMP_HEADER: &str = "Mq-Born-Timestamp";
const PROPERTIES: [&str; 3] = [PROPERTY_TAGS, PROPERTY_KEYS, PROPERTY_SHARDING_KEY];

const FETCH_EXPIRES: Duration = Duration::from_secs(5);
const SUSPEND_DELAY: Duration = Duration::from_secs(1);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turn `host:port` entries into a comma separated NATS server list.
fn server_list(name_servers: &[String]) -> String {
    name_servers
        .iter()
        .map(|server| {
            if server.contains("://") {
                server.clone()
            } else {
                format!("nats://{}", server)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn property_header(property: &str) -> String {
    format!("Mq-{}", property)
}

fn queue_subject(topic: &str, queue_id: u32) -> String {
    format!("{}.{}", topic, queue_id)
}

async fn connect(servers: &str, name: &str) -> Result<Client, async_nats::ConnectError> {
    async_nats::ConnectOptions::new()
        .name(name)
        .connect(servers)
        .await
}

/// Get the stream for `topic`, creating it on first use.
async fn ensure_stream(jetstream: &Context, topic: &str) -> Result<(), String> {
    match jetstream.get_stream(topic).await {
        Ok(_) => {
            debug!(stream = %topic, "Stream already exists");
            Ok(())
        }
        Err(_) => {
            info!(stream = %topic, "Creating stream");
            jetstream
                .create_stream(StreamConfig {
                    name: topic.to_string(),
                    subjects: vec![format!("{}.*", topic)],
                    ..Default::default()
                })
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
    }
}

/// Get the durable consumer of `group` on `topic`, creating it on first use.
async fn ensure_consumer(
    jetstream: &Context,
    topic: &str,
    options: &PushConsumerOptions,
) -> Result<PullConsumer, String> {
    ensure_stream(jetstream, topic).await?;
    let stream = jetstream
        .get_stream(topic)
        .await
        .map_err(|e| e.to_string())?;

    if let Ok(consumer) = stream.get_consumer::<PullConfig>(&options.group).await {
        debug!(consumer = %options.group, stream = %topic, "Consumer already exists");
        return Ok(consumer);
    }

    info!(consumer = %options.group, stream = %topic, "Creating consumer");
    stream
        .create_consumer(pull_config(topic, options))
        .await
        .map_err(|e| e.to_string())
}

/// Durable pull consumer shared by every instance of the group.
///
/// In orderly mode at most one batch per group is unacknowledged, so a
/// queue is processed in order across instances while batches are full.
/// A partial batch leaves room for another instance to fetch later
/// messages of the same queue before the first batch is acknowledged.
fn pull_config(topic: &str, options: &PushConsumerOptions) -> PullConfig {
    let max_ack_pending = if options.orderly {
        options.batch_size.max(1) as i64
    } else {
        PullConfig::default().max_ack_pending
    };

    PullConfig {
        durable_name: Some(options.group.clone()),
        name: Some(options.group.clone()),
        ack_policy: AckPolicy::Explicit,
        ack_wait: options.consume_timeout,
        max_ack_pending,
        filter_subject: format!("{}.*", topic),
        ..Default::default()
    }
}

/// Builds JetStream connections for the configured servers.
#[derive(Debug, Clone, Default)]
pub struct NatsConnector;

impl NatsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for NatsConnector {
    fn connect_producer(
        &self,
        name_servers: &[String],
        options: &ProducerOptions,
    ) -> Result<Arc<dyn ProducerConnection>, MqError> {
        if name_servers.is_empty() {
            return Err(MqError::connect(Role::Producer, "no name servers"));
        }
        Ok(Arc::new(NatsProducer {
            servers: server_list(name_servers),
            options: options.clone(),
            selector: QueueSelector::default(),
            client: OnceCell::new(),
            streams: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn connect_consumer(
        &self,
        name_servers: &[String],
        options: &PushConsumerOptions,
    ) -> Result<Arc<dyn ConsumerConnection>, MqError> {
        if name_servers.is_empty() {
            return Err(MqError::connect(Role::Consumer, "no name servers"));
        }
        Ok(Arc::new(NatsConsumer {
            servers: server_list(name_servers),
            options: options.clone(),
            client: OnceCell::new(),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

struct NatsProducer {
    servers: String,
    options: ProducerOptions,
    selector: QueueSelector,
    client: OnceCell<Client>,
    /// Topics whose stream is known to exist
    streams: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl NatsProducer {
    fn client(&self, topic: &str) -> Result<&Client, MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::send(topic, "producer was shut down"));
        }
        self.client
            .get()
            .ok_or_else(|| MqError::send(topic, "producer is not started"))
    }

    async fn prepare(&self, client: &Client, topic: &str) -> Result<Context, MqError> {
        let jetstream = async_nats::jetstream::new(client.clone());
        if !lock(&self.streams).contains(topic) {
            ensure_stream(&jetstream, topic)
                .await
                .map_err(|e| MqError::send(topic, e))?;
            lock(&self.streams).insert(topic.to_string());
        }
        Ok(jetstream)
    }

    /// Subject and headers for `message`, plus the generated message id.
    fn envelope(&self, message: &WireMessage) -> (u32, String, HeaderMap, String) {
        let queue_id = self
            .selector
            .select(message.sharding_key(), self.options.topic_queue_nums);
        let msg_id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();

        let mut headers = HeaderMap::new();
        headers.insert(MESSAGE_ID_HEADER, msg_id.as_str());
        let born = chrono::Utc::now().timestamp_millis().to_string();
        headers.insert(BORN_TIMESTAMP_HEADER, born.as_str());
        for property in PROPERTIES {
            if let Some(value) = message.properties.get(property) {
                let name = property_header(property);
                headers.insert(name.as_str(), value.as_str());
            }
        }

        (queue_id, queue_subject(&message.topic, queue_id), headers, msg_id)
    }
}

#[async_trait]
impl ProducerConnection for NatsProducer {
    async fn start(&self) -> Result<(), MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::start(Role::Producer, "producer was shut down"));
        }
        self.client
            .get_or_try_init(|| connect(&self.servers, &self.options.group))
            .await
            .map_err(|e| MqError::start(Role::Producer, e))?;
        info!(servers = %self.servers, group = %self.options.group, "Producer connected");
        Ok(())
    }

    async fn send_sync(&self, message: WireMessage) -> Result<SendReceipt, MqError> {
        let topic = message.topic.clone();
        let client = self.client(&topic)?;
        let jetstream = self.prepare(client, &topic).await?;
        let (queue_id, subject, headers, msg_id) = self.envelope(&message);
        let timeout = self.options.send_timeout;

        let mut last_error = MqError::send(&topic, "no attempt was made");
        for attempt in 0..=self.options.retry_count {
            let publish = async {
                jetstream
                    .publish_with_headers(subject.clone(), headers.clone(), message.body.clone().into())
                    .await?
                    .await
            };

            match tokio::time::timeout(timeout, publish).await {
                Ok(Ok(ack)) => {
                    debug!(
                        topic = %topic,
                        subject = %subject,
                        sequence = ack.sequence,
                        "Published message"
                    );
                    return Ok(SendReceipt {
                        msg_id,
                        topic,
                        queue_id,
                        queue_offset: ack.sequence,
                    });
                }
                Ok(Err(e)) => last_error = MqError::send(&topic, e),
                Err(_) => {
                    last_error = MqError::SendTimeout {
                        topic: topic.clone(),
                        timeout,
                    }
                }
            }

            if attempt < self.options.retry_count {
                warn!(topic = %topic, attempt = attempt + 1, error = %last_error, "Send failed, retrying");
            }
        }

        Err(last_error)
    }

    async fn send_one_way(&self, message: WireMessage) -> Result<(), MqError> {
        let topic = message.topic.clone();
        let client = self.client(&topic)?;
        self.prepare(client, &topic).await?;
        let (_, subject, headers, _) = self.envelope(&message);

        client
            .publish_with_headers(subject, headers, message.body.into())
            .await
            .map_err(|e| MqError::send(&topic, e))
    }

    async fn shutdown(&self) -> Result<(), MqError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(client) = self.client.get() {
            client
                .flush()
                .await
                .map_err(|e| MqError::shutdown(Role::Producer, e))?;
        }
        Ok(())
    }
}

struct Subscription {
    listener: Arc<dyn BatchListener>,
    task: Option<JoinHandle<()>>,
}

struct NatsConsumer {
    servers: String,
    options: PushConsumerOptions,
    client: OnceCell<Client>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    closed: AtomicBool,
}

impl NatsConsumer {
    fn spawn_pump(&self, client: &Client, topic: &str, listener: Arc<dyn BatchListener>) -> JoinHandle<()> {
        let jetstream = async_nats::jetstream::new(client.clone());
        let options = self.options.clone();
        let topic = topic.to_string();
        tokio::spawn(async move { pump(jetstream, topic, options, listener).await })
    }
}

/// Fetch batches for one topic and hand them to the listener until aborted.
async fn pump(
    jetstream: Context,
    topic: String,
    options: PushConsumerOptions,
    listener: Arc<dyn BatchListener>,
) {
    loop {
        let consumer = match ensure_consumer(&jetstream, &topic, &options).await {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(topic = %topic, group = %options.group, error = %e, "Failed to prepare consumer");
                tokio::time::sleep(RETRY_BACKOFF).await;
                continue;
            }
        };

        loop {
            let mut batch = match consumer
                .fetch()
                .max_messages(options.batch_size.max(1))
                .expires(FETCH_EXPIRES)
                .messages()
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Fetch failed");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    break;
                }
            };

            let mut delivered = Vec::new();
            while let Some(message) = batch.next().await {
                match message {
                    Ok(message) => delivered.push(message),
                    Err(e) => warn!(topic = %topic, error = %e, "Error receiving message"),
                }
            }
            if delivered.is_empty() {
                continue;
            }

            let received = delivered.iter().map(|m| to_received(&topic, m)).collect();
            let outcome = listener.on_batch(received).await;

            for message in &delivered {
                let settled = match outcome {
                    ConsumeOutcome::Success => message.ack().await,
                    ConsumeOutcome::SuspendQueue => {
                        message.ack_with(AckKind::Nak(Some(SUSPEND_DELAY))).await
                    }
                };
                if let Err(e) = settled {
                    warn!(topic = %topic, error = %e, "Failed to settle message");
                }
            }
        }
    }
}

fn to_received(topic: &str, message: &async_nats::jetstream::Message) -> ReceivedMessage {
    let header = |name: &str| {
        message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .map(|value| value.as_str().to_string())
    };

    let mut properties = BTreeMap::new();
    for property in PROPERTIES {
        if let Some(value) = header(&property_header(property)) {
            properties.insert(property.to_string(), value);
        }
    }

    let queue_id = message
        .subject
        .as_str()
        .rsplit('.')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(0);

    let (queue_offset, reconsume_times) = match message.info() {
        Ok(info) => (info.stream_sequence, info.delivered.saturating_sub(1) as u32),
        Err(e) => {
            warn!(error = %e, "Failed to get message info, using defaults");
            (0, 0)
        }
    };

    ReceivedMessage {
        message: WireMessage {
            topic: topic.to_string(),
            body: message.payload.to_vec(),
            properties,
        },
        msg_id: header(MESSAGE_ID_HEADER).unwrap_or_default(),
        queue_id,
        queue_offset,
        born_timestamp: header(BORN_TIMESTAMP_HEADER)
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        reconsume_times,
    }
}

#[async_trait]
impl ConsumerConnection for NatsConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn BatchListener>,
    ) -> Result<(), MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::subscribe(topic, "consumer was shut down"));
        }

        let task = self
            .client
            .get()
            .map(|client| self.spawn_pump(client, topic, listener.clone()));
        let previous = lock(&self.subscriptions)
            .insert(topic.to_string(), Subscription { listener, task });

        if let Some(task) = previous.and_then(|s| s.task) {
            task.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqError> {
        if let Some(task) = lock(&self.subscriptions).remove(topic).and_then(|s| s.task) {
            task.abort();
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::start(Role::Consumer, "consumer was shut down"));
        }

        let client = self
            .client
            .get_or_try_init(|| connect(&self.servers, &self.options.group))
            .await
            .map_err(|e| MqError::start(Role::Consumer, e))?;

        let mut subscriptions = lock(&self.subscriptions);
        for (topic, subscription) in subscriptions.iter_mut() {
            if subscription.task.is_none() {
                subscription.task =
                    Some(self.spawn_pump(client, topic, subscription.listener.clone()));
                info!(topic = %topic, group = %self.options.group, "Consuming topic");
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MqError> {
        self.closed.store(true, Ordering::SeqCst);
        for (_, subscription) in lock(&self.subscriptions).drain() {
            if let Some(task) = subscription.task {
                task.abort();
            }
        }

        if let Some(client) = self.client.get() {
            client
                .flush()
                .await
                .map_err(|e| MqError::shutdown(Role::Consumer, e))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self
                .client
                .get()
                .is_some_and(|client| matches!(client.connection_state(), State::Connected))
    }
}
