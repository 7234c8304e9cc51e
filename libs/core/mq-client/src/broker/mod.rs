//! Broker abstraction.
//!
//! The clients only talk to the broker through these traits, so the
//! backend can be swapped: [`InMemoryBroker`] for tests and local runs,
//! `NatsConnector` (feature `nats`) for JetStream.
//!
//! Building a connection never touches the network; `start` connects and
//! may be called more than once.

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use crate::config::{ConsumerConfig, ProducerConfig};
use crate::error::MqError;
use crate::message::{ReceivedMessage, SendReceipt, WireMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use memory::InMemoryBroker;
#[cfg(feature = "nats")]
pub use nats::NatsConnector;

/// Settings for a producer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerOptions {
    pub group: String,
    pub retry_count: u32,
    pub send_timeout: Duration,
    pub topic_queue_nums: u32,
}

impl From<&ProducerConfig> for ProducerOptions {
    fn from(config: &ProducerConfig) -> Self {
        Self {
            group: config.group.clone(),
            retry_count: config.retry_count,
            send_timeout: config.send_timeout(),
            topic_queue_nums: config.topic_queue_nums,
        }
    }
}

/// Settings for a push consumer connection.
///
/// Consumption is always clustered: each message goes to one instance of
/// the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConsumerOptions {
    pub group: String,
    /// Batches of one queue are delivered one at a time, in queue order
    pub orderly: bool,
    pub batch_size: usize,
    pub consume_timeout: Duration,
}

impl From<&ConsumerConfig> for PushConsumerOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            group: config.group.clone(),
            orderly: true,
            batch_size: config.batch_size,
            consume_timeout: config.consume_timeout(),
        }
    }
}

/// What the broker should do with a delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Acknowledge every message of the batch
    Success,
    /// Redeliver the batch after a short delay
    SuspendQueue,
}

/// Receives batches of messages for one subscription.
#[async_trait]
pub trait BatchListener: Send + Sync {
    async fn on_batch(&self, messages: Vec<ReceivedMessage>) -> ConsumeOutcome;
}

/// Builds connections; the entry point of a broker backend.
#[cfg_attr(test, mockall::automock)]
pub trait Connector: Send + Sync {
    fn connect_producer(
        &self,
        name_servers: &[String],
        options: &ProducerOptions,
    ) -> Result<Arc<dyn ProducerConnection>, MqError>;

    fn connect_consumer(
        &self,
        name_servers: &[String],
        options: &PushConsumerOptions,
    ) -> Result<Arc<dyn ConsumerConnection>, MqError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProducerConnection: Send + Sync {
    async fn start(&self) -> Result<(), MqError>;

    /// Send and wait for the broker to store the message.
    async fn send_sync(&self, message: WireMessage) -> Result<SendReceipt, MqError>;

    /// Send without waiting for the broker.
    async fn send_one_way(&self, message: WireMessage) -> Result<(), MqError>;

    async fn shutdown(&self) -> Result<(), MqError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerConnection: Send + Sync {
    /// Register a listener; delivery begins once the connection is started.
    async fn subscribe(&self, topic: &str, listener: Arc<dyn BatchListener>)
        -> Result<(), MqError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqError>;

    async fn start(&self) -> Result<(), MqError>;

    async fn shutdown(&self) -> Result<(), MqError>;

    /// Whether the connection is started and still alive.
    fn is_connected(&self) -> bool;
}

/// Picks the queue a message is written to.
///
/// Messages with the same sharding key always land on the same queue;
/// messages without one are spread round-robin.
#[derive(Debug, Default)]
pub(crate) struct QueueSelector {
    next: AtomicU32,
}

impl QueueSelector {
    pub(crate) fn select(&self, sharding_key: Option<&str>, queue_nums: u32) -> u32 {
        let queue_nums = queue_nums.max(1);
        match sharding_key {
            Some(key) => stable_hash(key) % queue_nums,
            None => self.next.fetch_add(1, Ordering::Relaxed) % queue_nums,
        }
    }
}

/// String hash that is identical across processes and releases.
fn stable_hash(key: &str) -> u32 {
    key.bytes()
        .fold(0u32, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as u32))
}
