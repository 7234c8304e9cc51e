//! Message queue client: a producer and a clustered push consumer.
//!
//! Both clients are configured from a YAML document fetched over HTTP(S) or
//! read from disk, or from an [`MqConfig`] built in code. The broker library
//! sits behind the [`Connector`] seam: [`NatsConnector`] talks to NATS
//! JetStream, [`InMemoryBroker`] runs everything in-process for tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   send_sync / send_one_way   ┌──────────────────┐
//! │ProducerClient│─────────────────────────────▶│                  │
//! └──────────────┘                              │  Connector       │
//!                                               │  (NATS / memory) │
//! ┌──────────────┐   subscribe + start          │                  │
//! │ConsumerClient│─────────────────────────────▶│                  │
//! └──────┬───────┘                              └────────┬─────────┘
//!        │ health check                                  │ batches
//!        ▼                                               ▼
//!   re-init from last source                  Dispatcher ─▶ MessageHandler
//! ```
//!
//! # Example
//!
//! ```ignore
//! use mq_client::{ConsumerClient, NatsConnector, ProducerClient, TopicMessage};
//! use std::sync::Arc;
//!
//! let producer = ProducerClient::new(Arc::new(NatsConnector));
//! producer.init("https://config.internal/mq.yml").await?;
//! producer
//!     .send_sync(&TopicMessage::new("orders", r#"{"id":1}"#).with_tag("created"))
//!     .await?;
//!
//! let consumer = ConsumerClient::new(Arc::new(NatsConnector));
//! consumer.init("https://config.internal/mq.yml", None).await?;
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! consumer
//!     .message_listener("orders", |body| println!("{}", body.len()), None, shutdown)
//!     .await?;
//! ```

pub mod broker;
mod config;
mod consumer;
mod dispatch;
mod error;
mod handler;
mod health;
mod loader;
mod message;
mod metrics;
mod producer;

pub use broker::memory::{Fault, InMemoryBroker};
#[cfg(feature = "nats")]
pub use broker::nats::NatsConnector;
pub use broker::{
    BatchListener, ConsumeOutcome, ConsumerConnection, Connector, ProducerConnection,
    ProducerOptions, PushConsumerOptions,
};
pub use config::{
    BackpressurePolicy, ConsumerConfig, DispatchMode, LogLevel, MqConfig, ProducerConfig,
};
pub use consumer::{ConsumerClient, Subscription};
pub use error::{ErrorKind, InitSource, MqError, Role};
pub use handler::{BodyHandler, FullHandler, MessageHandler, TopicBodyHandler};
pub use health::{CheckOutcome, ErrorCallback, InitCallback, InitReport};
pub use loader::ConfigLoader;
pub use message::{
    validate_topic, ReceivedMessage, SendReceipt, TopicMessage, WireMessage, PROPERTY_KEYS,
    PROPERTY_SHARDING_KEY, PROPERTY_TAGS,
};
pub use metrics::MqMetrics;
pub use producer::ProducerClient;

/// Crate version reported by successful initializations.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version string handed to the init callback, e.g. `mq-client v0.1.0`.
pub fn version() -> String {
    format!("mq-client v{}", VERSION)
}
