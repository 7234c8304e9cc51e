//! Configuration types for the producer and consumer clients.
//!
//! A configuration is either built in code, parsed from a YAML document
//! (see [`crate::loader::ConfigLoader`]) or read from environment variables.
//!
//! ```yaml
//! mq:
//!   name_servers: ["127.0.0.1:4222"]
//!   producer:
//!     retry_count: 2
//!     timeout: 5
//!     topic_queue_nums: 4
//!     group: orders-producer
//!   consumer:
//!     group: orders-consumer
//!     monitoring_time: 10
//!     log_level: warn
//! ```
//!
//! Documents using the older `go.rocketmq` root with the same keys are
//! accepted as well.

use crate::error::MqError;
use crate::message::check_name;
use core_config::{env_list, env_or_default, env_parse_or, ConfigError, FromEnv};
use serde::Deserialize;
use std::time::Duration;

/// Log level applied to the broker library's own logging.
///
/// Parsing is lossy: anything unrecognised becomes `Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Parse a level name case-insensitively, defaulting to `Info`.
    pub fn parse_lossy(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "fatal" => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }

    /// The `tracing` filter level for this setting (`fatal` maps to `error`).
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }

    /// Route the broker library's logs through this level.
    ///
    /// Only takes effect when tracing was installed with
    /// `core_config::tracing::init_tracing`.
    pub(crate) fn apply(&self) {
        let level = self.as_directive();
        core_config::tracing::set_target_level("async_nats", level);
        core_config::tracing::set_target_level("mq_client::broker", level);
    }
}

impl From<String> for LogLevel {
    fn from(level: String) -> Self {
        LogLevel::parse_lossy(&level)
    }
}

/// What the consumer does when every handler slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait for a free slot; acknowledgement of the batch is delayed
    #[default]
    Block,
    /// Discard the message with a warning
    Drop,
    /// Ask the broker to redeliver the whole batch later
    Reject,
}

/// How handlers are invoked for the messages of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One task per message, batch acknowledged without waiting for handlers
    #[default]
    Concurrent,
    /// Handlers run one after another in broker order before acknowledgement
    Ordered,
}

/// Producer settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Extra attempts after a failed synchronous send
    pub retry_count: u32,

    /// Send timeout in seconds
    pub timeout: u64,

    /// Queue count used when a topic is created by the first send
    pub topic_queue_nums: u32,

    /// Producer group name
    pub group: String,

    /// Broker library log level
    pub log_level: LogLevel,

    /// Largest accepted message body in bytes
    pub max_message_size: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            retry_count: 2,
            timeout: 3,
            topic_queue_nums: 4,
            group: "DEFAULT_PRODUCER".to_string(),
            log_level: LogLevel::Info,
            max_message_size: 4 * 1024 * 1024,
        }
    }
}

impl ProducerConfig {
    /// Create producer settings for the given group.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Default::default()
        }
    }

    /// Send timeout as a `Duration`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Set the retry count.
    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    /// Set the send timeout in seconds.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    /// Set the default queue count for new topics.
    pub fn with_topic_queue_nums(mut self, queues: u32) -> Self {
        self.topic_queue_nums = queues;
        self
    }

    /// Set the broker log level.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Time in seconds a delivered batch may stay unacknowledged
    pub timeout: u64,

    /// Consumer group name
    pub group: String,

    /// Health-check interval in seconds (0 disables the check)
    pub monitoring_time: u64,

    /// Broker library log level
    pub log_level: LogLevel,

    /// Maximum messages handed over per batch
    pub batch_size: usize,

    /// In-flight handler limit in concurrent mode (0 = unbounded)
    pub max_concurrent_handlers: usize,

    /// Behaviour when the handler limit is reached
    pub backpressure: BackpressurePolicy,

    /// Handler invocation mode
    pub dispatch: DispatchMode,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            group: "DEFAULT_CONSUMER".to_string(),
            monitoring_time: 30,
            log_level: LogLevel::Info,
            batch_size: 16,
            max_concurrent_handlers: 64,
            backpressure: BackpressurePolicy::Block,
            dispatch: DispatchMode::Concurrent,
        }
    }
}

impl ConsumerConfig {
    /// Create consumer settings for the given group.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Default::default()
        }
    }

    /// Acknowledgement timeout as a `Duration`.
    pub fn consume_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Health-check interval, `None` when disabled.
    pub fn monitoring_interval(&self) -> Option<Duration> {
        (self.monitoring_time > 0).then(|| Duration::from_secs(self.monitoring_time))
    }

    /// Set the health-check interval in seconds.
    pub fn with_monitoring_time(mut self, secs: u64) -> Self {
        self.monitoring_time = secs;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the in-flight handler limit (0 = unbounded).
    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max;
        self
    }

    /// Set the backpressure policy.
    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    /// Set the dispatch mode.
    pub fn with_dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    /// Set the broker log level.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct MqConfig {
    /// Broker addresses as `host:port`, tried in order
    pub name_servers: Vec<String>,

    /// Producer settings
    pub producer: ProducerConfig,

    /// Consumer settings
    pub consumer: ConsumerConfig,
}

/// Top level of a YAML configuration document.
#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    mq: Option<MqConfig>,
    #[serde(default)]
    go: Option<LegacyRoot>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyRoot {
    #[serde(default)]
    rocketmq: Option<MqConfig>,
}

impl MqConfig {
    /// Create a configuration with default producer and consumer settings.
    pub fn new<S: Into<String>>(name_servers: impl IntoIterator<Item = S>) -> Self {
        Self {
            name_servers: name_servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the producer settings.
    pub fn with_producer(mut self, producer: ProducerConfig) -> Self {
        self.producer = producer;
        self
    }

    /// Set the consumer settings.
    pub fn with_consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(document: &str) -> Result<Self, MqError> {
        let document: ConfigDocument =
            serde_yaml_ng::from_str(document).map_err(|e| MqError::Parse(e.to_string()))?;

        let config = document
            .mq
            .or_else(|| document.go.and_then(|root| root.rocketmq))
            .ok_or_else(|| {
                MqError::Parse("document has neither an `mq` nor a `go.rocketmq` section".into())
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can be used to build connections.
    pub fn validate(&self) -> Result<(), MqError> {
        if self.name_servers.is_empty() {
            return Err(MqError::InvalidConfig(
                "at least one name server is required".into(),
            ));
        }

        for server in &self.name_servers {
            validate_server_address(server)?;
        }

        check_name("producer group", &self.producer.group)
            .map_err(MqError::InvalidConfig)?;
        check_name("consumer group", &self.consumer.group)
            .map_err(MqError::InvalidConfig)?;

        if self.producer.topic_queue_nums == 0 {
            return Err(MqError::InvalidConfig(
                "producer.topic_queue_nums must be at least 1".into(),
            ));
        }
        if self.consumer.batch_size == 0 {
            return Err(MqError::InvalidConfig(
                "consumer.batch_size must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Accepts `host:port`, optionally prefixed with a scheme (`nats://host:port`).
fn validate_server_address(server: &str) -> Result<(), MqError> {
    let without_scheme = server
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(server);

    let (host, port) = without_scheme.rsplit_once(':').ok_or_else(|| {
        MqError::InvalidConfig(format!("name server `{}` is not host:port", server))
    })?;

    if host.trim().is_empty() {
        return Err(MqError::InvalidConfig(format!(
            "name server `{}` has an empty host",
            server
        )));
    }

    port.parse::<u16>().map_err(|e| {
        MqError::InvalidConfig(format!("name server `{}` has an invalid port: {}", server, e))
    })?;

    Ok(())
}

impl FromEnv for MqConfig {
    /// Requires MQ_NAME_SERVERS (comma separated); everything else has defaults.
    fn from_env() -> Result<Self, ConfigError> {
        let name_servers = env_list("MQ_NAME_SERVERS")
            .filter(|servers| !servers.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("MQ_NAME_SERVERS".to_string()))?;

        let producer_defaults = ProducerConfig::default();
        let producer = ProducerConfig {
            retry_count: env_parse_or("MQ_PRODUCER_RETRY_COUNT", producer_defaults.retry_count)?,
            timeout: env_parse_or("MQ_PRODUCER_TIMEOUT_SECS", producer_defaults.timeout)?,
            topic_queue_nums: env_parse_or(
                "MQ_PRODUCER_TOPIC_QUEUE_NUMS",
                producer_defaults.topic_queue_nums,
            )?,
            group: env_or_default("MQ_PRODUCER_GROUP", &producer_defaults.group),
            log_level: LogLevel::parse_lossy(&env_or_default("MQ_PRODUCER_LOG_LEVEL", "info")),
            ..producer_defaults
        };

        let consumer_defaults = ConsumerConfig::default();
        let consumer = ConsumerConfig {
            timeout: env_parse_or("MQ_CONSUMER_TIMEOUT_SECS", consumer_defaults.timeout)?,
            group: env_or_default("MQ_CONSUMER_GROUP", &consumer_defaults.group),
            monitoring_time: env_parse_or(
                "MQ_CONSUMER_MONITORING_SECS",
                consumer_defaults.monitoring_time,
            )?,
            log_level: LogLevel::parse_lossy(&env_or_default("MQ_CONSUMER_LOG_LEVEL", "info")),
            ..consumer_defaults
        };

        Ok(Self {
            name_servers,
            producer,
            consumer,
        })
    }
}
