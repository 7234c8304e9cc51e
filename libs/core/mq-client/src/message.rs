//! Message types exchanged with the broker.

use crate::error::MqError;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Property holding the message tag.
pub const PROPERTY_TAGS: &str = "TAGS";
/// Property holding the message keys, joined by a single space.
pub const PROPERTY_KEYS: &str = "KEYS";
/// Property holding the sharding key used for queue selection.
pub const PROPERTY_SHARDING_KEY: &str = "SHARDING_KEY";

/// Largest topic or group name accepted by the broker.
pub const MAX_NAME_LEN: usize = 127;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[%|a-zA-Z0-9_-]+$").unwrap());

/// Check a topic or group name, returning the reason it is rejected.
pub(crate) fn check_name(kind: &str, name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{} must not be empty", kind));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "{} is {} characters long, at most {} are allowed",
            kind,
            name.len(),
            MAX_NAME_LEN
        ));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(format!(
            "{} may only contain letters, digits, `%`, `|`, `-` and `_`",
            kind
        ));
    }
    Ok(())
}

/// Validate a topic name.
pub fn validate_topic(topic: &str) -> Result<(), MqError> {
    check_name("topic", topic).map_err(|reason| MqError::InvalidTopic {
        topic: topic.to_string(),
        reason,
    })
}

/// Validate a message body against the configured size limit.
pub(crate) fn validate_body(body: &[u8], max_size: usize) -> Result<(), MqError> {
    if body.is_empty() {
        return Err(MqError::InvalidMessage("message body is empty".into()));
    }
    if body.len() > max_size {
        return Err(MqError::InvalidMessage(format!(
            "message body is {} bytes, at most {} are allowed",
            body.len(),
            max_size
        )));
    }
    Ok(())
}

/// A message to be sent, built by the application for a single send.
///
/// # Example
///
/// ```
/// use mq_client::TopicMessage;
///
/// let message = TopicMessage::new("orders", "created")
///     .with_tag("eu")
///     .with_key("order-42")
///     .with_sharding_key("customer-7");
/// assert_eq!(message.keys, vec!["order-42"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub tag: Option<String>,
    pub keys: Vec<String>,
    pub sharding_key: Option<String>,
}

impl TopicMessage {
    /// Create a message with a raw body.
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            tag: None,
            keys: Vec::new(),
            sharding_key: None,
        }
    }

    /// Create a message whose body is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, MqError> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(topic, body))
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    pub fn with_keys<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_sharding_key(mut self, key: impl Into<String>) -> Self {
        self.sharding_key = Some(key.into());
        self
    }
}

/// A message as handed to the broker: topic, body and string properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub properties: BTreeMap<String, String>,
}

impl WireMessage {
    pub fn tag(&self) -> Option<&str> {
        self.properties.get(PROPERTY_TAGS).map(String::as_str)
    }

    /// Keys in the order they were added.
    pub fn keys(&self) -> Vec<String> {
        self.properties
            .get(PROPERTY_KEYS)
            .map(|keys| keys.split(' ').filter(|k| !k.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn sharding_key(&self) -> Option<&str> {
        self.properties.get(PROPERTY_SHARDING_KEY).map(String::as_str)
    }
}

impl From<&TopicMessage> for WireMessage {
    fn from(message: &TopicMessage) -> Self {
        let mut properties = BTreeMap::new();
        if let Some(tag) = message.tag.as_deref().filter(|t| !t.is_empty()) {
            properties.insert(PROPERTY_TAGS.to_string(), tag.to_string());
        }
        if !message.keys.is_empty() {
            properties.insert(PROPERTY_KEYS.to_string(), message.keys.join(" "));
        }
        if let Some(key) = message.sharding_key.as_deref().filter(|k| !k.is_empty()) {
            properties.insert(PROPERTY_SHARDING_KEY.to_string(), key.to_string());
        }

        Self {
            topic: message.topic.clone(),
            body: message.body.clone(),
            properties,
        }
    }
}

/// A delivered message with its broker metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message: WireMessage,
    pub msg_id: String,
    pub queue_id: u32,
    pub queue_offset: u64,
    /// Milliseconds since the Unix epoch at which the producer sent the message
    pub born_timestamp: i64,
    /// How many times the broker redelivered this message
    pub reconsume_times: u32,
}

impl ReceivedMessage {
    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.message.body
    }

    pub fn tag(&self) -> Option<&str> {
        self.message.tag()
    }

    pub fn keys(&self) -> Vec<String> {
        self.message.keys()
    }

    pub fn sharding_key(&self) -> Option<&str> {
        self.message.sharding_key()
    }

    /// Decode the body as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, MqError> {
        serde_json::from_slice(&self.message.body).map_err(MqError::from)
    }
}

/// Result of a synchronous send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub msg_id: String,
    pub topic: String,
    pub queue_id: u32,
    pub queue_offset: u64,
}
