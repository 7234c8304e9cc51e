//! Counters recorded by the clients through the `metrics` facade.
//!
//! Nothing is exported unless the application installs a recorder.

use metrics::counter;

/// Metrics for one consumer group or producer group.
#[derive(Debug, Clone)]
pub struct MqMetrics {
    group: String,
}

impl MqMetrics {
    pub fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
        }
    }

    /// Record a message accepted by the broker.
    pub fn message_sent(&self, topic: &str) {
        counter!(
            "mq_messages_sent_total",
            "group" => self.group.clone(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    /// Record a failed send.
    pub fn send_failed(&self, topic: &str, kind: &str) {
        counter!(
            "mq_send_failures_total",
            "group" => self.group.clone(),
            "topic" => topic.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Record a batch of delivered messages.
    pub fn messages_received(&self, topic: &str, count: usize) {
        counter!(
            "mq_messages_received_total",
            "group" => self.group.clone(),
            "topic" => topic.to_string()
        )
        .increment(count as u64);
    }

    pub fn handler_panicked(&self, topic: &str) {
        counter!(
            "mq_handler_panics_total",
            "group" => self.group.clone(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    /// Record a message discarded by the `drop` backpressure policy.
    pub fn message_dropped(&self, topic: &str) {
        counter!(
            "mq_messages_dropped_total",
            "group" => self.group.clone(),
            "topic" => topic.to_string()
        )
        .increment(1);
    }

    /// Record a re-initialization performed by the health check.
    pub fn reconnected(&self) {
        counter!("mq_reconnects_total", "group" => self.group.clone()).increment(1);
    }
}
