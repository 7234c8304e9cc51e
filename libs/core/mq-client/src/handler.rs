//! Message handlers invoked by the consumer.

use crate::message::ReceivedMessage;
use async_trait::async_trait;

/// Application code run for every delivered message.
///
/// Handlers cannot fail the delivery: once dispatched, a message counts as
/// consumed. A panic inside `handle` is caught and logged.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ReceivedMessage);
}

/// Calls a closure with the message body.
pub struct BodyHandler<F>(pub F);

#[async_trait]
impl<F> MessageHandler for BodyHandler<F>
where
    F: Fn(Vec<u8>) + Send + Sync,
{
    async fn handle(&self, message: ReceivedMessage) {
        (self.0)(message.into_body())
    }
}

/// Calls a closure with the full message.
pub struct FullHandler<F>(pub F);

#[async_trait]
impl<F> MessageHandler for FullHandler<F>
where
    F: Fn(ReceivedMessage) + Send + Sync,
{
    async fn handle(&self, message: ReceivedMessage) {
        (self.0)(message)
    }
}

/// Calls a closure with the topic and the message body.
pub struct TopicBodyHandler<F>(pub F);

#[async_trait]
impl<F> MessageHandler for TopicBodyHandler<F>
where
    F: Fn(&str, Vec<u8>) + Send + Sync,
{
    async fn handle(&self, message: ReceivedMessage) {
        let topic = message.message.topic.clone();
        (self.0)(&topic, message.into_body())
    }
}
