//! Hands delivered batches to a [`MessageHandler`].

use crate::broker::{BatchListener, ConsumeOutcome};
use crate::config::{BackpressurePolicy, ConsumerConfig, DispatchMode};
use crate::handler::MessageHandler;
use crate::message::ReceivedMessage;
use crate::metrics::MqMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

/// Batch listener for one subscription.
pub(crate) struct Dispatcher {
    topic: String,
    handler: Arc<dyn MessageHandler>,
    mode: DispatchMode,
    policy: BackpressurePolicy,
    /// `None` when in-flight handlers are unbounded
    permits: Option<Arc<Semaphore>>,
    max_handlers: usize,
    metrics: MqMetrics,
}

impl Dispatcher {
    pub(crate) fn new(
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        config: &ConsumerConfig,
        metrics: MqMetrics,
    ) -> Self {
        let permits = (config.max_concurrent_handlers > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_handlers)));

        Self {
            topic: topic.to_string(),
            handler,
            mode: config.dispatch,
            policy: config.backpressure,
            permits,
            max_handlers: config.max_concurrent_handlers,
            metrics,
        }
    }

    /// Acquire a handler slot according to the backpressure policy.
    ///
    /// `Ok(None)` means unbounded, `Err(())` means the message is dropped.
    async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, ()> {
        let Some(permits) = &self.permits else {
            return Ok(None);
        };

        match permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) if self.policy == BackpressurePolicy::Drop => Err(()),
            // Block, or Reject losing a race after its capacity check
            Err(_) => permits.clone().acquire_owned().await.map(Some).map_err(|_| ()),
        }
    }

    fn spawn(&self, message: ReceivedMessage, permit: Option<OwnedSemaphorePermit>) {
        let handler = self.handler.clone();
        let topic = self.topic.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            invoke(handler.as_ref(), &topic, message, &metrics).await;
            drop(permit);
        });
    }
}

#[async_trait]
impl BatchListener for Dispatcher {
    async fn on_batch(&self, messages: Vec<ReceivedMessage>) -> ConsumeOutcome {
        self.metrics.messages_received(&self.topic, messages.len());

        if self.mode == DispatchMode::Ordered {
            for message in messages {
                invoke(self.handler.as_ref(), &self.topic, message, &self.metrics).await;
            }
            return ConsumeOutcome::Success;
        }

        if self.policy == BackpressurePolicy::Reject {
            if let Some(permits) = &self.permits {
                // A batch larger than the bound only needs a full set of free slots
                let needed = messages.len().min(self.max_handlers);
                if permits.available_permits() < needed {
                    debug!(
                        topic = %self.topic,
                        batch = messages.len(),
                        available = permits.available_permits(),
                        "Handlers saturated, asking broker to redeliver batch"
                    );
                    return ConsumeOutcome::SuspendQueue;
                }
            }
        }

        for message in messages {
            match self.acquire().await {
                Ok(permit) => self.spawn(message, permit),
                Err(()) => {
                    warn!(
                        topic = %self.topic,
                        msg_id = %message.msg_id,
                        "Handlers saturated, dropping message"
                    );
                    self.metrics.message_dropped(&self.topic);
                }
            }
        }

        ConsumeOutcome::Success
    }
}

async fn invoke(
    handler: &dyn MessageHandler,
    topic: &str,
    message: ReceivedMessage,
    metrics: &MqMetrics,
) {
    let msg_id = message.msg_id.clone();
    if let Err(panic) = AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        error!(
            topic = %topic,
            msg_id = %msg_id,
            panic = %panic_message(panic.as_ref()),
            "Message handler panicked"
        );
        metrics.handler_panicked(topic);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
