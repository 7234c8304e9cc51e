//! In-process broker.
//!
//! Topics are split into queues; each consumer group keeps its own offset
//! per queue. A queue is owned by exactly one subscriber of a group at a
//! time, so messages of one queue reach one instance in order, and every
//! group sees every message. Faults can be injected per operation and
//! [`InMemoryBroker::drop_connections`] simulates a lost broker link.

use super::{
    BatchListener, ConsumeOutcome, ConsumerConnection, Connector, ProducerConnection,
    ProducerOptions, PushConsumerOptions, QueueSelector,
};
use crate::error::{MqError, Role};
use crate::message::{ReceivedMessage, SendReceipt, WireMessage};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

const IDLE_POLL: Duration = Duration::from_millis(50);

/// Operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Connect,
    Start,
    Send,
    Subscribe,
    Shutdown,
}

type GroupKey = (String, String);

#[derive(Default)]
struct GroupState {
    offsets: HashMap<u32, u64>,
    members: BTreeSet<u64>,
    in_flight: HashSet<u32>,
    reconsume: HashMap<(u32, u64), u32>,
}

struct BrokerState {
    topics: Mutex<HashMap<String, Vec<Vec<ReceivedMessage>>>>,
    groups: Mutex<HashMap<GroupKey, GroupState>>,
    faults: Mutex<HashMap<Fault, String>>,
    sent: Mutex<Vec<WireMessage>>,
    generation: AtomicU64,
    next_member: AtomicU64,
    producers_created: AtomicUsize,
    consumers_created: AtomicUsize,
    starts: AtomicUsize,
    shutdowns: AtomicUsize,
    suspend_delay_ms: AtomicU64,
    arrivals: Notify,
}

/// Claimed slice of one queue, owned by a single subscriber until settled.
struct Claim {
    queue: u32,
    start: u64,
    messages: Vec<ReceivedMessage>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broker living in the current process, shared by cloning.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                next_member: AtomicU64::new(0),
                producers_created: AtomicUsize::new(0),
                consumers_created: AtomicUsize::new(0),
                starts: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                suspend_delay_ms: AtomicU64::new(1000),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Make `fault` fail with `message` until cleared.
    pub fn inject(&self, fault: Fault, message: impl Into<String>) {
        lock(&self.state.faults).insert(fault, message.into());
    }

    pub fn clear(&self, fault: Fault) {
        lock(&self.state.faults).remove(&fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.state.faults).clear();
    }

    fn fault(&self, fault: Fault) -> Option<String> {
        lock(&self.state.faults).get(&fault).cloned()
    }

    /// Delay before a suspended batch is offered again (default 1s).
    pub fn set_suspend_delay(&self, delay: Duration) {
        self.state
            .suspend_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    fn suspend_delay(&self) -> Duration {
        Duration::from_millis(self.state.suspend_delay_ms.load(Ordering::Relaxed))
    }

    /// Every message accepted so far, in acceptance order.
    pub fn sent(&self) -> Vec<WireMessage> {
        lock(&self.state.sent).clone()
    }

    /// Number of queues of `topic`, if it exists.
    pub fn queue_count(&self, topic: &str) -> Option<usize> {
        lock(&self.state.topics).get(topic).map(Vec::len)
    }

    pub fn producers_created(&self) -> usize {
        self.state.producers_created.load(Ordering::SeqCst)
    }

    pub fn consumers_created(&self) -> usize {
        self.state.consumers_created.load(Ordering::SeqCst)
    }

    /// Successful `start` calls across all connections.
    pub fn starts(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    /// Sever every live connection; they report disconnected from now on.
    pub fn drop_connections(&self) {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "Dropped all in-memory connections");
        self.state.arrivals.notify_waiters();
    }

    fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::SeqCst)
    }

    fn append(
        &self,
        message: WireMessage,
        selector: &QueueSelector,
        default_queues: u32,
    ) -> SendReceipt {
        let receipt = {
            let mut topics = lock(&self.state.topics);
            let queues = topics
                .entry(message.topic.clone())
                .or_insert_with(|| vec![Vec::new(); default_queues.max(1) as usize]);

            let queue_id = selector.select(message.sharding_key(), queues.len() as u32);
            let queue = &mut queues[queue_id as usize];
            let receipt = SendReceipt {
                msg_id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
                topic: message.topic.clone(),
                queue_id,
                queue_offset: queue.len() as u64,
            };

            queue.push(ReceivedMessage {
                message: message.clone(),
                msg_id: receipt.msg_id.clone(),
                queue_id,
                queue_offset: receipt.queue_offset,
                born_timestamp: chrono::Utc::now().timestamp_millis(),
                reconsume_times: 0,
            });
            receipt
        };

        lock(&self.state.sent).push(message);
        self.state.arrivals.notify_waiters();
        receipt
    }

    fn join_group(&self, topic: &str, group: &str) -> u64 {
        let member = self.state.next_member.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.groups)
            .entry((topic.to_string(), group.to_string()))
            .or_default()
            .members
            .insert(member);
        member
    }

    fn leave_group(&self, topic: &str, group: &str, member: u64) {
        if let Some(state) = lock(&self.state.groups).get_mut(&(topic.to_string(), group.to_string()))
        {
            state.members.remove(&member);
        }
    }

    /// Take the next pending batch from a queue allocated to `member`.
    fn claim(&self, topic: &str, group: &str, member: u64, batch_size: usize) -> Option<Claim> {
        let mut groups = lock(&self.state.groups);
        let topics = lock(&self.state.topics);

        let state = groups.get_mut(&(topic.to_string(), group.to_string()))?;
        let queues = topics.get(topic)?;
        let index = state.members.iter().position(|m| *m == member)?;
        let members = state.members.len();

        for (queue_id, queue) in queues.iter().enumerate() {
            let queue_id = queue_id as u32;
            if queue_id as usize % members != index || state.in_flight.contains(&queue_id) {
                continue;
            }

            let start = state.offsets.get(&queue_id).copied().unwrap_or(0);
            if start as usize >= queue.len() {
                continue;
            }

            let end = (start as usize + batch_size.max(1)).min(queue.len());
            let messages = queue[start as usize..end]
                .iter()
                .cloned()
                .map(|mut message| {
                    message.reconsume_times = state
                        .reconsume
                        .get(&(queue_id, message.queue_offset))
                        .copied()
                        .unwrap_or(0);
                    message
                })
                .collect();

            state.in_flight.insert(queue_id);
            return Some(Claim {
                queue: queue_id,
                start,
                messages,
            });
        }

        None
    }

    fn settle(&self, topic: &str, group: &str, claim: &Claim, outcome: ConsumeOutcome) {
        let mut groups = lock(&self.state.groups);
        let Some(state) = groups.get_mut(&(topic.to_string(), group.to_string())) else {
            return;
        };

        state.in_flight.remove(&claim.queue);
        match outcome {
            ConsumeOutcome::Success => {
                state
                    .offsets
                    .insert(claim.queue, claim.start + claim.messages.len() as u64);
                for message in &claim.messages {
                    state.reconsume.remove(&(claim.queue, message.queue_offset));
                }
            }
            ConsumeOutcome::SuspendQueue => {
                for message in &claim.messages {
                    *state
                        .reconsume
                        .entry((claim.queue, message.queue_offset))
                        .or_insert(0) += 1;
                }
            }
        }
    }
}

impl Connector for InMemoryBroker {
    fn connect_producer(
        &self,
        name_servers: &[String],
        options: &ProducerOptions,
    ) -> Result<Arc<dyn ProducerConnection>, MqError> {
        if let Some(message) = self.fault(Fault::Connect) {
            return Err(MqError::connect(Role::Producer, message));
        }
        if name_servers.is_empty() {
            return Err(MqError::connect(Role::Producer, "no name servers"));
        }

        self.state.producers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryProducer {
            broker: self.clone(),
            options: options.clone(),
            selector: QueueSelector::default(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn connect_consumer(
        &self,
        name_servers: &[String],
        options: &PushConsumerOptions,
    ) -> Result<Arc<dyn ConsumerConnection>, MqError> {
        if let Some(message) = self.fault(Fault::Connect) {
            return Err(MqError::connect(Role::Consumer, message));
        }
        if name_servers.is_empty() {
            return Err(MqError::connect(Role::Consumer, "no name servers"));
        }

        self.state.consumers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConsumer {
            shared: Arc::new(ConsumerShared {
                broker: self.clone(),
                options: options.clone(),
                state: Mutex::new(ConsumerState::default()),
            }),
        }))
    }
}

struct MemoryProducer {
    broker: InMemoryBroker,
    options: ProducerOptions,
    selector: QueueSelector,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MemoryProducer {
    fn ready(&self, topic: &str) -> Result<(), MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::send(topic, "producer was shut down"));
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(MqError::send(topic, "producer is not started"));
        }
        if let Some(message) = self.broker.fault(Fault::Send) {
            return Err(MqError::send(topic, message));
        }
        Ok(())
    }
}

#[async_trait]
impl ProducerConnection for MemoryProducer {
    async fn start(&self) -> Result<(), MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::start(Role::Producer, "producer was shut down"));
        }
        if let Some(message) = self.broker.fault(Fault::Start) {
            return Err(MqError::start(Role::Producer, message));
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            self.broker.state.starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn send_sync(&self, message: WireMessage) -> Result<SendReceipt, MqError> {
        self.ready(&message.topic)?;
        Ok(self
            .broker
            .append(message, &self.selector, self.options.topic_queue_nums))
    }

    async fn send_one_way(&self, message: WireMessage) -> Result<(), MqError> {
        self.ready(&message.topic)?;
        self.broker
            .append(message, &self.selector, self.options.topic_queue_nums);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MqError> {
        self.closed.store(true, Ordering::SeqCst);
        self.broker.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        match self.broker.fault(Fault::Shutdown) {
            Some(message) => Err(MqError::shutdown(Role::Producer, message)),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct ConsumerState {
    started: bool,
    closed: bool,
    generation: u64,
    next_epoch: u64,
    subscriptions: HashMap<String, (u64, Arc<dyn BatchListener>)>,
}

struct ConsumerShared {
    broker: InMemoryBroker,
    options: PushConsumerOptions,
    state: Mutex<ConsumerState>,
}

impl ConsumerShared {
    fn alive(&self, state: &ConsumerState) -> bool {
        state.started && !state.closed && state.generation == self.broker.generation()
    }

    /// Whether the delivery task for `topic` started at `epoch` should keep running.
    fn is_current(&self, topic: &str, epoch: u64) -> bool {
        let state = lock(&self.state);
        self.alive(&state)
            && state
                .subscriptions
                .get(topic)
                .is_some_and(|(current, _)| *current == epoch)
    }

    fn spawn_delivery(self: &Arc<Self>, topic: String, epoch: u64, listener: Arc<dyn BatchListener>) {
        let shared = self.clone();
        tokio::spawn(async move {
            shared.deliver(topic, epoch, listener).await;
        });
    }

    async fn deliver(&self, topic: String, epoch: u64, listener: Arc<dyn BatchListener>) {
        let group = self.options.group.clone();
        let member = self.broker.join_group(&topic, &group);
        debug!(topic = %topic, group = %group, member, "In-memory delivery started");

        while self.is_current(&topic, epoch) {
            let arrived = self.broker.state.arrivals.notified();

            match self
                .broker
                .claim(&topic, &group, member, self.options.batch_size)
            {
                Some(claim) => {
                    let outcome = listener.on_batch(claim.messages.clone()).await;
                    self.broker.settle(&topic, &group, &claim, outcome);
                    if outcome == ConsumeOutcome::SuspendQueue {
                        tokio::time::sleep(self.broker.suspend_delay()).await;
                    }
                }
                None => {
                    let _ = tokio::time::timeout(IDLE_POLL, arrived).await;
                }
            }
        }

        self.broker.leave_group(&topic, &group, member);
        debug!(topic = %topic, group = %group, member, "In-memory delivery stopped");
    }
}

struct MemoryConsumer {
    shared: Arc<ConsumerShared>,
}

#[async_trait]
impl ConsumerConnection for MemoryConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn BatchListener>,
    ) -> Result<(), MqError> {
        if let Some(message) = self.shared.broker.fault(Fault::Subscribe) {
            return Err(MqError::subscribe(topic, message));
        }

        let mut state = lock(&self.shared.state);
        if state.closed {
            return Err(MqError::subscribe(topic, "consumer was shut down"));
        }

        state.next_epoch += 1;
        let epoch = state.next_epoch;
        state
            .subscriptions
            .insert(topic.to_string(), (epoch, listener.clone()));

        if self.shared.alive(&state) {
            drop(state);
            self.shared.spawn_delivery(topic.to_string(), epoch, listener);
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqError> {
        lock(&self.shared.state).subscriptions.remove(topic);
        Ok(())
    }

    async fn start(&self) -> Result<(), MqError> {
        let broker = &self.shared.broker;
        let mut state = lock(&self.shared.state);

        if state.closed {
            return Err(MqError::start(Role::Consumer, "consumer was shut down"));
        }
        if state.started {
            if self.shared.alive(&state) {
                return Ok(());
            }
            return Err(MqError::start(Role::Consumer, "connection to broker was lost"));
        }
        if let Some(message) = broker.fault(Fault::Start) {
            return Err(MqError::start(Role::Consumer, message));
        }

        state.started = true;
        state.generation = broker.generation();
        broker.state.starts.fetch_add(1, Ordering::SeqCst);

        let subscriptions: Vec<_> = state
            .subscriptions
            .iter()
            .map(|(topic, (epoch, listener))| (topic.clone(), *epoch, listener.clone()))
            .collect();
        drop(state);

        for (topic, epoch, listener) in subscriptions {
            self.shared.spawn_delivery(topic, epoch, listener);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), MqError> {
        {
            let mut state = lock(&self.shared.state);
            state.closed = true;
            state.subscriptions.clear();
        }
        let broker = &self.shared.broker;
        broker.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        broker.state.arrivals.notify_waiters();

        match broker.fault(Fault::Shutdown) {
            Some(message) => {
                warn!(group = %self.shared.options.group, "In-memory consumer shutdown fault");
                Err(MqError::shutdown(Role::Consumer, message))
            }
            None => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        let state = lock(&self.shared.state);
        self.shared.alive(&state)
    }
}
