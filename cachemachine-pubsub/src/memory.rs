//! In-process bus.
//!
//! Each subscription name owns an unbounded queue. Messages published before
//! a subscription exists are not delivered to it. Consumers attached to the
//! same name share one receiver.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cachemachine_core::TransportError;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::bus::{BusMessage, BusSubscription, BusTopic, MessageBus};

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<BusMessage>>>;

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_publishes: AtomicBool,
}

struct Queue {
    tx: mpsc::UnboundedSender<BusMessage>,
    rx: SharedReceiver,
}

/// A [`MessageBus`] living in one process.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    topics: Arc<DashMap<String, Arc<MemoryTopic>>>,
    faults: Arc<Faults>,
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("topics", &self.topic_names())
            .finish()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `topic()` fail with [`TransportError::TopicUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every publish fail with [`TransportError::PublishFailed`].
    pub fn set_fail_publishes(&self, fail: bool) {
        self.faults.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Every payload published on `topic`, in order.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topics
            .get(topic)
            .map(|t| t.history().into_iter().map(|m| m.data).collect())
            .unwrap_or_default()
    }

    /// Subscription names attached to `topic`, sorted.
    pub fn subscriptions(&self, topic: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .topics
            .get(topic)
            .map(|t| t.queues.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Number of messages acknowledged on `topic`.
    pub fn acked(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |t| t.acked.load(Ordering::SeqCst))
    }

    /// Drop a subscription's queue. Its consumers drain what is buffered and
    /// then see the end of the stream.
    pub fn close_subscription(&self, topic: &str, subscription: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.queues.remove(subscription).is_some())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn topic(&self, name: &str) -> Result<Arc<dyn BusTopic>, TransportError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::TopicUnavailable {
                topic: name.to_string(),
                reason: "bus unavailable".to_string(),
            });
        }
        let topic = self
            .topics
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %name, "Created topic");
                Arc::new(MemoryTopic::new(name, self.faults.clone()))
            })
            .clone();
        Ok(topic)
    }
}

/// Topic of an [`InMemoryBus`].
pub struct MemoryTopic {
    name: String,
    queues: DashMap<String, Queue>,
    history: Mutex<Vec<BusMessage>>,
    acked: Arc<AtomicUsize>,
    faults: Arc<Faults>,
}

impl MemoryTopic {
    fn new(name: &str, faults: Arc<Faults>) -> Self {
        Self {
            name: name.to_string(),
            queues: DashMap::new(),
            history: Mutex::new(Vec::new()),
            acked: Arc::new(AtomicUsize::new(0)),
            faults,
        }
    }

    fn history(&self) -> Vec<BusMessage> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BusTopic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<String, TransportError> {
        if self.faults.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                topic: self.name.clone(),
                reason: "publish rejected".to_string(),
            });
        }
        let message = BusMessage {
            id: Uuid::now_v7().to_string(),
            data,
        };
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());

        let mut delivered = 0;
        for queue in self.queues.iter() {
            if queue.tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!(topic = %self.name, message_id = %message.id, delivered, "Published message");
        Ok(message.id)
    }

    async fn subscribe(&self, subscription: &str) -> Result<Box<dyn BusSubscription>, TransportError> {
        let rx = self
            .queues
            .entry(subscription.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                Queue {
                    tx,
                    rx: Arc::new(AsyncMutex::new(rx)),
                }
            })
            .rx
            .clone();
        debug!(topic = %self.name, subscription = %subscription, "Attached subscription");
        Ok(Box::new(MemorySubscription {
            name: subscription.to_string(),
            rx,
            acked: self.acked.clone(),
        }))
    }
}

struct MemorySubscription {
    name: String,
    rx: SharedReceiver,
    acked: Arc<AtomicUsize>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_message(&mut self) -> Option<BusMessage> {
        self.rx.lock().await.recv().await
    }

    async fn ack(&mut self, _message: &BusMessage) -> Result<(), TransportError> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
