//! Message bus collaborator traits.
//!
//! The transport is a topic/subscription bus with at-least-once delivery and
//! queue semantics per subscription name: every subscription name receives
//! each message published after it was created, and consumers sharing a name
//! compete for messages.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cachemachine_core::TransportError;

/// A delivered message.
#[derive(Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub id: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusMessage")
            .field("id", &self.id)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Entry point to a bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Get a topic, creating it if it does not exist.
    async fn topic(&self, name: &str) -> Result<Arc<dyn BusTopic>, TransportError>;
}

#[async_trait]
pub trait BusTopic: Send + Sync {
    fn name(&self) -> &str;

    /// Publish bytes; returns the bus-assigned message id.
    async fn publish(&self, data: Vec<u8>) -> Result<String, TransportError>;

    /// Create or attach to a named subscription.
    async fn subscribe(&self, subscription: &str) -> Result<Box<dyn BusSubscription>, TransportError>;
}

#[async_trait]
pub trait BusSubscription: Send {
    fn name(&self) -> &str;

    /// Next message, or `None` once the subscription is closed.
    async fn next_message(&mut self) -> Option<BusMessage>;

    async fn ack(&mut self, message: &BusMessage) -> Result<(), TransportError>;
}
