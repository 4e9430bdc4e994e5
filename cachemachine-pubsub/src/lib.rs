//! cache-machine Pub/Sub - Message Bus Abstraction
//!
//! Traits for the topic/subscription transport the roles talk over, and an
//! in-process implementation for tests and single-process deployments.

pub mod bus;
pub mod memory;

pub use bus::{BusMessage, BusSubscription, BusTopic, MessageBus};
pub use memory::{InMemoryBus, MemoryTopic};
