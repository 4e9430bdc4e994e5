//! cache-machine - Pub/Sub Replicated Local Caches
//!
//! A server publishes every mutation of the models it serves; clients keep
//! an in-memory replica of the models they watch, prime it on start through
//! a request/response handshake and react to watched model events. A local
//! role does both in one process without a bus.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cachemachine::{CacheMachine, CacheOptions, Collaborators};
//! use cachemachine_core::{CacheSettings, Role, WatchSpec};
//! use cachemachine_pubsub::InMemoryBus;
//!
//! # async fn run() -> cachemachine_core::CacheResult<()> {
//! let settings = CacheSettings::new(Role::Client, "billing", "prod")
//!     .with_watch(WatchSpec::cache("Customer"));
//! let machine = CacheMachine::start(
//!     CacheOptions::new(settings),
//!     Collaborators::new().with_bus(Arc::new(InMemoryBus::new())),
//! )
//! .await?;
//! let customers = machine.store().records("Customer");
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod hooks;
mod listeners;
pub mod options;
pub mod priming;
pub mod publisher;
pub mod registry;
pub mod telemetry;

pub use coordinator::{CacheMachine, Collaborators};
pub use hooks::ModelHooks;
pub use options::{
    CacheOptions, ChangeContext, FilterContext, PublishFilter, Readiness, ReadyCallback,
};
pub use priming::{
    resolve_prime_records, PrimeRequester, PrimeResolution, PrimeResponder, PrimingHandshake,
    PrimingState,
};
pub use publisher::{BusSink, ChangePublisher, LocalSink, PublishOutcome, RecordSink};
pub use registry::CacheRegistry;
pub use telemetry::{init_logging, LogConfig, LogFormat};
