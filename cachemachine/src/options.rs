//! Typed process options.
//!
//! [`CacheOptions`] pairs loadable [`CacheSettings`] with the parts that can
//! only be supplied in code: publish filters, the readiness callback and the
//! event handlers.

use std::fmt;
use std::sync::Arc;

use cachemachine_core::{CacheResult, CacheSettings, ConfigError, MethodName};
use cachemachine_events::{ErrorHandler, EventDispatcher, EventHandler};
use cachemachine_storage::{Deletion, Mutation, Snapshot};
use serde_json::Value;

/// What triggered a publish decision.
#[derive(Debug, Clone, Copy)]
pub enum ChangeContext<'a> {
    Mutation(&'a Mutation),
    Deletion(&'a Deletion),
}

/// Input to a [`PublishFilter`].
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub model_name: &'a str,
    pub method: MethodName,
    pub instance: &'a Value,
    pub change: ChangeContext<'a>,
}

/// Predicate deciding whether a mutation is propagated. Returning `false`
/// suppresses publication; the mutation itself still happens.
pub trait PublishFilter: Send + Sync {
    fn allow(&self, ctx: &FilterContext<'_>) -> bool;
}

impl<F> PublishFilter for F
where
    F: Fn(&FilterContext<'_>) -> bool + Send + Sync,
{
    fn allow(&self, ctx: &FilterContext<'_>) -> bool {
        self(ctx)
    }
}

/// Signalled when a role becomes usable.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// Server is listening for priming requests.
    Serving,
    /// Replica primed; carries a snapshot of the store at that moment.
    Primed(Snapshot),
}

pub type ReadyCallback = Arc<dyn Fn(CacheResult<Readiness>) + Send + Sync>;

/// Everything needed to start a cache machine.
#[derive(Clone)]
pub struct CacheOptions {
    pub settings: CacheSettings,
    pub filters: Vec<Arc<dyn PublishFilter>>,
    pub on_ready: Option<ReadyCallback>,
    pub event_handler: Option<Arc<dyn EventHandler>>,
    pub event_error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("settings", &self.settings)
            .field("filters", &self.filters.len())
            .field("on_ready", &self.on_ready.is_some())
            .field("event_handler", &self.event_handler.is_some())
            .field("event_error_handler", &self.event_error_handler.is_some())
            .finish()
    }
}

impl CacheOptions {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            filters: Vec::new(),
            on_ready: None,
            event_handler: None,
            event_error_handler: None,
        }
    }

    pub fn with_filter(mut self, filter: impl PublishFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: Fn(CacheResult<Readiness>) + Send + Sync + 'static,
    {
        self.on_ready = Some(Arc::new(callback));
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_event_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(cachemachine_core::HandlerError) + Send + Sync + 'static,
    {
        self.event_error_handler = Some(Arc::new(handler));
        self
    }

    /// Build the dispatcher for the configured event watch list.
    pub fn event_dispatcher(&self) -> Result<EventDispatcher, ConfigError> {
        EventDispatcher::new(
            self.settings.event_keys()?,
            self.event_handler.clone(),
            self.event_error_handler.clone(),
        )
    }

    pub(crate) fn signal_ready(&self, outcome: CacheResult<Readiness>) {
        if let Some(on_ready) = &self.on_ready {
            on_ready(outcome);
        }
    }
}
