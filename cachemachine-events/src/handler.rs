//! Event handler trait and adapters.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use cachemachine_core::{ChangeRecord, EventKey, HandlerError, MethodName, ModelId};
use serde::Serialize;
use serde_json::Value;

/// A change delivered to the application's event handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEvent {
    pub name: EventKey,
    pub model_id: ModelId,
    pub data: Option<Value>,
}

impl ModelEvent {
    pub fn model_name(&self) -> &str {
        &self.name.model_name
    }

    pub fn method(&self) -> MethodName {
        self.name.method
    }
}

impl From<&ChangeRecord> for ModelEvent {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            name: record.event_key(),
            model_id: record.resolved_id(),
            data: record.data.clone(),
        }
    }
}

/// Application callback for watched model events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ModelEvent) -> Result<(), HandlerError>;
}

/// Sink for handler failures.
pub type ErrorHandler = Arc<dyn Fn(HandlerError) + Send + Sync>;

/// [`EventHandler`] backed by an async closure. Built with [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure taking an owned [`ModelEvent`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(ModelEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(ModelEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &ModelEvent) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}
