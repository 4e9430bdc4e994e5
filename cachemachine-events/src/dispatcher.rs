//! Event dispatcher.
//!
//! Delivers records whose `Model.method` key is on the event watch list to
//! the application's handler. Delivery is sequential and in batch order; a
//! handler failure is routed to the error handler (or logged) and never
//! stops the batch.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use cachemachine_core::{ChangeRecord, ConfigError, EventKey, HandlerError};
use tracing::{debug, error};

use crate::handler::{ErrorHandler, EventHandler, ModelEvent};

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Key not watched.
    Ignored,
    Delivered,
    Failed(HandlerError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub ignored: usize,
}

/// Routes watched model events to an [`EventHandler`].
#[derive(Clone, Default)]
pub struct EventDispatcher {
    watched: BTreeSet<EventKey>,
    handler: Option<Arc<dyn EventHandler>>,
    on_error: Option<ErrorHandler>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("watched", &self.watched)
            .field("has_handler", &self.handler.is_some())
            .field("has_error_handler", &self.on_error.is_some())
            .finish()
    }
}

impl EventDispatcher {
    /// A non-empty watch list requires a handler.
    pub fn new<I>(
        watched: I,
        handler: Option<Arc<dyn EventHandler>>,
        on_error: Option<ErrorHandler>,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = EventKey>,
    {
        let watched: BTreeSet<EventKey> = watched.into_iter().collect();
        if !watched.is_empty() && handler.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "eventHandler".to_string(),
            });
        }
        Ok(Self {
            watched,
            handler,
            on_error,
        })
    }

    /// Dispatcher that watches nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.watched.is_empty()
    }

    pub fn watches(&self, key: &EventKey) -> bool {
        self.watched.contains(key)
    }

    pub fn watched(&self) -> impl Iterator<Item = &EventKey> {
        self.watched.iter()
    }

    /// Deliver one record if its key is watched.
    pub async fn dispatch(&self, record: &ChangeRecord) -> DispatchOutcome {
        let key = record.event_key();
        let Some(handler) = self.handler.as_ref().filter(|_| self.watched.contains(&key)) else {
            return DispatchOutcome::Ignored;
        };

        let event = ModelEvent::from(record);
        match handler.handle(&event).await {
            Ok(()) => {
                debug!(event = %key, model_id = %event.model_id, "Delivered model event");
                DispatchOutcome::Delivered
            }
            Err(err) => {
                self.report(err.clone());
                DispatchOutcome::Failed(err)
            }
        }
    }

    /// Deliver every watched record, awaiting each in order.
    pub async fn dispatch_all(&self, records: &[ChangeRecord]) -> DispatchReport {
        let mut report = DispatchReport::default();
        if !self.is_enabled() {
            report.ignored = records.len();
            return report;
        }
        for record in records {
            match self.dispatch(record).await {
                DispatchOutcome::Ignored => report.ignored += 1,
                DispatchOutcome::Delivered => report.delivered += 1,
                DispatchOutcome::Failed(_) => report.failed += 1,
            }
        }
        report
    }

    fn report(&self, err: HandlerError) {
        match &self.on_error {
            Some(on_error) => on_error(err),
            None => error!(error = %err, "Event handler failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde_json::json;
    use std::sync::Mutex;

    fn key(s: &str) -> EventKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_watch_list_without_handler_is_config_error() {
        let err = EventDispatcher::new([key("Order.update")], None, None).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRequired {
                field: "eventHandler".to_string()
            }
        );
        assert!(EventDispatcher::new(Vec::new(), None, None).is_ok());
    }

    #[tokio::test]
    async fn test_only_watched_keys_delivered_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |event: ModelEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.name.to_string());
                Ok::<(), HandlerError>(())
            }
        });
        let dispatcher = EventDispatcher::new(
            [key("Order.update"), key("Order.delete")],
            Some(Arc::new(handler)),
            None,
        )
        .unwrap();

        let report = dispatcher
            .dispatch_all(&[
                ChangeRecord::update("Order", 1, json!({"id": 1})),
                ChangeRecord::create("Order", 2, json!({"id": 2})),
                ChangeRecord::delete("Order", 1),
                ChangeRecord::update("Customer", 1, json!({"id": 1})),
            ])
            .await;

        assert_eq!(
            report,
            DispatchReport {
                delivered: 2,
                failed: 0,
                ignored: 2
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec!["Order.update", "Order.delete"]);
    }

    #[tokio::test]
    async fn test_failures_routed_to_error_handler_and_batch_continues() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let on_error: ErrorHandler = Arc::new(move |err: HandlerError| sink.lock().unwrap().push(err));
        let handler = handler_fn(|event: ModelEvent| async move {
            match event.model_id.as_number() {
                Some(1) => Err(HandlerError::failed(event.name.to_string(), "rejected")),
                _ => Ok(()),
            }
        });
        let dispatcher =
            EventDispatcher::new([key("Order.update")], Some(Arc::new(handler)), Some(on_error))
                .unwrap();

        let report = dispatcher
            .dispatch_all(&[
                ChangeRecord::update("Order", 1, json!({"id": 1})),
                ChangeRecord::update("Order", 2, json!({"id": 2})),
            ])
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![HandlerError::failed("Order.update", "rejected")]
        );
    }

    #[tokio::test]
    async fn test_disabled_dispatcher_ignores_everything() {
        let dispatcher = EventDispatcher::disabled();
        assert!(!dispatcher.is_enabled());
        let outcome = dispatcher
            .dispatch(&ChangeRecord::delete("Order", 1))
            .await;
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }
}
