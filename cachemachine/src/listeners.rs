//! Subscription drain loops.
//!
//! Each loop owns one subscription and handles its messages strictly one at
//! a time: decode, apply, dispatch, ack. Every message is acked, including
//! malformed ones, so a poisoned payload is never redelivered forever.

use std::sync::Arc;

use cachemachine_core::PrimeRequest;
use cachemachine_events::EventDispatcher;
use cachemachine_pubsub::{BusMessage, BusSubscription};
use cachemachine_storage::{apply_batch, LocalStore};
use tracing::{debug, info, warn};

use crate::options::{CacheOptions, Readiness};
use crate::priming::{PrimeResponder, PrimingHandshake};

/// Live change records: apply to the store, then dispatch.
pub(crate) async fn drain_changes(
    mut subscription: Box<dyn BusSubscription>,
    store: Arc<LocalStore>,
    dispatcher: Arc<EventDispatcher>,
) {
    while let Some(message) = subscription.next_message().await {
        let batch = apply_batch(&store, &message.data);
        dispatcher.dispatch_all(&batch.records).await;
        ack(subscription.as_mut(), &message).await;
    }
    warn!(
        subscription = %subscription.name(),
        "Change subscription ended, replica no longer follows changes"
    );
}

/// Priming responses: apply, dispatch, then settle the handshake.
///
/// A response with nothing usable in it (undecodable, or every record
/// rejected) does not complete priming.
pub(crate) async fn drain_prime_responses(
    mut subscription: Box<dyn BusSubscription>,
    store: Arc<LocalStore>,
    dispatcher: Arc<EventDispatcher>,
    handshake: Arc<PrimingHandshake>,
    options: CacheOptions,
) {
    while let Some(message) = subscription.next_message().await {
        let batch = apply_batch(&store, &message.data);
        dispatcher.dispatch_all(&batch.records).await;

        let unusable = batch.records.is_empty() && batch.report.rejected > 0;
        if unusable {
            warn!(message_id = %message.id, "Ignoring unusable priming response");
        } else if handshake.complete() {
            info!(
                message_id = %message.id,
                records = batch.records.len(),
                inserted = batch.report.inserted,
                "Replica primed"
            );
            options.signal_ready(Ok(Readiness::Primed(store.snapshot())));
        } else {
            debug!(message_id = %message.id, "Applied late priming response");
        }
        ack(subscription.as_mut(), &message).await;
    }
    warn!(
        subscription = %subscription.name(),
        "Priming response subscription ended"
    );
}

/// Server side: answer each priming request in arrival order.
pub(crate) async fn serve_prime_requests(
    mut subscription: Box<dyn BusSubscription>,
    responder: Arc<PrimeResponder>,
) {
    while let Some(message) = subscription.next_message().await {
        match PrimeRequest::decode(&message.data) {
            Ok(request) => {
                if let Err(err) = responder.respond(&request).await {
                    warn!(
                        error = %err,
                        request_id = ?request.request_id,
                        response_channel = %request.response_channel,
                        "Failed to answer priming request"
                    );
                }
            }
            Err(err) => {
                warn!(error = %err, message_id = %message.id, "Dropping malformed priming request");
            }
        }
        ack(subscription.as_mut(), &message).await;
    }
    warn!(
        subscription = %subscription.name(),
        "Priming request subscription ended, no longer answering"
    );
}

async fn ack(subscription: &mut dyn BusSubscription, message: &BusMessage) {
    if let Err(err) = subscription.ack(message).await {
        warn!(
            error = %err,
            subscription = %subscription.name(),
            message_id = %message.id,
            "Ack failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachemachine_pubsub::{InMemoryBus, MessageBus};
    use std::fmt;
    use std::sync::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Collects the fields of every WARN event.
    #[derive(Clone, Default)]
    struct WarnCapture(Arc<Mutex<Vec<String>>>);

    struct FieldWriter<'a>(&'a mut String);

    impl Visit for FieldWriter<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.push_str(&format!("{}={:?} ", field.name(), value));
        }
    }

    impl<S: Subscriber> Layer<S> for WarnCapture {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                let mut line = String::new();
                event.record(&mut FieldWriter(&mut line));
                self.0.lock().unwrap().push(line);
            }
        }
    }

    #[tokio::test]
    async fn test_ended_change_subscription_is_logged_as_warning() {
        let capture = WarnCapture::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

        let bus = InMemoryBus::new();
        let topic = bus.topic("models__test").await.unwrap();
        let subscription = topic.subscribe("billing-models").await.unwrap();
        assert!(bus.close_subscription("models__test", "billing-models"));

        drain_changes(
            subscription,
            Arc::new(LocalStore::new()),
            Arc::new(EventDispatcher::disabled()),
        )
        .await;

        let warnings = capture.0.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("subscription=billing-models"));
        assert!(warnings[0].contains("Change subscription ended"));
    }
}
