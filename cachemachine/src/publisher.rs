//! Change publisher.
//!
//! Turns mutations observed at the system of record into change records,
//! runs them through the filter chain and hands them to a [`RecordSink`].
//! Publish failures are logged and never retried; the mutation that caused
//! them is never blocked.

use std::sync::Arc;

use async_trait::async_trait;
use cachemachine_core::{
    encode_batch, CacheResult, ChangeRecord, MethodName, ModelId, Naming,
};
use cachemachine_events::EventDispatcher;
use cachemachine_pubsub::MessageBus;
use cachemachine_storage::{
    apply, Deletion, FindQuery, LocalStore, Mutation, MutationHook, MutationTarget,
    SystemOfRecord,
};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::options::{ChangeContext, FilterContext, PublishFilter};

// ============================================================================
// SINKS
// ============================================================================

/// Destination of published records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Deliver one batch on a logical channel.
    async fn emit(&self, records: Vec<ChangeRecord>, channel: &str) -> CacheResult<()>;
}

/// Publishes batches as JSON arrays on `<channel>__<env>` topics.
pub struct BusSink {
    bus: Arc<dyn MessageBus>,
    naming: Naming,
}

impl BusSink {
    pub fn new(bus: Arc<dyn MessageBus>, naming: Naming) -> Self {
        Self { bus, naming }
    }
}

#[async_trait]
impl RecordSink for BusSink {
    async fn emit(&self, records: Vec<ChangeRecord>, channel: &str) -> CacheResult<()> {
        let topic_name = self.naming.topic_name(channel);
        let payload = encode_batch(&records)?;
        let topic = self.bus.topic(&topic_name).await?;
        let message_id = topic.publish(payload).await?;
        trace!(
            topic = %topic_name,
            message_id = %message_id,
            records = records.len(),
            "Published change batch"
        );
        Ok(())
    }
}

/// Applies records straight into an in-process store (the local role).
pub struct LocalSink {
    store: Arc<LocalStore>,
    dispatcher: Arc<EventDispatcher>,
}

impl LocalSink {
    pub fn new(store: Arc<LocalStore>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self { store, dispatcher }
    }
}

#[async_trait]
impl RecordSink for LocalSink {
    async fn emit(&self, records: Vec<ChangeRecord>, _channel: &str) -> CacheResult<()> {
        for record in &records {
            apply(&self.store, record);
        }
        self.dispatcher.dispatch_all(&records).await;
        Ok(())
    }
}

// ============================================================================
// PUBLISHER
// ============================================================================

/// Result of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Records were handed to the sink; `failed` of them were lost.
    Published { emitted: usize, failed: usize },
    /// A filter rejected the change.
    Suppressed,
    /// No payload, no resolvable id, or no matching rows.
    NothingToPublish,
    /// The system of record could not resolve the deletion.
    SourceFailed,
}

/// Filters and publishes observed mutations.
pub struct ChangePublisher {
    naming: Naming,
    filters: Vec<Arc<dyn PublishFilter>>,
    sink: Arc<dyn RecordSink>,
    source: Arc<dyn SystemOfRecord>,
}

impl ChangePublisher {
    pub fn new(
        naming: Naming,
        filters: Vec<Arc<dyn PublishFilter>>,
        sink: Arc<dyn RecordSink>,
        source: Arc<dyn SystemOfRecord>,
    ) -> Self {
        Self {
            naming,
            filters,
            sink,
            source,
        }
    }

    /// Logical AND over the filter chain. An empty chain allows everything.
    pub fn allows(&self, ctx: &FilterContext<'_>) -> bool {
        self.filters.iter().all(|filter| filter.allow(ctx))
    }

    /// Publish a create or update.
    ///
    /// A set-valued id filter fans out to one record per numeric id; other
    /// ids in the set are skipped. Each record travels in its own message.
    pub async fn publish_mutation(&self, mutation: &Mutation) -> PublishOutcome {
        let Some(payload) = mutation.payload() else {
            return PublishOutcome::NothingToPublish;
        };
        let ids = match mutation.target() {
            MutationTarget::Single(id) => vec![id],
            MutationTarget::Set(candidates) => candidates
                .iter()
                .filter_map(Value::as_i64)
                .map(ModelId::Number)
                .collect(),
            MutationTarget::Unknown => Vec::new(),
        };
        if ids.is_empty() {
            debug!(model_name = %mutation.model_name, "Mutation has no publishable id");
            return PublishOutcome::NothingToPublish;
        }

        let method = if mutation.is_new_instance {
            MethodName::Create
        } else {
            MethodName::Update
        };
        let ctx = FilterContext {
            model_name: &mutation.model_name,
            method,
            instance: payload,
            change: ChangeContext::Mutation(mutation),
        };
        if !self.allows(&ctx) {
            debug!(model_name = %mutation.model_name, method = %method, "Publication suppressed by filter");
            return PublishOutcome::Suppressed;
        }

        let records = ids.into_iter().map(|model_id| ChangeRecord {
            model_name: mutation.model_name.clone(),
            method_name: method,
            model_id,
            data: Some(payload.clone()),
            version: mutation.version,
        });
        self.send_each(records).await
    }

    /// Publish deletes for every row the deletion will remove.
    ///
    /// Rows are resolved before they disappear and filtered one by one.
    pub async fn publish_deletion(&self, deletion: &Deletion) -> PublishOutcome {
        let mut query = FindQuery::all();
        query.where_filter = deletion.where_filter.clone();
        let rows = match self.source.find(&deletion.model_name, &query).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    error = %err,
                    model_name = %deletion.model_name,
                    "Could not resolve records for deletion"
                );
                return PublishOutcome::SourceFailed;
            }
        };

        let mut suppressed = 0;
        let mut records = Vec::new();
        for row in &rows {
            let Some(model_id) = ModelId::from_payload(row) else {
                continue;
            };
            let ctx = FilterContext {
                model_name: &deletion.model_name,
                method: MethodName::Delete,
                instance: row,
                change: ChangeContext::Deletion(deletion),
            };
            if self.allows(&ctx) {
                records.push(ChangeRecord::delete(deletion.model_name.clone(), model_id));
            } else {
                suppressed += 1;
            }
        }

        if records.is_empty() {
            return if suppressed > 0 {
                PublishOutcome::Suppressed
            } else {
                PublishOutcome::NothingToPublish
            };
        }
        self.send_each(records).await
    }

    /// Out-of-band publication of arbitrary records on a logical channel.
    pub async fn emit(&self, records: Vec<ChangeRecord>, channel: &str) -> CacheResult<()> {
        let count = records.len();
        self.sink.emit(records, channel).await.inspect_err(|err| {
            warn!(error = %err, channel = %channel, records = count, "Manual emit failed");
        })
    }

    async fn send_each<I>(&self, records: I) -> PublishOutcome
    where
        I: IntoIterator<Item = ChangeRecord>,
    {
        let mut emitted = 0;
        let mut failed = 0;
        for record in records {
            let channel = self
                .naming
                .change_channel(&record.model_name, record.method_name);
            let model_name = record.model_name.clone();
            let model_id = record.model_id.clone();
            match self.sink.emit(vec![record], &channel).await {
                Ok(()) => emitted += 1,
                Err(err) => {
                    failed += 1;
                    warn!(
                        error = %err,
                        channel = %channel,
                        model_name = %model_name,
                        model_id = %model_id,
                        "Failed to publish change"
                    );
                }
            }
        }
        PublishOutcome::Published { emitted, failed }
    }
}

#[async_trait]
impl MutationHook for ChangePublisher {
    async fn after_mutation(&self, mutation: &Mutation) {
        let outcome = self.publish_mutation(mutation).await;
        trace!(model_name = %mutation.model_name, outcome = ?outcome, "After-mutation hook");
    }

    async fn before_delete(&self, deletion: &Deletion) {
        let outcome = self.publish_deletion(deletion).await;
        trace!(model_name = %deletion.model_name, outcome = ?outcome, "Before-delete hook");
    }
}
