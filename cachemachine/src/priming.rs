//! Priming protocol.
//!
//! Client side: a handshake state machine
//! `Idle -> AwaitingPrime -> Primed | Failed`, driven by the response
//! listener and a per-attempt deadline.
//!
//! Server side: resolve the `cache`-mode models of a [`PrimeRequest`] against
//! the system of record and answer with one batch of `prime` records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cachemachine_core::{
    encode_batch, CacheError, CacheResult, ChangeRecord, ModelId, Naming, PrimeRequest, PrimingError,
    PRIME_REQUEST_TOPIC,
};
use cachemachine_pubsub::MessageBus;
use cachemachine_storage::{FindQuery, SystemOfRecord};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hooks::ModelHooks;

// ============================================================================
// CLIENT HANDSHAKE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimingState {
    Idle,
    AwaitingPrime,
    Primed,
    Failed(PrimingError),
}

impl PrimingState {
    pub fn is_settled(&self) -> bool {
        matches!(self, PrimingState::Primed | PrimingState::Failed(_))
    }
}

/// Shared handshake state. Each `begin` starts a new attempt; a deadline
/// belonging to an older attempt cannot fail a newer one.
pub struct PrimingHandshake {
    state: watch::Sender<PrimingState>,
    attempt: AtomicU64,
}

impl Default for PrimingHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimingHandshake {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PrimingState::Idle);
        Self {
            state,
            attempt: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PrimingState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PrimingState> {
        self.state.subscribe()
    }

    /// Enter `AwaitingPrime`; returns the attempt number.
    pub fn begin(&self) -> u64 {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(PrimingState::AwaitingPrime);
        attempt
    }

    /// A prime batch was applied. Returns `true` on the transition into
    /// `Primed`; a batch arriving while already primed changes nothing.
    pub fn complete(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            PrimingState::Primed => false,
            _ => {
                *state = PrimingState::Primed;
                true
            }
        })
    }

    /// Fail `attempt` if it is still the current one and still waiting.
    pub fn fail(&self, attempt: u64, error: PrimingError) -> bool {
        if self.attempt.load(Ordering::SeqCst) != attempt {
            return false;
        }
        self.state.send_if_modified(|state| match state {
            PrimingState::AwaitingPrime => {
                *state = PrimingState::Failed(error);
                true
            }
            _ => false,
        })
    }

    /// Wait until the current attempt settles.
    pub async fn wait(&self, limit: Duration) -> Result<(), PrimingError> {
        let mut rx = self.subscribe();
        let settled = tokio::time::timeout(limit, rx.wait_for(PrimingState::is_settled)).await;
        match settled {
            Err(_) => Err(PrimingError::Timeout {
                waited_ms: millis(limit),
            }),
            Ok(Err(_)) => Err(PrimingError::Aborted),
            Ok(Ok(state)) => match &*state {
                PrimingState::Failed(err) => Err(err.clone()),
                _ => Ok(()),
            },
        }
    }

    /// Block for up to `limit`, then fail `attempt` if nothing arrived.
    /// Returns the error when this call caused the failure.
    pub async fn enforce_deadline(&self, attempt: u64, limit: Duration) -> Option<PrimingError> {
        let mut rx = self.subscribe();
        let timed_out = tokio::time::timeout(limit, rx.wait_for(|s| *s != PrimingState::AwaitingPrime))
            .await
            .is_err();
        if !timed_out {
            return None;
        }
        let error = PrimingError::Timeout {
            waited_ms: millis(limit),
        };
        self.fail(attempt, error.clone()).then_some(error)
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Publishes a client's priming request.
pub struct PrimeRequester {
    bus: Arc<dyn MessageBus>,
    topic_name: String,
    request: PrimeRequest,
}

impl PrimeRequester {
    pub fn new(bus: Arc<dyn MessageBus>, naming: &Naming, request: PrimeRequest) -> Self {
        Self {
            bus,
            topic_name: naming.topic_name(PRIME_REQUEST_TOPIC),
            request,
        }
    }

    pub fn request(&self) -> &PrimeRequest {
        &self.request
    }

    /// Publish a fresh copy of the request with a new request id.
    pub async fn send(&self) -> CacheResult<Uuid> {
        let request_id = Uuid::now_v7();
        let mut request = self.request.clone();
        request.request_id = Some(request_id);
        let topic = self.bus.topic(&self.topic_name).await?;
        topic.publish(request.encode()?).await?;
        info!(
            request_id = %request_id,
            topic = %self.topic_name,
            response_channel = %request.response_channel,
            models = request.models.len(),
            "Sent priming request"
        );
        Ok(request_id)
    }
}

// ============================================================================
// SERVER RESPONDER
// ============================================================================

/// Records resolved for a priming request, plus the queries that failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimeResolution {
    pub records: Vec<ChangeRecord>,
    pub failures: Vec<CacheError>,
}

/// Resolve the `cache`-mode models of a request, sequentially and in
/// model-name order. Unknown models are skipped with a warning; failed
/// queries are logged and collected, and contribute no records.
pub async fn resolve_prime_records(
    source: &dyn SystemOfRecord,
    request: &PrimeRequest,
) -> PrimeResolution {
    let mut resolution = PrimeResolution::default();
    for (model_name, model) in request.cached_models() {
        if !source.has_model(model_name) {
            warn!(model_name = %model_name, "Priming requested for unknown model");
            continue;
        }
        let query = FindQuery::all().with_fields(model.projection().iter().cloned());
        match source.find(model_name, &query).await {
            Ok(rows) => {
                let before = resolution.records.len();
                resolution.records.extend(rows.into_iter().filter_map(|row| {
                    ModelId::from_payload(&row)
                        .map(|id| ChangeRecord::prime(model_name.clone(), id, row))
                }));
                debug!(
                    model_name = %model_name,
                    records = resolution.records.len() - before,
                    "Resolved model for priming"
                );
            }
            Err(err) => {
                warn!(error = %err, model_name = %model_name, "Priming query failed");
                resolution.failures.push(err);
            }
        }
    }
    resolution
}

/// Answers priming requests on behalf of a server.
pub struct PrimeResponder {
    source: Arc<dyn SystemOfRecord>,
    bus: Arc<dyn MessageBus>,
    naming: Naming,
    hooks: Arc<ModelHooks>,
}

impl PrimeResponder {
    pub fn new(
        source: Arc<dyn SystemOfRecord>,
        bus: Arc<dyn MessageBus>,
        naming: Naming,
        hooks: Arc<ModelHooks>,
    ) -> Self {
        Self {
            source,
            bus,
            naming,
            hooks,
        }
    }

    /// Hook every requested model, resolve the cached ones and publish the
    /// batch (possibly empty) on the request's response channel.
    pub async fn respond(&self, request: &PrimeRequest) -> CacheResult<usize> {
        self.hooks
            .ensure_all(request.models.keys().map(String::as_str));

        let records = resolve_prime_records(self.source.as_ref(), request)
            .await
            .records;
        let topic_name = self.naming.topic_name(&request.response_channel);
        let payload = encode_batch(&records)?;
        let topic = self.bus.topic(&topic_name).await?;
        topic.publish(payload).await?;
        info!(
            request_id = ?request.request_id,
            topic = %topic_name,
            records = records.len(),
            "Answered priming request"
        );
        Ok(records.len())
    }
}
