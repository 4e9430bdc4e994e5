//! cache-machine Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - Proptest generators for change records and rows
//! - Fixtures: the two-customer system of record, role settings
//! - Recording event handler and readiness recorder
//! - Async wait helpers and custom assertions

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cachemachine_core::HandlerError;
use cachemachine_events::{EventHandler, ModelEvent};

// Re-export core types for convenience
pub use cachemachine_core::{
    CacheError, CacheResult, CacheSettings, ChangeRecord, ConfigError, MethodName, ModelId, Role,
    TopicGranularity, WatchSpec,
};
pub use cachemachine_storage::{InMemorySystemOfRecord, LocalStore};

// ============================================================================
// RECORDERS
// ============================================================================

/// Thread-safe append-only log, cheap to clone into callbacks.
#[derive(Debug)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Event handler that records every event and fails for chosen keys.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    events: Recorder<ModelEvent>,
    failing: Vec<String>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail (after recording) every event whose key is `key`, e.g. `Order.update`.
    pub fn failing_on(mut self, key: impl Into<String>) -> Self {
        self.failing.push(key.into());
        self
    }

    pub fn events(&self) -> Vec<ModelEvent> {
        self.events.items()
    }

    /// Recorded event keys in arrival order.
    pub fn keys(&self) -> Vec<String> {
        self.events
            .items()
            .iter()
            .map(|event| event.name.to_string())
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &ModelEvent) -> Result<(), HandlerError> {
        self.events.push(event.clone());
        let key = event.name.to_string();
        if self.failing.contains(&key) {
            return Err(HandlerError::failed(key, "handler configured to fail"));
        }
        Ok(())
    }
}

// ============================================================================
// WAIT HELPERS
// ============================================================================

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
pub async fn eventually<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Generous bound for in-process round trips.
pub const SETTLE: Duration = Duration::from_secs(2);

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for change records.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    pub fn arb_model_name() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("Customer".to_string()),
            Just("Order".to_string()),
            Just("Invoice".to_string()),
        ]
    }

    pub fn arb_model_id() -> impl Strategy<Value = ModelId> {
        prop_oneof![
            (1i64..50).prop_map(ModelId::Number),
            "[a-z]{1,6}".prop_map(ModelId::Text),
        ]
    }

    pub fn arb_method() -> impl Strategy<Value = MethodName> {
        prop_oneof![
            Just(MethodName::Create),
            Just(MethodName::Update),
            Just(MethodName::Delete),
            Just(MethodName::Prime),
        ]
    }

    /// A customer-shaped row carrying `id`.
    pub fn arb_row(id: ModelId) -> impl Strategy<Value = Value> {
        ("[A-Z][a-z]{1,8}", any::<bool>()).prop_map(move |(name, vip)| {
            json!({"id": id.to_value(), "name": name, "vip": vip})
        })
    }

    /// A well-formed record: payload id and `modelId` agree, `delete` has no data.
    pub fn arb_change_record() -> impl Strategy<Value = ChangeRecord> {
        (arb_model_name(), arb_method(), arb_model_id()).prop_flat_map(|(model, method, id)| {
            arb_row(id.clone()).prop_map(move |row| match method {
                MethodName::Delete => ChangeRecord::delete(model.clone(), id.clone()),
                MethodName::Create => ChangeRecord::create(model.clone(), id.clone(), row),
                MethodName::Update => ChangeRecord::update(model.clone(), id.clone(), row),
                MethodName::Prime => ChangeRecord::prime(model.clone(), id.clone(), row),
            })
        })
    }

    pub fn arb_change_batch(max: usize) -> impl Strategy<Value = Vec<ChangeRecord>> {
        prop::collection::vec(arb_change_record(), 0..max)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for the common scenarios.

    use super::*;
    use serde_json::{json, Value};

    pub const SERVER_IDENTITY: &str = "crm";
    pub const CLIENT_IDENTITY: &str = "billing";
    pub const ENVIRONMENT: &str = "test";

    pub fn ann() -> Value {
        json!({"id": 1, "name": "Ann"})
    }

    pub fn bo() -> Value {
        json!({"id": 2, "name": "Bo"})
    }

    /// System of record with `Customer` (Ann, Bo) and an empty `Order` table.
    pub fn customer_source() -> Arc<InMemorySystemOfRecord> {
        let source = InMemorySystemOfRecord::new()
            .with_model("Customer")
            .with_model("Order");
        if let Err(err) = source.seed("Customer", vec![ann(), bo()]) {
            panic!("seeding fixture failed: {err}");
        }
        Arc::new(source)
    }

    pub fn server_settings() -> CacheSettings {
        CacheSettings::new(Role::Server, SERVER_IDENTITY, ENVIRONMENT)
    }

    pub fn client_settings() -> CacheSettings {
        CacheSettings::new(Role::Client, CLIENT_IDENTITY, ENVIRONMENT)
    }

    pub fn local_settings() -> CacheSettings {
        CacheSettings::new(Role::Local, CLIENT_IDENTITY, ENVIRONMENT)
    }

    /// Store with the given models watched.
    pub fn watched_store(models: &[&str]) -> LocalStore {
        let store = LocalStore::new();
        for model in models {
            store.watch(model);
        }
        store
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertions for cache-machine results and replicas.

    use super::*;
    use serde_json::Value;

    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Config(_))),
            "Expected config error, got {:?}",
            result
        );
    }

    pub fn assert_transport_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Transport(_))),
            "Expected transport error, got {:?}",
            result
        );
    }

    /// The bucket holds exactly `expected`, compared in id order.
    pub fn assert_bucket_eq(store: &LocalStore, model_name: &str, expected: &[Value]) {
        let actual = store.records(model_name);
        assert_eq!(
            actual, expected,
            "Bucket {} does not match expected records",
            model_name
        );
    }

    pub fn assert_unwatched(store: &LocalStore, model_name: &str) {
        assert!(
            !store.is_watched(model_name),
            "Expected {} to have no bucket",
            model_name
        );
        assert!(store.records(model_name).is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_recording_handler_fails_on_configured_key() {
        let handler = RecordingHandler::new().failing_on("Order.update");
        let ok = ModelEvent::from(&ChangeRecord::create("Order", 1, serde_json::json!({"id": 1})));
        let bad = ModelEvent::from(&ChangeRecord::update("Order", 1, serde_json::json!({"id": 1})));

        assert!(handler.handle(&ok).await.is_ok());
        assert!(handler.handle(&bad).await.is_err());
        assert_eq!(handler.keys(), vec!["Order.create", "Order.update"]);
    }

    #[tokio::test]
    async fn test_eventually_gives_up() {
        assert!(eventually(Duration::from_millis(20), || true).await);
        assert!(!eventually(Duration::from_millis(20), || false).await);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_records_are_well_formed(record in generators::arb_change_record()) {
            prop_assert!(record.check().is_ok());
        }
    }
}
