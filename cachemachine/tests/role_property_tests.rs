//! Role Integration Tests
//!
//! Server, client and local roles wired over the in-memory bus and system of
//! record:
//! - priming round trip and readiness signalling
//! - live replication of create, update, delete and set-valued updates
//! - event-only models, handler error routing, publish filters
//! - priming timeout and re-priming

use std::sync::Arc;
use std::time::Duration;

use cachemachine::{
    CacheMachine, CacheOptions, Collaborators, FilterContext, PrimingState, Readiness,
};
use cachemachine_core::{
    CacheError, CacheResult, ChangeRecord, HandlerError, ModelId, PrimingError, TopicGranularity,
    WatchSpec,
};
use cachemachine_pubsub::InMemoryBus;
use cachemachine_test_utils::assertions::{
    assert_bucket_eq, assert_config_error, assert_transport_error, assert_unwatched,
};
use cachemachine_test_utils::fixtures::{
    ann, bo, client_settings, customer_source, local_settings, server_settings,
};
use cachemachine_test_utils::{eventually, InMemorySystemOfRecord, Recorder, RecordingHandler, SETTLE};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// HELPERS
// ============================================================================

async fn start_server(
    bus: &Arc<InMemoryBus>,
    source: &Arc<InMemorySystemOfRecord>,
    options: CacheOptions,
) -> Arc<CacheMachine> {
    CacheMachine::start(
        options,
        Collaborators::new()
            .with_bus(bus.clone())
            .with_system_of_record(source.clone()),
    )
    .await
    .unwrap()
}

async fn start_client(bus: &Arc<InMemoryBus>, options: CacheOptions) -> Arc<CacheMachine> {
    CacheMachine::start(options, Collaborators::new().with_bus(bus.clone()))
        .await
        .unwrap()
}

fn recorded(options: CacheOptions) -> (CacheOptions, Recorder<CacheResult<Readiness>>) {
    let ready = Recorder::new();
    let sink = ready.clone();
    (options.on_ready(move |outcome| sink.push(outcome)), ready)
}

/// Server for the two-customer fixture plus a primed `Customer` client.
async fn primed_pair(
    client_options: CacheOptions,
) -> (Arc<InMemorySystemOfRecord>, Arc<CacheMachine>, Arc<CacheMachine>) {
    let bus = Arc::new(InMemoryBus::new());
    let source = customer_source();
    let server = start_server(&bus, &source, CacheOptions::new(server_settings())).await;
    let client = start_client(&bus, client_options).await;
    client.wait_until_primed(SETTLE).await.unwrap();
    (source, server, client)
}

// ============================================================================
// PRIMING
// ============================================================================

#[tokio::test]
async fn test_priming_round_trip() {
    let bus = Arc::new(InMemoryBus::new());
    let source = customer_source();
    let _server = start_server(&bus, &source, CacheOptions::new(server_settings())).await;

    let (options, ready) =
        recorded(CacheOptions::new(client_settings().with_watch(WatchSpec::cache("Customer"))));
    let client = start_client(&bus, options).await;

    client.wait_until_primed(SETTLE).await.unwrap();
    assert_eq!(client.priming_state(), PrimingState::Primed);
    assert_bucket_eq(client.store(), "Customer", &[ann(), bo()]);

    assert!(eventually(SETTLE, || ready.len() == 1).await);
    match &ready.items()[0] {
        Ok(Readiness::Primed(snapshot)) => assert_eq!(snapshot["Customer"].len(), 2),
        other => panic!("unexpected readiness {:?}", other),
    }
}

#[tokio::test]
async fn test_priming_respects_projection() {
    let bus = Arc::new(InMemoryBus::new());
    let source = Arc::new(InMemorySystemOfRecord::new().with_model("Customer"));
    source
        .seed("Customer", vec![json!({"id": 1, "name": "Ann", "email": "ann@example.com"})])
        .unwrap();
    let _server = start_server(&bus, &source, CacheOptions::new(server_settings())).await;

    let client = start_client(
        &bus,
        CacheOptions::new(
            client_settings().with_watch(WatchSpec::cache("Customer").with_fields(["id", "name"])),
        ),
    )
    .await;
    client.wait_until_primed(SETTLE).await.unwrap();
    assert_bucket_eq(client.store(), "Customer", &[json!({"id": 1, "name": "Ann"})]);
}

#[tokio::test]
async fn test_unknown_models_still_get_a_response() {
    let bus = Arc::new(InMemoryBus::new());
    let source = customer_source();
    let _server = start_server(&bus, &source, CacheOptions::new(server_settings())).await;

    let client = start_client(
        &bus,
        CacheOptions::new(client_settings().with_watch(WatchSpec::cache("Ghost"))),
    )
    .await;
    client.wait_until_primed(SETTLE).await.unwrap();
    assert!(client.store().records("Ghost").is_empty());
    assert!(client.store().is_watched("Ghost"));
}

#[tokio::test]
async fn test_timeout_then_reprime() {
    let bus = Arc::new(InMemoryBus::new());
    let (options, ready) = recorded(CacheOptions::new(
        client_settings()
            .with_watch(WatchSpec::cache("Customer"))
            .with_prime_timeout(Duration::from_millis(300)),
    ));
    let client = start_client(&bus, options).await;

    let err = client.wait_until_primed(SETTLE).await.unwrap_err();
    assert_eq!(err, PrimingError::Timeout { waited_ms: 300 });
    assert!(eventually(SETTLE, || ready.len() == 1).await);
    assert!(matches!(
        ready.items()[0],
        Err(CacheError::Priming(PrimingError::Timeout { .. }))
    ));

    let source = customer_source();
    let _server = start_server(&bus, &source, CacheOptions::new(server_settings())).await;
    client.reprime().await.unwrap();
    client.wait_until_primed(SETTLE).await.unwrap();
    assert_bucket_eq(client.store(), "Customer", &[ann(), bo()]);
    assert!(eventually(SETTLE, || ready.len() == 2).await);
    assert!(matches!(ready.items()[1], Ok(Readiness::Primed(_))));
}

#[tokio::test]
async fn test_reprime_keeps_local_state() {
    let (_source, _server, client) = primed_pair(CacheOptions::new(
        client_settings().with_watch(WatchSpec::cache("Customer")),
    ))
    .await;

    client.reprime().await.unwrap();
    client.wait_until_primed(SETTLE).await.unwrap();
    assert_bucket_eq(client.store(), "Customer", &[ann(), bo()]);
}

// ============================================================================
// LIVE REPLICATION
// ============================================================================

#[tokio::test]
async fn test_live_create_update_delete() {
    let (source, _server, client) = primed_pair(CacheOptions::new(
        client_settings().with_watch(WatchSpec::cache("Customer")),
    ))
    .await;
    let store = client.store().clone();

    source.insert("Customer", json!({"name": "Cy"})).await.unwrap();
    assert!(eventually(SETTLE, || store.contains("Customer", &ModelId::Number(3))).await);

    source
        .update("Customer", 1, json!({"name": "Annie"}))
        .await
        .unwrap();
    assert!(
        eventually(SETTLE, || {
            store.get("Customer", &ModelId::Number(1)) == Some(json!({"id": 1, "name": "Annie"}))
        })
        .await
    );

    source.delete_by_id("Customer", 2).await.unwrap();
    assert!(eventually(SETTLE, || !store.contains("Customer", &ModelId::Number(2))).await);
}

#[tokio::test]
async fn test_set_valued_update_fans_out() {
    let (source, _server, client) = primed_pair(CacheOptions::new(
        client_settings().with_watch(WatchSpec::cache("Customer")),
    ))
    .await;
    let store = client.store().clone();

    source
        .update_where(
            "Customer",
            json!({"id": {"inq": [1, 2, "x"]}}),
            json!({"tier": "gold"}),
        )
        .await
        .unwrap();

    assert!(
        eventually(SETTLE, || {
            store
                .records("Customer")
                .iter()
                .filter(|row| row["tier"] == "gold")
                .count()
                == 2
        })
        .await
    );
}

#[tokio::test]
async fn test_per_model_method_topics() {
    let bus = Arc::new(InMemoryBus::new());
    let source = customer_source();
    let _server = start_server(
        &bus,
        &source,
        CacheOptions::new(server_settings().with_granularity(TopicGranularity::PerModelMethod)),
    )
    .await;
    let client = start_client(
        &bus,
        CacheOptions::new(
            client_settings()
                .with_granularity(TopicGranularity::PerModelMethod)
                .with_watch(WatchSpec::cache("Customer")),
        ),
    )
    .await;
    client.wait_until_primed(SETTLE).await.unwrap();

    source.insert("Customer", json!({"name": "Cy"})).await.unwrap();
    let store = client.store().clone();
    assert!(eventually(SETTLE, || store.len("Customer") == 3).await);
    assert!(!bus.published("Customer.create__test").is_empty());
    assert!(bus.published("models__test").is_empty());
}

#[tokio::test]
async fn test_server_filters_suppress_publication() {
    let bus = Arc::new(InMemoryBus::new());
    let source = customer_source();
    let not_ann = |ctx: &FilterContext<'_>| ctx.instance["name"] != "Ann";
    let _server = start_server(
        &bus,
        &source,
        CacheOptions::new(server_settings()).with_filter(not_ann),
    )
    .await;
    let client = start_client(
        &bus,
        CacheOptions::new(client_settings().with_watch(WatchSpec::cache("Customer"))),
    )
    .await;
    client.wait_until_primed(SETTLE).await.unwrap();

    source.update("Customer", 1, json!({"tier": "gold"})).await.unwrap();
    source.update("Customer", 2, json!({"tier": "gold"})).await.unwrap();

    let store = client.store().clone();
    assert!(
        eventually(SETTLE, || store.get("Customer", &ModelId::Number(2)).map(|r| r["tier"].clone())
            == Some(json!("gold")))
        .await
    );
    assert_eq!(store.get("Customer", &ModelId::Number(1)), Some(ann()));
}

#[tokio::test]
async fn test_served_models_hooked_at_start() {
    let bus = Arc::new(InMemoryBus::new());
    let source = customer_source();
    let server = start_server(
        &bus,
        &source,
        CacheOptions::new(server_settings().with_served_model("Customer").with_served_model("Ghost")),
    )
    .await;
    assert_eq!(server.hooked_models(), vec!["Customer"]);

    source.insert("Customer", json!({"name": "Cy"})).await.unwrap();
    assert_eq!(bus.published("models__test").len(), 1);
}

// ============================================================================
// EVENTS
// ============================================================================

#[tokio::test]
async fn test_event_only_model_never_caches() {
    let handler = RecordingHandler::new();
    let (source, _server, client) = primed_pair(
        CacheOptions::new(
            client_settings()
                .with_watch(WatchSpec::cache("Customer"))
                .with_watch(WatchSpec::event("Order"))
                .with_event("Order.update"),
        )
        .with_event_handler(handler.clone()),
    )
    .await;

    source.seed("Order", vec![json!({"id": 7, "total": 10})]).unwrap();
    source.update("Order", 7, json!({"total": 12})).await.unwrap();

    assert!(eventually(SETTLE, || handler.keys() == vec!["Order.update"]).await);
    assert_eq!(handler.events()[0].model_id, ModelId::Number(7));
    assert_unwatched(client.store(), "Order");
}

#[tokio::test]
async fn test_handler_errors_are_routed() {
    let handler = RecordingHandler::new().failing_on("Customer.update");
    let errors: Recorder<HandlerError> = Recorder::new();
    let sink = errors.clone();
    let (source, _server, _client) = primed_pair(
        CacheOptions::new(
            client_settings()
                .with_watch(WatchSpec::cache("Customer"))
                .with_event("Customer.update")
                .with_event("Customer.delete"),
        )
        .with_event_handler(handler.clone())
        .with_event_error_handler(move |err| sink.push(err)),
    )
    .await;

    source.update("Customer", 1, json!({"tier": "gold"})).await.unwrap();
    source.delete_by_id("Customer", 1).await.unwrap();

    assert!(eventually(SETTLE, || handler.keys().len() == 2).await);
    assert_eq!(handler.keys(), vec!["Customer.update", "Customer.delete"]);
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn test_prime_records_dispatch_when_registered() {
    let handler = RecordingHandler::new();
    let (_source, _server, _client) = primed_pair(
        CacheOptions::new(
            client_settings()
                .with_watch(WatchSpec::cache("Customer"))
                .with_event("Customer.prime"),
        )
        .with_event_handler(handler.clone()),
    )
    .await;
    assert_eq!(handler.keys(), vec!["Customer.prime", "Customer.prime"]);
}

// ============================================================================
// LOCAL ROLE
// ============================================================================

#[tokio::test]
async fn test_local_role_replicates_in_process() {
    let source = customer_source();
    let handler = RecordingHandler::new();
    let (options, ready) = recorded(
        CacheOptions::new(
            local_settings()
                .with_watch(WatchSpec::cache("Customer"))
                .with_event("Customer.create"),
        )
        .with_event_handler(handler.clone()),
    );
    let machine = CacheMachine::start(
        options,
        Collaborators::new().with_system_of_record(source.clone()),
    )
    .await
    .unwrap();

    assert_eq!(ready.len(), 1);
    assert_bucket_eq(machine.store(), "Customer", &[ann(), bo()]);

    source.insert("Customer", json!({"name": "Cy"})).await.unwrap();
    assert!(machine.store().contains("Customer", &ModelId::Number(3)));
    assert_eq!(handler.keys(), vec!["Customer.create"]);

    machine
        .emit(
            vec![ChangeRecord::delete("Customer", 3)],
            "models",
        )
        .await
        .unwrap();
    assert!(!machine.store().contains("Customer", &ModelId::Number(3)));
}

#[tokio::test]
async fn test_local_priming_failure_reaches_ready_callback() {
    let source = customer_source();
    source.set_failing(true);
    let (options, ready) =
        recorded(CacheOptions::new(local_settings().with_watch(WatchSpec::cache("Customer"))));
    let machine = CacheMachine::start(options, Collaborators::new().with_source(source))
        .await
        .unwrap();

    assert!(matches!(machine.priming_state(), PrimingState::Failed(_)));
    assert!(matches!(
        ready.items().as_slice(),
        [Err(CacheError::Priming(PrimingError::RequestFailed { .. }))]
    ));
}

#[tokio::test]
async fn test_events_without_handler_fail_at_start() {
    let result = CacheMachine::start(
        CacheOptions::new(local_settings().with_event("Order.update")),
        Collaborators::new().with_source(customer_source()),
    )
    .await;
    assert_config_error(&result);
}

#[tokio::test]
async fn test_client_start_surfaces_unavailable_bus() {
    let bus = Arc::new(InMemoryBus::new());
    bus.set_unavailable(true);
    let (options, ready) =
        recorded(CacheOptions::new(client_settings().with_watch(WatchSpec::cache("Customer"))));
    let result = CacheMachine::start(options, Collaborators::new().with_bus(bus.clone())).await;

    assert_transport_error(&result);
    assert!(ready.is_empty());
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Priming any table reproduces it exactly in the replica.
    #[test]
    fn prop_priming_reproduces_source(names in prop::collection::vec("[A-Z][a-z]{1,8}", 0..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let rows: Vec<_> = names
                .iter()
                .enumerate()
                .map(|(i, name)| json!({"id": i as i64 + 1, "name": name}))
                .collect();
            let source = Arc::new(InMemorySystemOfRecord::new().with_model("Customer"));
            source.seed("Customer", rows.clone()).unwrap();

            let bus = Arc::new(InMemoryBus::new());
            let _server = start_server(&bus, &source, CacheOptions::new(server_settings())).await;
            let client = start_client(
                &bus,
                CacheOptions::new(client_settings().with_watch(WatchSpec::cache("Customer"))),
            )
            .await;
            client.wait_until_primed(SETTLE).await.unwrap();
            assert_eq!(client.store().records("Customer"), rows);
        });
    }
}
