//! cache-machine Demo
//!
//! Boots a server and a client over an in-process bus, primes a `Customer`
//! replica, applies one live update and prints the replica as JSON.
//!
//! Usage:
//!   CACHE_MACHINE_LOG_FORMAT=pretty cargo run -p cachemachine --bin cachemachine-demo

use std::sync::Arc;
use std::time::Duration;

use cachemachine::{init_logging, CacheMachine, CacheOptions, Collaborators, LogConfig};
use cachemachine_core::{CacheResult, CacheSettings, Role, WatchSpec};
use cachemachine_pubsub::InMemoryBus;
use cachemachine_storage::InMemorySystemOfRecord;
use serde_json::json;
use tracing::info;

async fn run() -> CacheResult<()> {
    let bus = Arc::new(InMemoryBus::new());
    let source = Arc::new(InMemorySystemOfRecord::new().with_model("Customer"));
    source.seed(
        "Customer",
        vec![
            json!({"id": 1, "name": "Ann"}),
            json!({"id": 2, "name": "Bo"}),
        ],
    )?;

    let server = CacheMachine::start(
        CacheOptions::new(
            CacheSettings::new(Role::Server, "crm", "demo").with_served_model("Customer"),
        ),
        Collaborators::new()
            .with_bus(bus.clone())
            .with_system_of_record(source.clone()),
    )
    .await?;

    let client = CacheMachine::start(
        CacheOptions::new(
            CacheSettings::new(Role::Client, "billing", "demo")
                .with_watch(WatchSpec::cache("Customer")),
        )
        .on_ready(|outcome| match outcome {
            Ok(readiness) => info!(?readiness, "Client ready"),
            Err(err) => tracing::error!(error = %err, "Client failed to prime"),
        }),
        Collaborators::new().with_bus(bus.clone()),
    )
    .await?;
    client.wait_until_primed(Duration::from_secs(5)).await?;

    source.update("Customer", 2, json!({"name": "Bo", "tier": "gold"})).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = client.snapshot();
    match serde_json::to_string_pretty(&snapshot) {
        Ok(rendered) => println!("{}", rendered),
        Err(e) => eprintln!("Failed to render replica: {}", e),
    }

    client.shutdown();
    server.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = match LogConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid logging configuration: {}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    if let Err(e) = run().await {
        eprintln!("Demo failed: {}", e);
        std::process::exit(1);
    }
}
