//! Process-owned registry of running cache machines, keyed by service
//! identity. Constructed once at startup and passed to whoever needs it.

use std::sync::Arc;

use cachemachine_core::CacheResult;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::coordinator::{CacheMachine, Collaborators};
use crate::options::CacheOptions;

#[derive(Debug, Default)]
pub struct CacheRegistry {
    machines: DashMap<String, Arc<CacheMachine>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `machine` under its service identity, returning the machine
    /// it replaced. The replaced machine keeps running, hooks included, until
    /// its last handle is dropped or it is shut down.
    pub fn insert(&self, machine: Arc<CacheMachine>) -> Option<Arc<CacheMachine>> {
        let identity = machine.naming().service_identity().to_string();
        let previous = self.machines.insert(identity.clone(), machine);
        if previous.is_some() {
            warn!(service_identity = %identity, "Replaced registered cache machine");
        }
        previous
    }

    /// Start a machine and register it.
    pub async fn start(
        &self,
        options: CacheOptions,
        collaborators: Collaborators,
    ) -> CacheResult<Arc<CacheMachine>> {
        let machine = CacheMachine::start(options, collaborators).await?;
        if let Some(previous) = self.insert(machine.clone()) {
            previous.shutdown();
        }
        Ok(machine)
    }

    pub fn get(&self, service_identity: &str) -> Option<Arc<CacheMachine>> {
        self.machines
            .get(service_identity)
            .map(|entry| entry.value().clone())
    }

    pub fn remove(&self, service_identity: &str) -> Option<Arc<CacheMachine>> {
        self.machines
            .remove(service_identity)
            .map(|(_, machine)| machine)
    }

    /// Registered identities, sorted.
    pub fn service_identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .machines
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        identities.sort();
        identities
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Shut down and forget every machine.
    pub fn shutdown_all(&self) {
        let identities = self.service_identities();
        for identity in &identities {
            if let Some(machine) = self.remove(identity) {
                machine.shutdown();
            }
        }
        info!(machines = identities.len(), "Cache registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachemachine_core::{CacheSettings, Role, MODEL_TOPIC};
    use cachemachine_pubsub::InMemoryBus;
    use cachemachine_storage::InMemorySystemOfRecord;
    use serde_json::json;

    async fn local(identity: &str) -> Arc<CacheMachine> {
        CacheMachine::start(
            CacheOptions::new(CacheSettings::new(Role::Local, identity, "test")),
            Collaborators::new().with_source(Arc::new(InMemorySystemOfRecord::new())),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_replaces_by_identity() {
        let registry = CacheRegistry::new();
        let first = local("billing").await;
        assert!(registry.insert(first.clone()).is_none());

        let second = local("billing").await;
        let replaced = registry.insert(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&registry.get("billing").unwrap(), &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_and_remove() {
        let registry = CacheRegistry::new();
        registry.insert(local("crm").await);
        registry.insert(local("billing").await);

        assert_eq!(registry.service_identities(), vec!["billing", "crm"]);
        assert!(registry.get("shipping").is_none());
        assert!(registry.remove("crm").is_some());
        assert!(registry.remove("crm").is_none());

        registry.shutdown_all();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_start_registers() {
        let registry = CacheRegistry::new();
        let machine = registry
            .start(
                CacheOptions::new(CacheSettings::new(Role::Local, "billing", "test")),
                Collaborators::new().with_source(Arc::new(InMemorySystemOfRecord::new())),
            )
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&registry.get("billing").unwrap(), &machine));
    }

    #[tokio::test]
    async fn test_restarted_server_publishes_each_change_once() {
        let registry = CacheRegistry::new();
        let bus = Arc::new(InMemoryBus::new());
        let source = Arc::new(InMemorySystemOfRecord::new().with_model("Customer"));
        let topic = format!("{MODEL_TOPIC}__test");

        for _ in 0..2 {
            registry
                .start(
                    CacheOptions::new(
                        CacheSettings::new(Role::Server, "crm", "test")
                            .with_served_model("Customer"),
                    ),
                    Collaborators::new()
                        .with_bus(bus.clone())
                        .with_system_of_record(source.clone()),
                )
                .await
                .unwrap();
        }
        source.insert("Customer", json!({"name": "Ann"})).await.unwrap();
        assert_eq!(bus.published(&topic).len(), 1);

        registry.shutdown_all();
        source.insert("Customer", json!({"name": "Bo"})).await.unwrap();
        assert_eq!(bus.published(&topic).len(), 1);
    }
}
