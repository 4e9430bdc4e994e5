//! Role coordinator.
//!
//! [`CacheMachine::start`] wires store, publisher, priming and dispatch into
//! one of three roles:
//!
//! - **server**: hooks served models on the system of record, publishes their
//!   mutations and answers priming requests.
//! - **client**: replicates watched models from the bus, primes itself on
//!   start and dispatches watched events.
//! - **local**: no bus; mutations are applied in-process and priming reads
//!   the system of record directly.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cachemachine_core::{
    CacheResult, ChangeRecord, ConfigError, MethodName, Naming, PrimeRequest, PrimingError, Role,
    WatchSpec, PRIME_REQUEST_TOPIC,
};
use cachemachine_events::EventDispatcher;
use cachemachine_pubsub::MessageBus;
use cachemachine_storage::{
    apply, LocalStore, MutationObserver, Snapshot, SystemOfRecord,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hooks::ModelHooks;
use crate::listeners::{drain_changes, drain_prime_responses, serve_prime_requests};
use crate::options::{CacheOptions, Readiness};
use crate::priming::{
    resolve_prime_records, PrimeRequester, PrimeResponder, PrimingHandshake, PrimingState,
};
use crate::publisher::{BusSink, ChangePublisher, LocalSink};

// ============================================================================
// COLLABORATORS
// ============================================================================

/// External systems a role talks to. Which ones are required depends on the
/// role: servers need all three, clients need a bus, local needs a source.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub bus: Option<Arc<dyn MessageBus>>,
    pub source: Option<Arc<dyn SystemOfRecord>>,
    pub observer: Option<Arc<dyn MutationObserver>>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("bus", &self.bus.is_some())
            .field("source", &self.source.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn SystemOfRecord>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MutationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use one value as both source and observer, the usual ORM shape.
    pub fn with_system_of_record<S>(self, system: Arc<S>) -> Self
    where
        S: SystemOfRecord + MutationObserver + 'static,
    {
        self.with_source(system.clone()).with_observer(system)
    }
}

fn require<T: ?Sized>(value: &Option<Arc<T>>, role: Role, collaborator: &str) -> Result<Arc<T>, ConfigError> {
    value.clone().ok_or_else(|| ConfigError::MissingCollaborator {
        role: role.to_string(),
        collaborator: collaborator.to_string(),
    })
}

// ============================================================================
// CACHE MACHINE
// ============================================================================

/// A running role. Owns the replica and every background task it spawned.
pub struct CacheMachine {
    role: Role,
    naming: Naming,
    options: CacheOptions,
    store: Arc<LocalStore>,
    dispatcher: Arc<EventDispatcher>,
    publisher: Option<Arc<ChangePublisher>>,
    hooks: Option<Arc<ModelHooks>>,
    handshake: Arc<PrimingHandshake>,
    requester: Option<PrimeRequester>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for CacheMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMachine")
            .field("role", &self.role)
            .field("naming", &self.naming)
            .field("priming_state", &self.handshake.state())
            .field("watched_models", &self.store.watched_models())
            .finish()
    }
}

impl CacheMachine {
    /// Validate options and start the configured role.
    ///
    /// Configuration and transport errors during start are returned here and
    /// do not reach the readiness callback. A client returns as soon as its
    /// priming request is out; readiness is signalled later.
    pub async fn start(
        options: CacheOptions,
        collaborators: Collaborators,
    ) -> CacheResult<Arc<Self>> {
        options.settings.validate()?;
        let naming = options.settings.naming()?;
        let dispatcher = Arc::new(options.event_dispatcher()?);
        let role = options.settings.role;
        info!(
            role = %role,
            service_identity = %naming.service_identity(),
            environment_tag = %naming.environment_tag(),
            "Starting cache machine"
        );

        match role {
            Role::Server => Self::start_server(options, collaborators, naming, dispatcher).await,
            Role::Client => Self::start_client(options, collaborators, naming, dispatcher).await,
            Role::Local => Self::start_local(options, collaborators, naming, dispatcher).await,
        }
    }

    fn assemble(
        options: CacheOptions,
        naming: Naming,
        dispatcher: Arc<EventDispatcher>,
        store: Arc<LocalStore>,
    ) -> Self {
        Self {
            role: options.settings.role,
            naming,
            options,
            store,
            dispatcher,
            publisher: None,
            hooks: None,
            handshake: Arc::new(PrimingHandshake::new()),
            requester: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn start_server(
        options: CacheOptions,
        collaborators: Collaborators,
        naming: Naming,
        dispatcher: Arc<EventDispatcher>,
    ) -> CacheResult<Arc<Self>> {
        let bus = require(&collaborators.bus, Role::Server, "bus")?;
        let source = require(&collaborators.source, Role::Server, "source")?;
        let observer = require(&collaborators.observer, Role::Server, "observer")?;

        let publisher = Arc::new(ChangePublisher::new(
            naming.clone(),
            options.filters.clone(),
            Arc::new(BusSink::new(bus.clone(), naming.clone())),
            source.clone(),
        ));
        let hooks = Arc::new(ModelHooks::new(observer, source.clone(), publisher.clone()));
        let hooked = hooks.ensure_all(options.settings.served_models.iter().map(String::as_str));
        debug!(hooked, "Hooked served models");

        let request_topic = naming.topic_name(PRIME_REQUEST_TOPIC);
        let subscription_name = naming.unique_subscription_name_now(PRIME_REQUEST_TOPIC);
        let subscription = bus
            .topic(&request_topic)
            .await?
            .subscribe(&subscription_name)
            .await?;
        let responder = Arc::new(PrimeResponder::new(
            source,
            bus,
            naming.clone(),
            hooks.clone(),
        ));

        let mut machine = Self::assemble(options, naming, dispatcher, Arc::new(LocalStore::new()));
        machine.publisher = Some(publisher);
        machine.hooks = Some(hooks);
        let machine = Arc::new(machine);
        machine.spawn(serve_prime_requests(subscription, responder));

        info!(
            topic = %request_topic,
            subscription = %subscription_name,
            "Serving priming requests"
        );
        machine.options.signal_ready(Ok(Readiness::Serving));
        Ok(machine)
    }

    async fn start_client(
        options: CacheOptions,
        collaborators: Collaborators,
        naming: Naming,
        dispatcher: Arc<EventDispatcher>,
    ) -> CacheResult<Arc<Self>> {
        let bus = require(&collaborators.bus, Role::Client, "bus")?;
        let specs = options.settings.effective_watch_specs()?;
        let store = Arc::new(watched_store(&specs));

        let response_channel = options
            .settings
            .response_channel
            .clone()
            .unwrap_or_else(|| naming.response_channel());
        let requester = PrimeRequester::new(
            bus.clone(),
            &naming,
            PrimeRequest::from_watch_specs(response_channel.clone(), &specs),
        );

        let mut machine = Self::assemble(options, naming.clone(), dispatcher.clone(), store.clone());
        machine.requester = Some(requester);
        let machine = Arc::new(machine);

        // One at a time, so two subscriptions never race to create a topic.
        for channel in change_channels(&naming, &specs) {
            let topic_name = naming.topic_name(&channel);
            let subscription_name = naming.unique_subscription_name_now(&channel);
            let subscription = bus
                .topic(&topic_name)
                .await?
                .subscribe(&subscription_name)
                .await?;
            debug!(topic = %topic_name, subscription = %subscription_name, "Subscribed to changes");
            machine.spawn(drain_changes(subscription, store.clone(), dispatcher.clone()));
        }

        let response_topic = naming.topic_name(&response_channel);
        let subscription = bus
            .topic(&response_topic)
            .await?
            .subscribe(&naming.stable_subscription_name(&response_channel))
            .await?;
        machine.spawn(drain_prime_responses(
            subscription,
            store,
            dispatcher,
            machine.handshake.clone(),
            machine.options.clone(),
        ));

        machine.request_prime().await?;
        Ok(machine)
    }

    async fn start_local(
        options: CacheOptions,
        collaborators: Collaborators,
        naming: Naming,
        dispatcher: Arc<EventDispatcher>,
    ) -> CacheResult<Arc<Self>> {
        let source = require(&collaborators.source, Role::Local, "source")?;
        let specs = options.settings.effective_watch_specs()?;
        let store = Arc::new(watched_store(&specs));

        let publisher = Arc::new(ChangePublisher::new(
            naming.clone(),
            options.filters.clone(),
            Arc::new(LocalSink::new(store.clone(), dispatcher.clone())),
            source.clone(),
        ));
        let hooks = collaborators.observer.clone().map(|observer| {
            let hooks = Arc::new(ModelHooks::new(observer, source.clone(), publisher.clone()));
            hooks.ensure_all(specs.iter().map(|spec| spec.model_name.as_str()));
            hooks
        });
        if hooks.is_none() {
            warn!("No mutation observer supplied, local replica will not follow changes");
        }

        let mut machine = Self::assemble(options, naming.clone(), dispatcher.clone(), store.clone());
        machine.publisher = Some(publisher);
        machine.hooks = hooks;
        let machine = Arc::new(machine);

        let attempt = machine.handshake.begin();
        let request = PrimeRequest::from_watch_specs(naming.response_channel(), &specs);
        let resolution = resolve_prime_records(source.as_ref(), &request).await;
        for record in &resolution.records {
            apply(&store, record);
        }
        dispatcher.dispatch_all(&resolution.records).await;

        match resolution.failures.into_iter().next() {
            None => {
                machine.handshake.complete();
                info!(records = resolution.records.len(), "Local replica primed");
                machine
                    .options
                    .signal_ready(Ok(Readiness::Primed(store.snapshot())));
            }
            Some(err) => {
                let failure = PrimingError::RequestFailed {
                    reason: err.to_string(),
                };
                machine.handshake.fail(attempt, failure.clone());
                error!(error = %err, "Local priming failed");
                machine.options.signal_ready(Err(failure.into()));
            }
        }
        Ok(machine)
    }

    /// Begin an attempt, publish the request and arm its deadline.
    async fn request_prime(self: &Arc<Self>) -> CacheResult<()> {
        let Some(requester) = &self.requester else {
            return Err(self.wrong_role("reprime", "a client").into());
        };
        let attempt = self.handshake.begin();
        if let Err(err) = requester.send().await {
            self.handshake.fail(
                attempt,
                PrimingError::RequestFailed {
                    reason: err.to_string(),
                },
            );
            return Err(err);
        }

        let handshake = self.handshake.clone();
        let options = self.options.clone();
        let limit = self.options.settings.prime_timeout();
        self.spawn(async move {
            if let Some(err) = handshake.enforce_deadline(attempt, limit).await {
                error!(error = %err, attempt, "Priming did not complete");
                options.signal_ready(Err(err.into()));
            }
        });
        Ok(())
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn wrong_role(&self, operation: &str, expected: &str) -> ConfigError {
        ConfigError::InvalidValue {
            field: "role".to_string(),
            value: self.role.to_string(),
            reason: format!("{} requires {} role", operation, expected),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn publisher(&self) -> Option<&Arc<ChangePublisher>> {
        self.publisher.as_ref()
    }

    pub fn priming_state(&self) -> PrimingState {
        self.handshake.state()
    }

    /// Models with publisher hooks installed. Empty for clients.
    pub fn hooked_models(&self) -> Vec<String> {
        self.hooks
            .as_ref()
            .map(|hooks| hooks.hooked_models())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Publish records out of band on a logical channel. Server and local only.
    pub async fn emit(&self, records: Vec<ChangeRecord>, channel: &str) -> CacheResult<()> {
        match &self.publisher {
            Some(publisher) => publisher.emit(records, channel).await,
            None => Err(self.wrong_role("emit", "a server or local").into()),
        }
    }

    /// Hook one more model on the system of record. Server and local only.
    pub fn hook_model(&self, model_name: &str) -> CacheResult<bool> {
        match &self.hooks {
            Some(hooks) => hooks.ensure(model_name),
            None => Err(self.wrong_role("hook_model", "a server or local").into()),
        }
    }

    /// Re-run the priming handshake. Already-present records are kept.
    pub async fn reprime(self: &Arc<Self>) -> CacheResult<()> {
        info!(service_identity = %self.naming.service_identity(), "Repriming");
        self.request_prime().await
    }

    /// Wait up to `limit` for the current priming attempt to settle.
    pub async fn wait_until_primed(&self, limit: Duration) -> Result<(), PrimingError> {
        self.handshake.wait(limit).await
    }

    /// Stop every background task and unregister the publisher from the
    /// system of record. The store stays readable.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        let released = self.hooks.as_ref().map_or(0, |hooks| hooks.release());
        info!(
            service_identity = %self.naming.service_identity(),
            tasks = tasks.len(),
            released_models = released,
            "Cache machine shut down"
        );
    }
}

impl Drop for CacheMachine {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        if let Some(hooks) = &self.hooks {
            hooks.release();
        }
    }
}

/// Store with a bucket for every `cache`-mode model.
fn watched_store(specs: &[WatchSpec]) -> LocalStore {
    let store = LocalStore::new();
    for spec in specs.iter().filter(|spec| spec.is_cached()) {
        store.watch(&spec.model_name);
    }
    store
}

/// Logical change channels covering every watched model, deduplicated and in
/// first-seen order.
fn change_channels(naming: &Naming, specs: &[WatchSpec]) -> Vec<String> {
    let mut channels: Vec<String> = Vec::new();
    for spec in specs {
        for method in MethodName::MUTATIONS {
            let channel = naming.change_channel(&spec.model_name, method);
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
    }
    channels
}
