//! Process configuration.
//!
//! [`CacheSettings`] holds everything that can be loaded from an untyped
//! source (environment variables or a TOML file). Callbacks and filters are
//! attached separately in the `cachemachine` crate, so nothing here can hold a
//! value that is not callable.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::naming::{Naming, TopicGranularity};
use crate::watch::{EventKey, WatchMode, WatchSpec};

/// Default time a client waits for its priming batch.
pub const DEFAULT_PRIME_TIMEOUT_MS: u64 = 30_000;

/// The part a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns the system of record, answers priming, publishes mutations.
    Server,
    /// Replicates and reacts to changes.
    Client,
    /// Both, in one process, without a bus.
    Local,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
            Role::Local => "local",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            "local" => Ok(Role::Local),
            other => Err(ConfigError::InvalidRole {
                value: other.to_string(),
            }),
        }
    }
}

fn default_prime_timeout_ms() -> u64 {
    DEFAULT_PRIME_TIMEOUT_MS
}

/// Loadable configuration for one cache machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    pub role: Role,
    pub service_identity: String,
    pub environment_tag: String,
    /// Models replicated (or observed) by client and local roles.
    #[serde(default)]
    pub watch_list: Vec<WatchSpec>,
    /// `Model.method` entries routed to the event handler.
    #[serde(default)]
    pub event_watch_list: Vec<String>,
    /// Models a server hooks at start, before any client asks for them.
    #[serde(default)]
    pub served_models: Vec<String>,
    #[serde(default)]
    pub topic_granularity: TopicGranularity,
    #[serde(default = "default_prime_timeout_ms")]
    pub prime_timeout_ms: u64,
    /// Overrides the per-identity priming response channel.
    #[serde(default)]
    pub response_channel: Option<String>,
}

impl CacheSettings {
    /// Settings with only the required fields set.
    pub fn new(
        role: Role,
        service_identity: impl Into<String>,
        environment_tag: impl Into<String>,
    ) -> Self {
        Self {
            role,
            service_identity: service_identity.into(),
            environment_tag: environment_tag.into(),
            watch_list: Vec::new(),
            event_watch_list: Vec::new(),
            served_models: Vec::new(),
            topic_granularity: TopicGranularity::default(),
            prime_timeout_ms: DEFAULT_PRIME_TIMEOUT_MS,
            response_channel: None,
        }
    }

    pub fn with_watch(mut self, spec: WatchSpec) -> Self {
        self.watch_list.push(spec);
        self
    }

    pub fn with_event(mut self, key: impl Into<String>) -> Self {
        self.event_watch_list.push(key.into());
        self
    }

    pub fn with_served_model(mut self, model_name: impl Into<String>) -> Self {
        self.served_models.push(model_name.into());
        self
    }

    pub fn with_granularity(mut self, granularity: TopicGranularity) -> Self {
        self.topic_granularity = granularity;
        self
    }

    pub fn with_prime_timeout(mut self, timeout: Duration) -> Self {
        self.prime_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Load settings from environment variables.
    ///
    /// Environment variables:
    /// - `CACHE_MACHINE_ROLE`: server, client or local (required)
    /// - `CACHE_MACHINE_SERVICE`: service identity (required)
    /// - `CACHE_MACHINE_ENVIRONMENT`: environment tag (required)
    /// - `CACHE_MACHINE_WATCH`: comma list of `Model` or `Model:event`
    /// - `CACHE_MACHINE_EVENTS`: comma list of `Model.method`
    /// - `CACHE_MACHINE_SERVED_MODELS`: comma list of model names
    /// - `CACHE_MACHINE_TOPIC_GRANULARITY`: shared, perModel or perModelMethod (default: shared)
    /// - `CACHE_MACHINE_PRIME_TIMEOUT_MS`: priming timeout (default: 30000)
    /// - `CACHE_MACHINE_RESPONSE_CHANNEL`: priming response channel override
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CacheSettings::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str, field: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingRequired {
                    field: field.to_string(),
                })
        };

        let role = required("CACHE_MACHINE_ROLE", "role")?.trim().parse::<Role>()?;
        let mut settings = Self::new(
            role,
            required("CACHE_MACHINE_SERVICE", "serviceIdentity")?,
            required("CACHE_MACHINE_ENVIRONMENT", "environmentTag")?,
        );

        settings.watch_list = split_list(lookup("CACHE_MACHINE_WATCH"))
            .into_iter()
            .map(|entry| parse_watch_entry(&entry))
            .collect::<Result<_, _>>()?;
        settings.event_watch_list = split_list(lookup("CACHE_MACHINE_EVENTS"));
        settings.served_models = split_list(lookup("CACHE_MACHINE_SERVED_MODELS"));

        if let Some(raw) = lookup("CACHE_MACHINE_TOPIC_GRANULARITY") {
            settings.topic_granularity = raw.trim().parse()?;
        }
        if let Some(raw) = lookup("CACHE_MACHINE_PRIME_TIMEOUT_MS") {
            settings.prime_timeout_ms =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        field: "primeTimeoutMs".to_string(),
                        value: raw.clone(),
                        reason: "must be a positive integer".to_string(),
                    })?;
        }
        settings.response_channel = lookup("CACHE_MACHINE_RESPONSE_CHANNEL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML document and validate them.
    ///
    /// `role` is checked first so an unknown role reports
    /// [`ConfigError::InvalidRole`], as it does from the environment.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let invalid_toml = |e: toml::de::Error| ConfigError::InvalidValue {
            field: "settings".to_string(),
            value: "<toml>".to_string(),
            reason: e.to_string(),
        };
        let table: toml::Table = toml::from_str(source).map_err(invalid_toml)?;
        if let Some(role) = table.get("role").and_then(toml::Value::as_str) {
            role.parse::<Role>()?;
        }
        let settings: Self = toml::Value::Table(table)
            .try_into()
            .map_err(invalid_toml)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Single validation pass, run once at construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.naming()?;

        if self.prime_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "primeTimeoutMs".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.watch_list.iter().any(|w| w.model_name.trim().is_empty()) {
            return Err(ConfigError::MissingRequired {
                field: "watchList.modelName".to_string(),
            });
        }
        if self.served_models.iter().any(|m| m.trim().is_empty()) {
            return Err(ConfigError::MissingRequired {
                field: "servedModels".to_string(),
            });
        }
        self.event_keys()?;
        Ok(())
    }

    /// Naming bound to this identity and environment.
    pub fn naming(&self) -> Result<Naming, ConfigError> {
        Naming::new(
            self.service_identity.clone(),
            self.environment_tag.clone(),
            self.topic_granularity,
        )
    }

    /// Parsed event watch list.
    pub fn event_keys(&self) -> Result<Vec<EventKey>, ConfigError> {
        self.event_watch_list
            .iter()
            .map(|raw| raw.parse::<EventKey>())
            .collect()
    }

    pub fn prime_timeout(&self) -> Duration {
        Duration::from_millis(self.prime_timeout_ms)
    }

    /// Effective watch specs: the watch list plus one `event` spec for every
    /// model only named in the event watch list.
    pub fn effective_watch_specs(&self) -> Result<Vec<WatchSpec>, ConfigError> {
        let mut specs = self.watch_list.clone();
        for key in self.event_keys()? {
            if !specs.iter().any(|s| s.model_name == key.model_name) {
                specs.push(WatchSpec::event(key.model_name));
            }
        }
        Ok(specs)
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn parse_watch_entry(entry: &str) -> Result<WatchSpec, ConfigError> {
    let (model, mode) = match entry.split_once(':') {
        Some((model, mode)) => (model.trim(), mode.trim().parse::<WatchMode>()?),
        None => (entry.trim(), WatchMode::Cache),
    };
    Ok(WatchSpec {
        model_name: model.to_string(),
        fields: Vec::new(),
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("client".parse::<Role>().unwrap(), Role::Client);
        assert_eq!(
            "proxy".parse::<Role>().unwrap_err(),
            ConfigError::InvalidRole {
                value: "proxy".to_string()
            }
        );
    }

    #[test]
    fn test_from_lookup_full() {
        let settings = CacheSettings::from_lookup(lookup(&[
            ("CACHE_MACHINE_ROLE", "client"),
            ("CACHE_MACHINE_SERVICE", "billing"),
            ("CACHE_MACHINE_ENVIRONMENT", "test"),
            ("CACHE_MACHINE_WATCH", "Customer, Order:event"),
            ("CACHE_MACHINE_EVENTS", "Order.update"),
            ("CACHE_MACHINE_TOPIC_GRANULARITY", "perModel"),
            ("CACHE_MACHINE_PRIME_TIMEOUT_MS", "500"),
        ]))
        .unwrap();

        assert_eq!(settings.role, Role::Client);
        assert_eq!(settings.watch_list.len(), 2);
        assert_eq!(settings.watch_list[1], WatchSpec::event("Order"));
        assert_eq!(settings.topic_granularity, TopicGranularity::PerModel);
        assert_eq!(settings.prime_timeout(), Duration::from_millis(500));
        assert_eq!(settings.event_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_from_lookup_missing_environment() {
        let err = CacheSettings::from_lookup(lookup(&[
            ("CACHE_MACHINE_ROLE", "server"),
            ("CACHE_MACHINE_SERVICE", "billing"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRequired {
                field: "environmentTag".to_string()
            }
        );
    }

    #[test]
    fn test_from_lookup_invalid_timeout() {
        let err = CacheSettings::from_lookup(lookup(&[
            ("CACHE_MACHINE_ROLE", "client"),
            ("CACHE_MACHINE_SERVICE", "billing"),
            ("CACHE_MACHINE_ENVIRONMENT", "test"),
            ("CACHE_MACHINE_PRIME_TIMEOUT_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_toml_str() {
        let settings = CacheSettings::from_toml_str(
            r#"
            role = "client"
            serviceIdentity = "billing"
            environmentTag = "staging"
            eventWatchList = ["Order.update"]

            [[watchList]]
            modelName = "Customer"
            fields = ["id", "name"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.watch_list[0].fields.len(), 2);
        assert_eq!(settings.prime_timeout_ms, DEFAULT_PRIME_TIMEOUT_MS);
        assert_eq!(settings.topic_granularity, TopicGranularity::Shared);
    }

    #[test]
    fn test_from_toml_str_reports_invalid_role() {
        let err = CacheSettings::from_toml_str(
            r#"
            role = "proxy"
            serviceIdentity = "billing"
            environmentTag = "staging"
            "#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidRole {
                value: "proxy".to_string()
            }
        );

        let err = CacheSettings::from_toml_str("role = \"client\"").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "settings"));
    }

    #[test]
    fn test_validate_rejects_bad_event_key() {
        let settings = CacheSettings::new(Role::Client, "billing", "test").with_event("Order");
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let settings = CacheSettings::new(Role::Client, "billing", "test")
            .with_prime_timeout(Duration::ZERO);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_effective_watch_specs_adds_event_models() {
        let settings = CacheSettings::new(Role::Client, "billing", "test")
            .with_watch(WatchSpec::cache("Customer"))
            .with_event("Customer.update")
            .with_event("Order.create");
        let specs = settings.effective_watch_specs().unwrap();
        assert_eq!(
            specs,
            vec![WatchSpec::cache("Customer"), WatchSpec::event("Order")]
        );
    }
}
