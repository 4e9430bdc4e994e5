//! Declarations of interest: which models a process replicates or reacts to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::record::MethodName;

/// How a watched model is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Full replica in the Local Store.
    #[default]
    Cache,
    /// Notifications only; never allocates a Local Store bucket.
    Event,
}

impl WatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchMode::Cache => "cache",
            WatchMode::Event => "event",
        }
    }
}

impl FromStr for WatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache" => Ok(WatchMode::Cache),
            "event" => Ok(WatchMode::Event),
            other => Err(ConfigError::InvalidValue {
                field: "watchList.mode".to_string(),
                value: other.to_string(),
                reason: "expected cache or event".to_string(),
            }),
        }
    }
}

/// A model the process cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSpec {
    pub model_name: String,
    /// Field projection applied when priming. Empty means every field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, alias = "type")]
    pub mode: WatchMode,
}

impl WatchSpec {
    pub fn cache(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            fields: Vec::new(),
            mode: WatchMode::Cache,
        }
    }

    pub fn event(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            fields: Vec::new(),
            mode: WatchMode::Event,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_cached(&self) -> bool {
        self.mode == WatchMode::Cache
    }
}

/// `"{modelName}.{methodName}"`, an entry of the event watch list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventKey {
    pub model_name: String,
    pub method: MethodName,
}

impl EventKey {
    pub fn new(model_name: impl Into<String>, method: MethodName) -> Self {
        Self {
            model_name: model_name.into(),
            method,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.model_name, self.method)
    }
}

impl FromStr for EventKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: "eventWatchList".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let (model, method) = s
            .rsplit_once('.')
            .ok_or_else(|| invalid("expected Model.method"))?;
        if model.is_empty() {
            return Err(invalid("model name is empty"));
        }
        let method = method
            .parse::<MethodName>()
            .map_err(|_| invalid("method must be create, update, delete or prime"))?;
        Ok(EventKey::new(model, method))
    }
}

impl TryFrom<String> for EventKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventKey> for String {
    fn from(key: EventKey) -> Self {
        key.to_string()
    }
}
