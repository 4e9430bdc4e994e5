//! Topic and subscription naming.
//!
//! Every process derives names from the same three inputs: a logical channel
//! name, the environment tag, and the service identity. Publishers and
//! subscribers share these functions so they can never disagree on where a
//! change lands.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::record::MethodName;

/// Delimiter between the logical name and the environment tag.
pub const TOPIC_SEPARATOR: &str = "__";

/// Transport ceiling on identifier length.
pub const MAX_SUBSCRIPTION_NAME_LEN: usize = 255;

/// Shared change channel used by [`TopicGranularity::Shared`].
pub const MODEL_TOPIC: &str = "models";

/// Channel on which clients announce themselves to servers.
pub const PRIME_REQUEST_TOPIC: &str = "start-cache-client";

/// Prefix of the per-client priming response channel.
pub const PRIME_RESPONSE_TOPIC: &str = "create-cache";

/// How change records are spread over topics.
///
/// Publishers and subscribers of one deployment must agree on this value;
/// mixing granularities silently breaks subscriber matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TopicGranularity {
    /// One `models` topic for every change.
    #[default]
    Shared,
    /// One topic per model name.
    PerModel,
    /// One topic per `(model, method)` pair.
    PerModelMethod,
}

impl std::str::FromStr for TopicGranularity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(TopicGranularity::Shared),
            "perModel" | "per-model" => Ok(TopicGranularity::PerModel),
            "perModelMethod" | "per-model-method" => Ok(TopicGranularity::PerModelMethod),
            other => Err(ConfigError::InvalidValue {
                field: "topicGranularity".to_string(),
                value: other.to_string(),
                reason: "expected shared, perModel or perModelMethod".to_string(),
            }),
        }
    }
}

/// Name derivation bound to one service identity and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    service_identity: String,
    environment_tag: String,
    granularity: TopicGranularity,
}

impl Naming {
    /// Both identity and environment are required; an empty value is a
    /// configuration error.
    pub fn new(
        service_identity: impl Into<String>,
        environment_tag: impl Into<String>,
        granularity: TopicGranularity,
    ) -> Result<Self, ConfigError> {
        let service_identity = service_identity.into();
        let environment_tag = environment_tag.into();
        if service_identity.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "serviceIdentity".to_string(),
            });
        }
        if environment_tag.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "environmentTag".to_string(),
            });
        }
        Ok(Self {
            service_identity,
            environment_tag,
            granularity,
        })
    }

    pub fn service_identity(&self) -> &str {
        &self.service_identity
    }

    pub fn environment_tag(&self) -> &str {
        &self.environment_tag
    }

    pub fn granularity(&self) -> TopicGranularity {
        self.granularity
    }

    /// `name + "__" + environment`.
    pub fn topic_name(&self, logical: &str) -> String {
        format!("{}{}{}", logical, TOPIC_SEPARATOR, self.environment_tag)
    }

    /// Logical channel carrying changes of `method` on `model_name`.
    pub fn change_channel(&self, model_name: &str, method: MethodName) -> String {
        match self.granularity {
            TopicGranularity::Shared => MODEL_TOPIC.to_string(),
            TopicGranularity::PerModel => model_name.to_string(),
            TopicGranularity::PerModelMethod => format!("{}.{}", model_name, method),
        }
    }

    /// Logical response channel owned by this service identity.
    pub fn response_channel(&self) -> String {
        format!("{}.{}", PRIME_RESPONSE_TOPIC, self.service_identity)
    }

    /// `<service>-<topic>-<env>-t<millis>`, truncated to the transport ceiling.
    pub fn unique_subscription_name(&self, logical: &str, unix_millis: i64) -> String {
        truncate_identifier(
            format!(
                "{}-{}-{}-t{}",
                self.service_identity, logical, self.environment_tag, unix_millis
            ),
            MAX_SUBSCRIPTION_NAME_LEN,
        )
    }

    /// [`Naming::unique_subscription_name`] stamped with the current time.
    pub fn unique_subscription_name_now(&self, logical: &str) -> String {
        self.unique_subscription_name(logical, Utc::now().timestamp_millis())
    }

    /// Deterministic name reused by every instance sharing this identity.
    pub fn stable_subscription_name(&self, logical: &str) -> String {
        truncate_identifier(
            format!(
                "{}-{}-{}",
                self.service_identity, logical, self.environment_tag
            ),
            MAX_SUBSCRIPTION_NAME_LEN,
        )
    }
}

/// Trim an identifier from the right to at most `limit` bytes, on a char boundary.
pub fn truncate_identifier(mut name: String, limit: usize) -> String {
    if name.len() <= limit {
        return name;
    }
    let mut cut = limit;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    name.truncate(cut);
    name
}
