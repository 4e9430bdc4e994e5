//! Priming handshake messages.
//!
//! A client publishes a [`PrimeRequest`] on the shared request channel; a
//! server answers on the request's `responseChannel` with a JSON array of
//! `prime` change records (see [`crate::record::encode_batch`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RecordError;
use crate::watch::{WatchMode, WatchSpec};

/// Per-model entry of a priming request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeModel {
    #[serde(rename = "type", default)]
    pub mode: WatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

impl PrimeModel {
    /// Projection to apply when resolving; empty means every field.
    pub fn projection(&self) -> &[String] {
        self.fields.as_deref().unwrap_or(&[])
    }
}

/// "Start" request announcing a client's interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimeRequest {
    pub response_channel: String,
    pub models: BTreeMap<String, PrimeModel>,
    /// Correlates request and response in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl PrimeRequest {
    /// Build a request from watch specs. Later specs for the same model only
    /// upgrade it: a model requested in `cache` mode stays in `cache` mode.
    pub fn from_watch_specs<'a, I>(response_channel: impl Into<String>, specs: I) -> Self
    where
        I: IntoIterator<Item = &'a WatchSpec>,
    {
        let mut models: BTreeMap<String, PrimeModel> = BTreeMap::new();
        for spec in specs {
            let fields = (!spec.fields.is_empty()).then(|| spec.fields.clone());
            match models.get_mut(&spec.model_name) {
                Some(existing) if existing.mode == WatchMode::Cache => {}
                Some(existing) => {
                    existing.mode = spec.mode;
                    existing.fields = fields;
                }
                None => {
                    models.insert(
                        spec.model_name.clone(),
                        PrimeModel {
                            mode: spec.mode,
                            fields,
                        },
                    );
                }
            }
        }
        Self {
            response_channel: response_channel.into(),
            models,
            request_id: Some(Uuid::now_v7()),
        }
    }

    /// Models the server must resolve, in model-name order.
    pub fn cached_models(&self) -> impl Iterator<Item = (&String, &PrimeModel)> {
        self.models
            .iter()
            .filter(|(_, model)| model.mode == WatchMode::Cache)
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        serde_json::to_vec(self).map_err(|e| RecordError::Malformed {
            reason: e.to_string(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        serde_json::from_slice(bytes).map_err(|e| RecordError::Malformed {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let specs = vec![
            WatchSpec::cache("Customer").with_fields(["id", "name"]),
            WatchSpec::event("Order"),
        ];
        let mut request = PrimeRequest::from_watch_specs("create-cache.billing", &specs);
        request.request_id = None;

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "responseChannel": "create-cache.billing",
                "models": {
                    "Customer": {"type": "cache", "fields": ["id", "name"]},
                    "Order": {"type": "event"}
                }
            })
        );
    }

    #[test]
    fn test_cache_mode_wins_over_event_mode() {
        let specs = vec![WatchSpec::cache("Order"), WatchSpec::event("Order")];
        let request = PrimeRequest::from_watch_specs("r", &specs);
        assert_eq!(request.models["Order"].mode, WatchMode::Cache);

        let specs = vec![WatchSpec::event("Order"), WatchSpec::cache("Order")];
        let request = PrimeRequest::from_watch_specs("r", &specs);
        assert_eq!(request.models["Order"].mode, WatchMode::Cache);
    }

    #[test]
    fn test_cached_models_skips_event_only() {
        let specs = vec![WatchSpec::cache("Customer"), WatchSpec::event("Order")];
        let request = PrimeRequest::from_watch_specs("r", &specs);
        let cached: Vec<&String> = request.cached_models().map(|(name, _)| name).collect();
        assert_eq!(cached, vec!["Customer"]);
    }

    #[test]
    fn test_cached_models_in_model_name_order() {
        let specs = vec![
            WatchSpec::cache("Order"),
            WatchSpec::cache("Customer"),
            WatchSpec::cache("Invoice"),
        ];
        let request = PrimeRequest::from_watch_specs("r", &specs);
        let cached: Vec<&String> = request.cached_models().map(|(name, _)| name).collect();
        assert_eq!(cached, vec!["Customer", "Invoice", "Order"]);
    }

    #[test]
    fn test_decode_tolerates_missing_type() {
        let request = PrimeRequest::decode(
            br#"{"responseChannel":"r","models":{"Customer":{}}}"#,
        )
        .unwrap();
        assert_eq!(request.models["Customer"].mode, WatchMode::Cache);
        assert!(request.models["Customer"].projection().is_empty());
        assert!(request.request_id.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(PrimeRequest::decode(b"[]").is_err());
    }
}
