//! Change records: the unit of replication.
//!
//! Records arrive from the bus as loosely typed JSON. They are decoded into
//! [`WireRecord`]s, where every field is optional, and promoted to a typed
//! [`ChangeRecord`] by [`WireRecord::validate`]. Only validated records ever
//! reach a Local Store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RecordError;
use crate::watch::EventKey;

/// Kind of change carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodName {
    Create,
    Update,
    Delete,
    /// Seed written by the priming handshake.
    Prime,
}

impl MethodName {
    /// Methods a system of record can produce on its own (everything but `prime`).
    pub const MUTATIONS: [MethodName; 3] = [MethodName::Create, MethodName::Update, MethodName::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            MethodName::Create => "create",
            MethodName::Update => "update",
            MethodName::Delete => "delete",
            MethodName::Prime => "prime",
        }
    }

    /// Whether a record with this method must carry `data`.
    pub fn requires_data(&self) -> bool {
        !matches!(self, MethodName::Delete)
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MethodName {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MethodName::Create),
            "update" => Ok(MethodName::Update),
            "delete" => Ok(MethodName::Delete),
            "prime" => Ok(MethodName::Prime),
            other => Err(RecordError::UnknownMethod {
                value: other.to_string(),
            }),
        }
    }
}

/// Record identifier. The wire allows either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelId {
    Number(i64),
    Text(String),
}

impl ModelId {
    /// Read an identifier out of a JSON value.
    ///
    /// Integers and non-empty strings are identifiers. `null`, booleans,
    /// fractional numbers, empty strings and containers are not.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(ModelId::Number),
            Value::String(s) if !s.is_empty() => Some(ModelId::Text(s.clone())),
            _ => None,
        }
    }

    /// Read the `id` field of a record payload.
    pub fn from_payload(data: &Value) -> Option<Self> {
        data.get("id").and_then(ModelId::from_value)
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            ModelId::Number(n) => Some(*n),
            ModelId::Text(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ModelId::Number(n) => Value::from(*n),
            ModelId::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelId::Number(n) => write!(f, "{}", n),
            ModelId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ModelId {
    fn from(value: i64) -> Self {
        ModelId::Number(value)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        ModelId::Text(value.to_string())
    }
}

impl From<String> for ModelId {
    fn from(value: String) -> Self {
        ModelId::Text(value)
    }
}

/// A validated change record.
///
/// `data` is present for `create`, `update` and `prime`, and serialised as
/// `null` for `delete`. `version` is optional and omitted from the wire when
/// absent; see [`ChangeRecord::with_version`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub model_name: String,
    pub method_name: MethodName,
    pub model_id: ModelId,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl ChangeRecord {
    fn with_data(
        model_name: impl Into<String>,
        method_name: MethodName,
        model_id: impl Into<ModelId>,
        data: Value,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            method_name,
            model_id: model_id.into(),
            data: Some(data),
            version: None,
        }
    }

    pub fn create(model_name: impl Into<String>, model_id: impl Into<ModelId>, data: Value) -> Self {
        Self::with_data(model_name, MethodName::Create, model_id, data)
    }

    pub fn update(model_name: impl Into<String>, model_id: impl Into<ModelId>, data: Value) -> Self {
        Self::with_data(model_name, MethodName::Update, model_id, data)
    }

    pub fn prime(model_name: impl Into<String>, model_id: impl Into<ModelId>, data: Value) -> Self {
        Self::with_data(model_name, MethodName::Prime, model_id, data)
    }

    pub fn delete(model_name: impl Into<String>, model_id: impl Into<ModelId>) -> Self {
        Self {
            model_name: model_name.into(),
            method_name: MethodName::Delete,
            model_id: model_id.into(),
            data: None,
            version: None,
        }
    }

    /// Attach a monotonic version. Versioned updates never replace a newer entry.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// `"{modelName}.{methodName}"` key used by the event dispatcher.
    pub fn event_key(&self) -> EventKey {
        EventKey::new(self.model_name.clone(), self.method_name)
    }

    /// Identifier the record applies to: `data.id` when present, otherwise `modelId`.
    pub fn resolved_id(&self) -> ModelId {
        self.data
            .as_ref()
            .and_then(ModelId::from_payload)
            .unwrap_or_else(|| self.model_id.clone())
    }

    /// Re-check the invariants a typed record can still violate through its
    /// public fields.
    pub fn check(&self) -> Result<(), RecordError> {
        if self.model_name.is_empty() {
            return Err(RecordError::MissingModelName);
        }
        if self.method_name.requires_data() && is_absent(self.data.as_ref()) {
            return Err(RecordError::MissingData {
                model_name: self.model_name.clone(),
                method: self.method_name,
            });
        }
        Ok(())
    }
}

/// A change record as it appears on the wire, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub method_name: Option<String>,
    #[serde(default)]
    pub model_id: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub version: Option<u64>,
}

impl WireRecord {
    /// Decode a single JSON value into a wire record.
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        if !value.is_object() {
            return Err(RecordError::Malformed {
                reason: "change record must be a JSON object".to_string(),
            });
        }
        serde_json::from_value(value.clone()).map_err(|e| RecordError::Malformed {
            reason: e.to_string(),
        })
    }

    /// Promote to a typed record.
    ///
    /// Checks, in order: `modelName`, `methodName`, `data` (for every method
    /// except `delete`), then a resolvable id (`data.id`, else `modelId`).
    pub fn validate(self) -> Result<ChangeRecord, RecordError> {
        let model_name = match self.model_name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(RecordError::MissingModelName),
        };

        let method_name = match self.method_name.as_deref() {
            None | Some("") => return Err(RecordError::MissingMethodName),
            Some(raw) => raw.parse::<MethodName>()?,
        };

        let data = self.data.filter(|d| !d.is_null());
        if method_name.requires_data() && data.is_none() {
            return Err(RecordError::MissingData {
                model_name,
                method: method_name,
            });
        }

        let model_id = data
            .as_ref()
            .and_then(ModelId::from_payload)
            .or_else(|| self.model_id.as_ref().and_then(ModelId::from_value));
        let Some(model_id) = model_id else {
            return Err(RecordError::MissingModelId {
                model_name,
                method: method_name,
            });
        };

        Ok(ChangeRecord {
            model_name,
            method_name,
            model_id,
            data,
            version: self.version,
        })
    }
}

fn is_absent(value: Option<&Value>) -> bool {
    value.map_or(true, Value::is_null)
}

// ============================================================================
// BATCH CODEC
// ============================================================================

/// Encode a batch of records as a JSON array.
pub fn encode_batch(records: &[ChangeRecord]) -> Result<Vec<u8>, RecordError> {
    serde_json::to_vec(records).map_err(|e| RecordError::Malformed {
        reason: e.to_string(),
    })
}

/// Decode message bytes into raw record values.
///
/// A JSON array yields its elements; a single object is accepted as a batch
/// of one. Anything else is malformed. Individual elements are left
/// undecoded so that one bad record cannot poison the rest of the batch.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Value>, RecordError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| RecordError::Malformed {
        reason: e.to_string(),
    })?;
    match value {
        Value::Array(items) => Ok(items),
        obj @ Value::Object(_) => Ok(vec![obj]),
        other => Err(RecordError::Malformed {
            reason: format!("expected an array of change records, got {}", other),
        }),
    }
}
