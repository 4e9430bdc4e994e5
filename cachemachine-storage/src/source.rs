//! System-of-record collaborator traits.
//!
//! The server role reads authoritative data through [`SystemOfRecord`] and
//! learns about writes by registering a [`MutationHook`] with a
//! [`MutationObserver`]. Both are implemented by the host application; an
//! in-memory version lives in [`crate::memory`].

use std::sync::Arc;

use async_trait::async_trait;
use cachemachine_core::{CacheResult, ModelId};
use serde_json::{Map, Value};

// ============================================================================
// QUERIES
// ============================================================================

/// Field projection plus an optional `where` filter.
///
/// The filter is a JSON object. Each key names a field; its value is either a
/// literal (equality) or an object `{"in": [...]}` / `{"inq": [...]}`
/// (membership).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindQuery {
    pub fields: Vec<String>,
    pub where_filter: Option<Value>,
}

impl FindQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_where(mut self, where_filter: Value) -> Self {
        self.where_filter = Some(where_filter);
        self
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.where_filter
            .as_ref()
            .map_or(true, |filter| matches_where(record, filter))
    }

    /// Apply the projection. An empty projection keeps every field.
    pub fn project(&self, record: &Value) -> Value {
        project(record, &self.fields)
    }
}

/// Evaluate a `where` filter against a record.
///
/// A non-object filter matches nothing.
pub fn matches_where(record: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return false;
    };
    conditions.iter().all(|(field, condition)| {
        let actual = record.get(field).unwrap_or(&Value::Null);
        match membership_set(condition) {
            Some(set) => set.contains(actual),
            None => actual == condition,
        }
    })
}

/// The candidate list of an `{"in": [...]}` or `{"inq": [...]}` condition.
pub fn membership_set(condition: &Value) -> Option<&Vec<Value>> {
    let object = condition.as_object()?;
    object
        .get("in")
        .or_else(|| object.get("inq"))
        .and_then(Value::as_array)
}

/// Keep only `fields` of an object record.
pub fn project(record: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return record.clone();
    }
    let Some(object) = record.as_object() else {
        return record.clone();
    };
    let projected: Map<String, Value> = fields
        .iter()
        .filter_map(|field| object.get(field).map(|v| (field.clone(), v.clone())))
        .collect();
    Value::Object(projected)
}

/// Read access to authoritative data.
#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    /// Whether `model_name` is a model this source knows.
    fn has_model(&self, model_name: &str) -> bool;

    /// Records of `model_name` matching `query`.
    async fn find(&self, model_name: &str, query: &FindQuery) -> CacheResult<Vec<Value>>;
}

// ============================================================================
// MUTATIONS
// ============================================================================

/// Which ids a mutation touched.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationTarget {
    /// One explicit id.
    Single(ModelId),
    /// A set-valued id filter; raw candidates, not yet narrowed to numbers.
    Set(Vec<Value>),
    /// No id could be derived.
    Unknown,
}

/// Notification that a record (or set of records) was written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    pub model_name: String,
    /// `true` for inserts.
    pub is_new_instance: bool,
    /// The saved instance, for single-record writes.
    pub instance: Option<Value>,
    /// Partial data, for bulk updates.
    pub data: Option<Value>,
    /// Filter used by bulk updates.
    pub where_filter: Option<Value>,
    pub version: Option<u64>,
}

impl Mutation {
    pub fn created(model_name: impl Into<String>, instance: Value) -> Self {
        Self {
            model_name: model_name.into(),
            is_new_instance: true,
            instance: Some(instance),
            ..Self::default()
        }
    }

    pub fn updated(model_name: impl Into<String>, instance: Value) -> Self {
        Self {
            model_name: model_name.into(),
            instance: Some(instance),
            ..Self::default()
        }
    }

    pub fn updated_where(model_name: impl Into<String>, where_filter: Value, data: Value) -> Self {
        Self {
            model_name: model_name.into(),
            data: Some(data),
            where_filter: Some(where_filter),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Instance if present, otherwise the partial data.
    pub fn payload(&self) -> Option<&Value> {
        self.instance.as_ref().or(self.data.as_ref())
    }

    /// `instance.id`, then `where.id` (literal or `in`/`inq` set).
    pub fn target(&self) -> MutationTarget {
        if let Some(id) = self.instance.as_ref().and_then(ModelId::from_payload) {
            return MutationTarget::Single(id);
        }
        let Some(condition) = self.where_filter.as_ref().and_then(|w| w.get("id")) else {
            return MutationTarget::Unknown;
        };
        if let Some(set) = membership_set(condition) {
            return MutationTarget::Set(set.clone());
        }
        ModelId::from_value(condition).map_or(MutationTarget::Unknown, MutationTarget::Single)
    }
}

/// Notification that records matching a filter are about to be deleted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deletion {
    pub model_name: String,
    pub where_filter: Option<Value>,
}

impl Deletion {
    pub fn new(model_name: impl Into<String>, where_filter: Value) -> Self {
        Self {
            model_name: model_name.into(),
            where_filter: Some(where_filter),
        }
    }
}

/// Callback invoked by the system of record around writes.
#[async_trait]
pub trait MutationHook: Send + Sync {
    async fn after_mutation(&self, mutation: &Mutation);

    /// Runs before the rows are removed, so the hook can still read them.
    async fn before_delete(&self, deletion: &Deletion);
}

/// Registration point for mutation hooks.
pub trait MutationObserver: Send + Sync {
    fn on_after_mutation(&self, model_name: &str, hook: Arc<dyn MutationHook>) -> CacheResult<()>;

    fn on_before_delete(&self, model_name: &str, hook: Arc<dyn MutationHook>) -> CacheResult<()>;

    /// Unregister `hook` from both hook lists of `model_name`. Returns how
    /// many registrations were removed.
    fn remove_hooks(&self, model_name: &str, hook: &Arc<dyn MutationHook>) -> CacheResult<usize>;
}

/// Identity comparison of two hook handles.
pub fn same_hook(a: &Arc<dyn MutationHook>, b: &Arc<dyn MutationHook>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
