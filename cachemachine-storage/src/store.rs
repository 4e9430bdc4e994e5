//! The Local Store: one bucket per watched model.
//!
//! A model absent from the store is not watched. A model present with an
//! empty bucket is watched and currently has no records. The apply engine
//! relies on that distinction to discard records for uninteresting models.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cachemachine_core::ModelId;
use serde_json::Value;

/// A cached record and the version it was written with, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub data: Value,
    pub version: Option<u64>,
}

impl CachedEntry {
    pub fn new(data: Value, version: Option<u64>) -> Self {
        Self { data, version }
    }

    /// Whether the payload carries an identifier of its own.
    pub fn has_identifier(&self) -> bool {
        ModelId::from_payload(&self.data).is_some()
    }
}

/// Records of one model, keyed by id.
pub type Bucket = HashMap<ModelId, CachedEntry>;

/// Ordered deep copy of a store.
pub type Snapshot = BTreeMap<String, BTreeMap<ModelId, Value>>;

/// In-memory replica owned by one process.
///
/// Reads and applies are short and synchronous, so a std `RwLock` guards the
/// buckets. A poisoned lock is recovered rather than surfaced: the replica is
/// rebuildable and applying must never fail.
#[derive(Debug, Default)]
pub struct LocalStore {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Bucket>> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Bucket>> {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a bucket. Returns `false` if the model was already watched;
    /// its records are kept.
    pub fn watch(&self, model_name: &str) -> bool {
        let mut buckets = self.write();
        if buckets.contains_key(model_name) {
            return false;
        }
        buckets.insert(model_name.to_string(), Bucket::new());
        true
    }

    /// Drop a bucket and its records.
    pub fn unwatch(&self, model_name: &str) -> bool {
        self.write().remove(model_name).is_some()
    }

    pub fn is_watched(&self, model_name: &str) -> bool {
        self.read().contains_key(model_name)
    }

    /// Watched model names, sorted.
    pub fn watched_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, model_name: &str, id: &ModelId) -> Option<Value> {
        self.entry(model_name, id).map(|entry| entry.data)
    }

    pub fn entry(&self, model_name: &str, id: &ModelId) -> Option<CachedEntry> {
        self.read()
            .get(model_name)
            .and_then(|bucket| bucket.get(id))
            .cloned()
    }

    pub fn contains(&self, model_name: &str, id: &ModelId) -> bool {
        self.read()
            .get(model_name)
            .is_some_and(|bucket| bucket.contains_key(id))
    }

    /// Number of cached records; zero for unwatched models.
    pub fn len(&self, model_name: &str) -> usize {
        self.read().get(model_name).map_or(0, Bucket::len)
    }

    pub fn is_empty(&self, model_name: &str) -> bool {
        self.len(model_name) == 0
    }

    /// All records of a model, ordered by id.
    pub fn records(&self, model_name: &str) -> Vec<Value> {
        self.filter(model_name, |_| true)
    }

    /// First record (in id order) whose `key` field equals `value`.
    pub fn find_one_by(&self, model_name: &str, key: &str, value: &Value) -> Option<Value> {
        self.filter(model_name, |record| record.get(key) == Some(value))
            .into_iter()
            .next()
    }

    /// Every record whose `key` field equals `value`.
    pub fn find_all_by(&self, model_name: &str, key: &str, value: &Value) -> Vec<Value> {
        self.filter(model_name, |record| record.get(key) == Some(value))
    }

    /// Records matching an arbitrary predicate, ordered by id.
    pub fn filter<F>(&self, model_name: &str, predicate: F) -> Vec<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let buckets = self.read();
        let Some(bucket) = buckets.get(model_name) else {
            return Vec::new();
        };
        let mut matched: Vec<(&ModelId, &CachedEntry)> = bucket
            .iter()
            .filter(|(_, entry)| predicate(&entry.data))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(b.0));
        matched
            .into_iter()
            .map(|(_, entry)| entry.data.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.read()
            .iter()
            .map(|(model, bucket)| {
                let records = bucket
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.data.clone()))
                    .collect();
                (model.clone(), records)
            })
            .collect()
    }

    /// Run `f` against a watched model's bucket. `None` if the model is not
    /// watched; no bucket is created.
    pub(crate) fn with_bucket_mut<R>(
        &self,
        model_name: &str,
        f: impl FnOnce(&mut Bucket) -> R,
    ) -> Option<R> {
        self.write().get_mut(model_name).map(f)
    }
}
