//! In-memory system of record.
//!
//! Backs tests, the demo binary and single-process deployments. Tables are
//! ordered by id so `find` results are deterministic. Registered hooks run
//! after the table lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use cachemachine_core::{CacheResult, ModelId, SourceError};
use serde_json::{json, Value};
use tracing::debug;

use crate::source::{
    matches_where, same_hook, Deletion, FindQuery, Mutation, MutationHook, MutationObserver,
    SystemOfRecord,
};

type Table = BTreeMap<ModelId, Value>;

#[derive(Default)]
struct ModelHooks {
    after_mutation: Vec<Arc<dyn MutationHook>>,
    before_delete: Vec<Arc<dyn MutationHook>>,
}

/// A [`SystemOfRecord`] and [`MutationObserver`] over in-process tables.
#[derive(Default)]
pub struct InMemorySystemOfRecord {
    tables: RwLock<HashMap<String, Table>>,
    hooks: RwLock<HashMap<String, ModelHooks>>,
    failing: AtomicBool,
}

impl std::fmt::Debug for InMemorySystemOfRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySystemOfRecord")
            .field("models", &self.models())
            .finish_non_exhaustive()
    }
}

impl InMemorySystemOfRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, model_name: &str) -> Self {
        self.define_model(model_name);
        self
    }

    fn read_tables(&self) -> CacheResult<RwLockReadGuard<'_, HashMap<String, Table>>> {
        Ok(self.tables.read().map_err(|_| SourceError::LockPoisoned)?)
    }

    fn write_tables(&self) -> CacheResult<RwLockWriteGuard<'_, HashMap<String, Table>>> {
        Ok(self.tables.write().map_err(|_| SourceError::LockPoisoned)?)
    }

    /// Declare a model. Existing rows are kept.
    pub fn define_model(&self, model_name: &str) {
        if let Ok(mut tables) = self.tables.write() {
            tables.entry(model_name.to_string()).or_default();
        }
    }

    /// Defined model names, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Make every subsequent `find` fail with [`SourceError::QueryFailed`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn count(&self, model_name: &str) -> usize {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(model_name).map(Table::len))
            .unwrap_or(0)
    }

    /// Load rows without running hooks. Rows without an id are skipped.
    pub fn seed<I>(&self, model_name: &str, rows: I) -> CacheResult<usize>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut tables = self.write_tables()?;
        let table = tables.entry(model_name.to_string()).or_default();
        let mut loaded = 0;
        for row in rows {
            if let Some(id) = ModelId::from_payload(&row) {
                table.insert(id, row);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Insert a row, assigning the next numeric id when it has none, then run
    /// `after_mutation` hooks.
    pub async fn insert(&self, model_name: &str, mut row: Value) -> CacheResult<Value> {
        {
            let mut tables = self.write_tables()?;
            let table = tables
                .get_mut(model_name)
                .ok_or_else(|| unknown_model(model_name))?;
            let id = match ModelId::from_payload(&row) {
                Some(id) => id,
                None => {
                    let next = table.keys().filter_map(ModelId::as_number).max().unwrap_or(0) + 1;
                    if let Some(object) = row.as_object_mut() {
                        object.insert("id".to_string(), json!(next));
                    }
                    ModelId::Number(next)
                }
            };
            table.insert(id, row.clone());
        }
        self.run_after_hooks(&Mutation::created(model_name, row.clone()))
            .await?;
        Ok(row)
    }

    /// Merge `patch` into one row, then run `after_mutation` hooks.
    pub async fn update(
        &self,
        model_name: &str,
        id: impl Into<ModelId>,
        patch: Value,
    ) -> CacheResult<Value> {
        let id = id.into();
        let updated = {
            let mut tables = self.write_tables()?;
            let table = tables
                .get_mut(model_name)
                .ok_or_else(|| unknown_model(model_name))?;
            let row = table.get_mut(&id).ok_or_else(|| SourceError::QueryFailed {
                model_name: model_name.to_string(),
                reason: format!("no record with id {}", id),
            })?;
            merge(row, &patch);
            row.clone()
        };
        self.run_after_hooks(&Mutation::updated(model_name, updated.clone()))
            .await?;
        Ok(updated)
    }

    /// Merge `patch` into every row matching `where_filter`, then run
    /// `after_mutation` hooks once with the filter and the partial data.
    pub async fn update_where(
        &self,
        model_name: &str,
        where_filter: Value,
        patch: Value,
    ) -> CacheResult<usize> {
        let touched = {
            let mut tables = self.write_tables()?;
            let table = tables
                .get_mut(model_name)
                .ok_or_else(|| unknown_model(model_name))?;
            let mut touched = 0;
            for row in table.values_mut() {
                if matches_where(row, &where_filter) {
                    merge(row, &patch);
                    touched += 1;
                }
            }
            touched
        };
        self.run_after_hooks(&Mutation::updated_where(model_name, where_filter, patch))
            .await?;
        Ok(touched)
    }

    /// Run `before_delete` hooks, then remove every row matching `where_filter`.
    pub async fn delete_where(&self, model_name: &str, where_filter: Value) -> CacheResult<usize> {
        if !self.has_model(model_name) {
            return Err(unknown_model(model_name).into());
        }
        let hooks = self.hooks_for(model_name, |h| &h.before_delete)?;
        let deletion = Deletion::new(model_name, where_filter.clone());
        for hook in &hooks {
            hook.before_delete(&deletion).await;
        }

        let mut tables = self.write_tables()?;
        let table = tables
            .get_mut(model_name)
            .ok_or_else(|| unknown_model(model_name))?;
        let before = table.len();
        table.retain(|_, row| !matches_where(row, &where_filter));
        let removed = before - table.len();
        debug!(model_name = %model_name, removed, "Deleted rows");
        Ok(removed)
    }

    pub async fn delete_by_id(&self, model_name: &str, id: impl Into<ModelId>) -> CacheResult<usize> {
        let id = id.into();
        self.delete_where(model_name, json!({ "id": id.to_value() }))
            .await
    }

    fn hooks_for(
        &self,
        model_name: &str,
        select: impl Fn(&ModelHooks) -> &Vec<Arc<dyn MutationHook>>,
    ) -> CacheResult<Vec<Arc<dyn MutationHook>>> {
        let hooks = self.hooks.read().map_err(|_| SourceError::LockPoisoned)?;
        Ok(hooks.get(model_name).map(|h| select(h).clone()).unwrap_or_default())
    }

    async fn run_after_hooks(&self, mutation: &Mutation) -> CacheResult<()> {
        let hooks = self.hooks_for(&mutation.model_name, |h| &h.after_mutation)?;
        for hook in &hooks {
            hook.after_mutation(mutation).await;
        }
        Ok(())
    }

    fn register(
        &self,
        model_name: &str,
        hook: Arc<dyn MutationHook>,
        select: impl FnOnce(&mut ModelHooks) -> &mut Vec<Arc<dyn MutationHook>>,
    ) -> CacheResult<()> {
        if !self.has_model(model_name) {
            return Err(unknown_model(model_name).into());
        }
        let mut hooks = self.hooks.write().map_err(|_| SourceError::LockPoisoned)?;
        select(hooks.entry(model_name.to_string()).or_default()).push(hook);
        Ok(())
    }
}

fn unknown_model(model_name: &str) -> SourceError {
    SourceError::UnknownModel {
        model_name: model_name.to_string(),
    }
}

/// Shallow merge of object fields; a non-object patch replaces the row.
fn merge(row: &mut Value, patch: &Value) {
    match (row.as_object_mut(), patch.as_object()) {
        (Some(target), Some(fields)) => {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *row = patch.clone(),
    }
}

#[async_trait]
impl SystemOfRecord for InMemorySystemOfRecord {
    fn has_model(&self, model_name: &str) -> bool {
        self.tables
            .read()
            .map(|tables| tables.contains_key(model_name))
            .unwrap_or(false)
    }

    async fn find(&self, model_name: &str, query: &FindQuery) -> CacheResult<Vec<Value>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::QueryFailed {
                model_name: model_name.to_string(),
                reason: "source unavailable".to_string(),
            }
            .into());
        }
        let tables = self.read_tables()?;
        let table = tables
            .get(model_name)
            .ok_or_else(|| unknown_model(model_name))?;
        Ok(table
            .values()
            .filter(|row| query.matches(row))
            .map(|row| query.project(row))
            .collect())
    }
}

impl MutationObserver for InMemorySystemOfRecord {
    fn on_after_mutation(&self, model_name: &str, hook: Arc<dyn MutationHook>) -> CacheResult<()> {
        self.register(model_name, hook, |h| &mut h.after_mutation)
    }

    fn on_before_delete(&self, model_name: &str, hook: Arc<dyn MutationHook>) -> CacheResult<()> {
        self.register(model_name, hook, |h| &mut h.before_delete)
    }

    fn remove_hooks(&self, model_name: &str, hook: &Arc<dyn MutationHook>) -> CacheResult<usize> {
        let mut hooks = self.hooks.write().map_err(|_| SourceError::LockPoisoned)?;
        let Some(registered) = hooks.get_mut(model_name) else {
            return Ok(0);
        };
        let before = registered.after_mutation.len() + registered.before_delete.len();
        registered.after_mutation.retain(|h| !same_hook(h, hook));
        registered.before_delete.retain(|h| !same_hook(h, hook));
        Ok(before - registered.after_mutation.len() - registered.before_delete.len())
    }
}
