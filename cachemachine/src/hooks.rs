//! Installs publisher hooks on the system of record, once per model.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use cachemachine_core::CacheResult;
use cachemachine_storage::{MutationHook, MutationObserver, SystemOfRecord};
use tracing::{debug, warn};

pub struct ModelHooks {
    observer: Arc<dyn MutationObserver>,
    source: Arc<dyn SystemOfRecord>,
    hook: Arc<dyn MutationHook>,
    hooked: Mutex<BTreeSet<String>>,
}

impl ModelHooks {
    pub fn new(
        observer: Arc<dyn MutationObserver>,
        source: Arc<dyn SystemOfRecord>,
        hook: Arc<dyn MutationHook>,
    ) -> Self {
        Self {
            observer,
            source,
            hook,
            hooked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Hook `model_name` if the source knows it and it is not hooked yet.
    /// Returns whether hooks were installed by this call.
    pub fn ensure(&self, model_name: &str) -> CacheResult<bool> {
        let mut hooked = self.hooked.lock().unwrap_or_else(PoisonError::into_inner);
        if hooked.contains(model_name) {
            return Ok(false);
        }
        if !self.source.has_model(model_name) {
            warn!(model_name = %model_name, "Model unknown to the system of record, not hooked");
            return Ok(false);
        }
        self.observer
            .on_after_mutation(model_name, self.hook.clone())?;
        self.observer
            .on_before_delete(model_name, self.hook.clone())?;
        hooked.insert(model_name.to_string());
        debug!(model_name = %model_name, "Installed mutation hooks");
        Ok(true)
    }

    /// Hook every model, logging (not failing on) per-model errors.
    pub fn ensure_all<'a, I>(&self, models: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        models
            .into_iter()
            .filter(|model| match self.ensure(model) {
                Ok(installed) => installed,
                Err(err) => {
                    warn!(error = %err, model_name = %model, "Failed to install mutation hooks");
                    false
                }
            })
            .count()
    }

    /// Unregister the publisher from every hooked model. Returns the number
    /// of models released.
    pub fn release(&self) -> usize {
        let models = std::mem::take(
            &mut *self.hooked.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for model_name in &models {
            match self.observer.remove_hooks(model_name, &self.hook) {
                Ok(removed) => {
                    debug!(model_name = %model_name, removed, "Released mutation hooks")
                }
                Err(err) => {
                    warn!(error = %err, model_name = %model_name, "Failed to release mutation hooks")
                }
            }
        }
        models.len()
    }

    pub fn hooked_models(&self) -> Vec<String> {
        self.hooked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
