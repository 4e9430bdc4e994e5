//! Apply engine.
//!
//! Folds validated change records into a [`LocalStore`]:
//!
//! - records for unwatched models are discarded
//! - `create` and `prime` write only when the slot is empty or holds a value
//!   without an identifier
//! - `update` overwrites; a versioned update never replaces a newer entry
//! - `delete` removes, and is a no-op when the id is absent
//!
//! Applying never fails. Malformed input is logged and dropped.

use cachemachine_core::{ChangeRecord, MethodName, RecordError, WireRecord};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::store::{CachedEntry, LocalStore};

/// Why a valid record left the store untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The model has no bucket.
    Unwatched,
    /// `create`/`prime` found an existing record with an identifier.
    AlreadyPresent,
    /// A versioned update older than (or equal to) the stored version.
    StaleVersion,
    /// `delete` of an id that is not cached.
    NotPresent,
}

/// Result of applying one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Removed,
    Skipped(SkipReason),
    Rejected(RecordError),
}

impl ApplyOutcome {
    /// Whether the store changed.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted | ApplyOutcome::Replaced | ApplyOutcome::Removed
        )
    }
}

/// Counters over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub inserted: usize,
    pub replaced: usize,
    pub removed: usize,
    pub skipped: usize,
    pub rejected: usize,
}

impl ApplyReport {
    pub fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Replaced => self.replaced += 1,
            ApplyOutcome::Removed => self.removed += 1,
            ApplyOutcome::Skipped(_) => self.skipped += 1,
            ApplyOutcome::Rejected(_) => self.rejected += 1,
        }
    }

    pub fn writes(&self) -> usize {
        self.inserted + self.replaced + self.removed
    }

    pub fn total(&self) -> usize {
        self.writes() + self.skipped + self.rejected
    }
}

/// A decoded batch: the records that passed validation, in arrival order,
/// and what applying them did.
///
/// Valid records are kept even when the store skipped them, so the event
/// dispatcher still sees changes to event-only models.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedBatch {
    pub records: Vec<ChangeRecord>,
    pub report: ApplyReport,
}

/// Apply one typed record.
pub fn apply(store: &LocalStore, record: &ChangeRecord) -> ApplyOutcome {
    if let Err(err) = record.check() {
        warn!(
            error = %err,
            model_name = %record.model_name,
            method = %record.method_name,
            "Dropping invalid change record"
        );
        return ApplyOutcome::Rejected(err);
    }

    let id = record.resolved_id();
    let outcome = store.with_bucket_mut(&record.model_name, |bucket| {
        match record.method_name {
            MethodName::Create | MethodName::Prime => {
                if bucket.get(&id).is_some_and(CachedEntry::has_identifier) {
                    return ApplyOutcome::Skipped(SkipReason::AlreadyPresent);
                }
                let data = record.data.clone().unwrap_or(Value::Null);
                match bucket.insert(id.clone(), CachedEntry::new(data, record.version)) {
                    Some(_) => ApplyOutcome::Replaced,
                    None => ApplyOutcome::Inserted,
                }
            }
            MethodName::Update => {
                if let (Some(incoming), Some(stored)) = (
                    record.version,
                    bucket.get(&id).and_then(|entry| entry.version),
                ) {
                    if incoming <= stored {
                        return ApplyOutcome::Skipped(SkipReason::StaleVersion);
                    }
                }
                let data = record.data.clone().unwrap_or(Value::Null);
                match bucket.insert(id.clone(), CachedEntry::new(data, record.version)) {
                    Some(_) => ApplyOutcome::Replaced,
                    None => ApplyOutcome::Inserted,
                }
            }
            MethodName::Delete => match bucket.remove(&id) {
                Some(_) => ApplyOutcome::Removed,
                None => ApplyOutcome::Skipped(SkipReason::NotPresent),
            },
        }
    });

    let outcome = outcome.unwrap_or(ApplyOutcome::Skipped(SkipReason::Unwatched));
    trace!(
        model_name = %record.model_name,
        method = %record.method_name,
        model_id = %id,
        outcome = ?outcome,
        "Applied change record"
    );
    outcome
}

/// Validate a raw wire value. Failures are logged with the offending payload.
pub fn validate_value(value: &Value) -> Result<ChangeRecord, RecordError> {
    WireRecord::from_value(value)
        .and_then(WireRecord::validate)
        .inspect_err(|err| {
            warn!(error = %err, payload = %value, "Dropping malformed change record");
        })
}

/// Validate and apply one raw wire value.
pub fn apply_value(store: &LocalStore, value: &Value) -> ApplyOutcome {
    match validate_value(value) {
        Ok(record) => apply(store, &record),
        Err(err) => ApplyOutcome::Rejected(err),
    }
}

/// Validate and apply a batch of raw values in order.
pub fn apply_values(store: &LocalStore, values: &[Value]) -> AppliedBatch {
    let mut batch = AppliedBatch::default();
    for value in values {
        match validate_value(value) {
            Ok(record) => {
                let outcome = apply(store, &record);
                batch.report.record(&outcome);
                batch.records.push(record);
            }
            Err(err) => batch.report.record(&ApplyOutcome::Rejected(err)),
        }
    }
    debug!(
        inserted = batch.report.inserted,
        replaced = batch.report.replaced,
        removed = batch.report.removed,
        skipped = batch.report.skipped,
        rejected = batch.report.rejected,
        "Applied batch"
    );
    batch
}

/// Decode message bytes and apply every record in them.
///
/// Bytes that are not a JSON array (or single object) yield an empty batch
/// with one rejection.
pub fn apply_batch(store: &LocalStore, bytes: &[u8]) -> AppliedBatch {
    match cachemachine_core::decode_batch(bytes) {
        Ok(values) => apply_values(store, &values),
        Err(err) => {
            warn!(error = %err, bytes = bytes.len(), "Dropping undecodable message");
            let mut batch = AppliedBatch::default();
            batch.report.record(&ApplyOutcome::Rejected(err));
            batch
        }
    }
}
