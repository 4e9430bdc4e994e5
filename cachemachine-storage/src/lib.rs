//! cache-machine Storage - Local Store and Apply Engine
//!
//! The replica side of the system: a per-process [`LocalStore`] and the
//! rules that fold change records into it. Also defines the traits through
//! which a server reads from and observes its system of record.

pub mod apply;
pub mod memory;
pub mod source;
pub mod store;

pub use apply::{
    apply, apply_batch, apply_value, apply_values, validate_value, AppliedBatch, ApplyOutcome,
    ApplyReport, SkipReason,
};
pub use memory::InMemorySystemOfRecord;
pub use source::{
    matches_where, membership_set, project, same_hook, Deletion, FindQuery, Mutation,
    MutationHook, MutationObserver, MutationTarget, SystemOfRecord,
};
pub use store::{Bucket, CachedEntry, LocalStore, Snapshot};
