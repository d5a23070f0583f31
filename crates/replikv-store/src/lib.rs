//! replikv Store - per-key state, version ordering and the replica table
//!
//! # Components
//!
//! - **CacheEntry**: one per live key, every field behind the entry's own lock
//! - **MergeEngine**: applies incoming saves and touches in strict version
//!   order, buffering anything that arrives ahead of its predecessor
//! - **MergeStrategy**: how a payload lands in an entry (full replace or
//!   dirty-field merge)
//! - **ReplicaStore**: the concurrent key table with a single-flight idle sweep

pub mod entry;
pub mod fields;
pub mod merge;
pub mod store;

pub use entry::{CacheEntry, EntryState};
pub use fields::{FieldDelta, FieldMap};
pub use merge::{
    ApplyOutcome, DirtyFieldMerge, FullReplace, MergeEngine, MergeStrategy, Update, UpdateKind,
};
pub use store::{default_idle_predicate, IdlePredicate, ReplicaStore};
