//! Concurrent replica store
//!
//! The key table itself is a sharded concurrent map; inserting and evicting
//! entries never takes an entry lock, and mutating an entry never takes a
//! table-wide lock. Removal marks the entry under its own lock before it is
//! evicted, so a command still holding the old entry sees `removed` and
//! backs off.

use crate::entry::{CacheEntry, EntryState};
use crate::merge::{ApplyOutcome, MergeEngine, Update};
use dashmap::DashMap;
use replikv_common::{InstanceId, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Decides whether an entry is idle: `(state, now, idle_for_ms)`
pub type IdlePredicate = Arc<dyn Fn(&EntryState, i64, i64) -> bool + Send + Sync>;

/// Idle when unaccessed for longer than the entry's own limit, or the
/// sweep threshold if the entry has none
pub fn default_idle_predicate() -> IdlePredicate {
    Arc::new(|state: &EntryState, now: i64, idle_for_ms: i64| {
        let limit = if state.max_idle_ms > 0 {
            state.max_idle_ms
        } else {
            idle_for_ms
        };
        limit >= 0 && now.saturating_sub(state.last_accessed_at) > limit
    })
}

/// Per-node table of cache entries
pub struct ReplicaStore {
    entries: DashMap<String, Arc<CacheEntry>>,
    merge: MergeEngine,
    is_idle: IdlePredicate,
    sweeping: AtomicBool,
}

/// Clears the sweep flag when the sweep ends, including by panic
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ReplicaStore {
    pub fn new(merge: MergeEngine) -> Self {
        Self::with_idle_predicate(merge, default_idle_predicate())
    }

    pub fn with_idle_predicate(merge: MergeEngine, is_idle: IdlePredicate) -> Self {
        Self {
            entries: DashMap::new(),
            merge,
            is_idle,
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    /// Get the entry for `key`, creating it if absent. Write paths only.
    pub fn get_or_create(&self, key: &str) -> Arc<CacheEntry> {
        if let Some(entry) = self.entries.get(key) {
            return Arc::clone(entry.value());
        }
        Arc::clone(
            self.entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CacheEntry::new(key)))
                .value(),
        )
    }

    /// Look up an entry without creating one
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Mark the entry removed and evict it. Returns false if absent.
    pub fn remove(&self, key: &str) -> bool {
        let Some(entry) = self.get(key) else {
            return false;
        };
        entry.lock().mark_removed();
        self.evict(key, &entry);
        trace!(key, "entry removed");
        true
    }

    /// Remove `key` only if this node holds it as a replica copy
    pub fn remove_replica(&self, key: &str) -> bool {
        let Some(entry) = self.get(key) else {
            return false;
        };
        {
            let mut state = entry.lock();
            if !state.is_replica_node {
                return false;
            }
            state.mark_removed();
        }
        self.evict(key, &entry);
        true
    }

    /// Only evict the exact entry that was marked; a fresh write may
    /// already have replaced it
    fn evict(&self, key: &str, entry: &Arc<CacheEntry>) {
        self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, entry));
    }

    /// Offer a replicated update to `key`'s entry
    pub fn apply(&self, key: &str, update: Update) -> Result<ApplyOutcome> {
        self.apply_from(key, update, None)
    }

    /// Like [`apply`](Self::apply), remembering `origin` as the member that
    /// holds the primary copy
    pub fn apply_from(
        &self,
        key: &str,
        update: Update,
        origin: Option<&InstanceId>,
    ) -> Result<ApplyOutcome> {
        let entry = self.get_or_create(key);
        let mut state = entry.lock();
        let outcome = self.merge.apply(&mut state, update)?;
        if matches!(outcome, ApplyOutcome::Applied { .. }) {
            state.is_replica_node = true;
            if let Some(origin) = origin {
                state.replica_location = Some(origin.clone());
            }
        }
        Ok(outcome)
    }

    /// Sweep idle entries and return how many were removed.
    ///
    /// Single-flight: if a sweep is already running this returns 0 at once.
    pub fn remove_expired(&self, now: i64, idle_for_ms: i64) -> usize {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("idle sweep already running");
            return 0;
        }
        let _guard = SweepGuard(&self.sweeping);

        // collected first so no map shard stays locked while entry locks are taken
        let candidates: Vec<(String, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut removed = 0;
        for (key, entry) in candidates {
            {
                let mut state = entry.lock();
                if state.is_removed() || !(self.is_idle)(&state, now, idle_for_ms) {
                    continue;
                }
                state.mark_removed();
            }
            self.evict(&key, &entry);
            removed += 1;
        }

        if removed > 0 {
            debug!(removed, idle_for_ms, "idle sweep removed entries");
        }
        removed
    }

    /// Check if a sweep is in progress
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// Number of entries in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries holding a readable value
    pub fn live_count(&self) -> usize {
        self.count_where(EntryState::is_live)
    }

    /// Entries held as replica copies for another member
    pub fn replica_count(&self) -> usize {
        self.count_where(|s| s.is_live() && s.is_replica_node)
    }

    fn count_where(&self, f: impl Fn(&EntryState) -> bool) -> usize {
        let entries: Vec<Arc<CacheEntry>> =
            self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        entries.iter().filter(|e| f(&e.lock())).count()
    }

    /// Keys currently in the table
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Mark every entry removed and empty the table
    pub fn clear(&self) {
        for key in self.keys() {
            self.remove(&key);
        }
    }
}

impl std::fmt::Debug for ReplicaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaStore")
            .field("entries", &self.entries.len())
            .field("merge", &self.merge)
            .finish()
    }
}
