//! Per-key cache entry

use crate::merge::Update;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use replikv_common::{InstanceId, Version, INITIAL_VERSION};
use std::collections::BTreeMap;

/// Mutable state of one key.
///
/// Only reachable through [`CacheEntry::lock`], so every read that must be
/// consistent with a concurrent write sees a single snapshot.
#[derive(Debug, Clone)]
pub struct EntryState {
    /// Last applied version
    pub version: Version,
    /// Serialized value
    pub raw_value: Option<Bytes>,
    /// Last access time (milliseconds since epoch)
    pub last_accessed_at: i64,
    /// Idle limit for this entry (milliseconds, 0 = sweep threshold)
    pub max_idle_ms: i64,
    /// This node holds the replica copy, not the primary
    pub is_replica_node: bool,
    /// Last known member holding the counterpart copy
    pub replica_location: Option<InstanceId>,
    /// Updates waiting for their predecessor, keyed by version
    pub(crate) pending: BTreeMap<Version, Update>,
    removed: bool,
}

impl EntryState {
    fn new() -> Self {
        Self {
            version: INITIAL_VERSION,
            raw_value: None,
            last_accessed_at: 0,
            max_idle_ms: 0,
            is_replica_node: false,
            replica_location: None,
            pending: BTreeMap::new(),
            removed: false,
        }
    }

    /// Check if the entry has never applied an update
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.version == INITIAL_VERSION
    }

    /// Check if the entry was removed; removed entries never come back
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Check if the entry holds a readable value
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.removed && self.raw_value.is_some()
    }

    /// Number of updates buffered behind a missing predecessor
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Versions currently buffered, lowest first
    pub fn pending_versions(&self) -> impl Iterator<Item = Version> + '_ {
        self.pending.keys().copied()
    }

    /// Record a write made by this node and return the new version.
    ///
    /// The local node becomes the primary, so anything still buffered from
    /// a previous primary is dropped.
    pub fn record_local_write(&mut self, raw_value: Bytes, now: i64, max_idle_ms: i64) -> Version {
        self.version = self.version.max(INITIAL_VERSION) + 1;
        self.raw_value = Some(raw_value);
        self.last_accessed_at = now;
        self.max_idle_ms = max_idle_ms;
        self.is_replica_node = false;
        self.pending.clear();
        self.version
    }

    /// Adopt a copy fetched from another member.
    ///
    /// Returns false when the local copy is already at least as new.
    pub(crate) fn adopt_loaded(
        &mut self,
        version: Version,
        raw_value: Bytes,
        last_accessed_at: i64,
        max_idle_ms: i64,
        holder: InstanceId,
    ) -> bool {
        if self.removed || (self.raw_value.is_some() && version <= self.version) {
            return false;
        }
        self.version = version;
        self.raw_value = Some(raw_value);
        self.last_accessed_at = last_accessed_at;
        self.max_idle_ms = max_idle_ms;
        self.is_replica_node = false;
        self.replica_location = Some(holder);
        self.pending.retain(|v, _| *v > version);
        true
    }

    pub(crate) fn mark_removed(&mut self) {
        self.removed = true;
        self.raw_value = None;
        self.pending.clear();
    }
}

/// One key's entry in the replica store
#[derive(Debug)]
pub struct CacheEntry {
    key: String,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(EntryState::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Take the entry's lock
    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> EntryState {
        self.state.lock().clone()
    }
}
