//! Versioned merge engine
//!
//! Incoming saves and touches are applied to an entry in strict version
//! order. For an entry at version `c` receiving version `v`:
//!
//! - `v <= c`: stale, dropped
//! - `v == c + 1`: applied, then buffered successors are drained while the
//!   next one is exactly `c + 1`
//! - `v > c + 1`: buffered until its predecessor arrives
//!
//! Final state therefore converges no matter how the transport reorders
//! delivery. A successor whose predecessor is lost for good stays buffered
//! until the entry is rewritten locally or removed.

use crate::entry::EntryState;
use crate::fields::{decode_fields, encode_fields, FieldDelta, FieldMap};
use bytes::Bytes;
use replikv_common::{InstanceId, Result, Version};
use std::sync::Arc;
use tracing::{trace, warn};

/// What an update carries besides its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    /// New value, whole or as a field delta
    Save { payload: Bytes, partial: bool },
    /// Access time and idle limit only
    Touch,
}

/// A replicated change to one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub version: Version,
    pub last_accessed_at: i64,
    pub max_idle_ms: i64,
    pub kind: UpdateKind,
}

impl Update {
    pub fn save(version: Version, last_accessed_at: i64, max_idle_ms: i64, payload: Bytes) -> Self {
        Self {
            version,
            last_accessed_at,
            max_idle_ms,
            kind: UpdateKind::Save {
                payload,
                partial: false,
            },
        }
    }

    pub fn partial_save(
        version: Version,
        last_accessed_at: i64,
        max_idle_ms: i64,
        delta: Bytes,
    ) -> Self {
        Self {
            version,
            last_accessed_at,
            max_idle_ms,
            kind: UpdateKind::Save {
                payload: delta,
                partial: true,
            },
        }
    }

    pub fn touch(version: Version, last_accessed_at: i64, max_idle_ms: i64) -> Self {
        Self {
            version,
            last_accessed_at,
            max_idle_ms,
            kind: UpdateKind::Touch,
        }
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(self.kind, UpdateKind::Save { partial: true, .. })
    }
}

/// Result of offering an update to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied; `drained` buffered successors were applied after it
    Applied { version: Version, drained: usize },
    /// Waiting for a predecessor
    Buffered { pending: usize },
    /// Version already superseded
    Stale,
    /// Entry was removed
    Discarded,
}

/// How a payload lands in an entry
pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce the new serialized value from the current one and a payload
    fn merge(&self, current: Option<&Bytes>, payload: &Bytes, partial: bool) -> Result<Bytes>;

    /// Payload to ship when the receiver already holds `previous`.
    ///
    /// `None` means send `current` whole.
    fn outgoing(&self, _previous: &Bytes, _current: &Bytes) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

/// Every update replaces the whole value
#[derive(Debug, Default, Clone, Copy)]
pub struct FullReplace;

impl MergeStrategy for FullReplace {
    fn name(&self) -> &'static str {
        "full"
    }

    fn merge(&self, _current: Option<&Bytes>, payload: &Bytes, _partial: bool) -> Result<Bytes> {
        Ok(payload.clone())
    }
}

/// Values are [`FieldMap`]s and updates carry only the changed fields
#[derive(Debug, Default, Clone, Copy)]
pub struct DirtyFieldMerge;

impl MergeStrategy for DirtyFieldMerge {
    fn name(&self) -> &'static str {
        "dirty_fields"
    }

    fn merge(&self, current: Option<&Bytes>, payload: &Bytes, partial: bool) -> Result<Bytes> {
        if !partial {
            // validate before replacing
            decode_fields(payload)?;
            return Ok(payload.clone());
        }
        let mut fields: FieldMap = match current {
            Some(bytes) => decode_fields(bytes)?,
            None => FieldMap::new(),
        };
        FieldDelta::decode(payload)?.apply_to(&mut fields);
        encode_fields(&fields)
    }

    fn outgoing(&self, previous: &Bytes, current: &Bytes) -> Result<Option<Bytes>> {
        let old = decode_fields(previous)?;
        let new = decode_fields(current)?;
        FieldDelta::diff(&old, &new).encode().map(Some)
    }
}

/// Applies updates to entries in version order using a [`MergeStrategy`]
#[derive(Clone)]
pub struct MergeEngine {
    strategy: Arc<dyn MergeStrategy>,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(Arc::new(FullReplace))
    }
}

impl MergeEngine {
    pub fn new(strategy: Arc<dyn MergeStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &dyn MergeStrategy {
        self.strategy.as_ref()
    }

    /// Offer an update to an entry; the caller holds the entry's lock.
    ///
    /// A fresh entry adopts the first full save whatever its version, so a
    /// replica that joins mid-sequence starts from the sender's version.
    /// Touches and partial saves carry no value of their own and are
    /// buffered until a full copy arrives.
    pub fn apply(&self, state: &mut EntryState, update: Update) -> Result<ApplyOutcome> {
        if state.is_removed() {
            return Ok(ApplyOutcome::Discarded);
        }

        let current = state.version;
        let version = update.version;
        if version <= current {
            trace!(current, version, "stale update dropped");
            return Ok(ApplyOutcome::Stale);
        }

        let ready = if state.is_fresh() {
            matches!(update.kind, UpdateKind::Save { partial: false, .. })
        } else {
            version == current + 1
        };
        if !ready {
            state.pending.entry(version).or_insert(update);
            let pending = state.pending.len();
            trace!(current, version, pending, "update buffered");
            return Ok(ApplyOutcome::Buffered { pending });
        }

        self.apply_one(state, &update)?;
        let drained = self.drain(state);
        Ok(ApplyOutcome::Applied {
            version: state.version,
            drained,
        })
    }

    /// Adopt a copy loaded from `holder`, then apply any buffered
    /// successors it unblocks. Returns false if the local copy was kept.
    pub fn adopt_loaded(
        &self,
        state: &mut EntryState,
        version: Version,
        raw_value: Bytes,
        last_accessed_at: i64,
        max_idle_ms: i64,
        holder: InstanceId,
    ) -> bool {
        if !state.adopt_loaded(version, raw_value, last_accessed_at, max_idle_ms, holder) {
            return false;
        }
        let drained = self.drain(state);
        if drained > 0 {
            trace!(version, drained, now = state.version, "drained after load");
        }
        true
    }

    /// Apply buffered successors while the next one is exactly in order
    fn drain(&self, state: &mut EntryState) -> usize {
        let mut drained = 0;
        loop {
            while let Some(entry) = state.pending.first_entry() {
                if *entry.key() > state.version {
                    break;
                }
                entry.remove();
            }

            let Some(entry) = state.pending.first_entry() else {
                break;
            };
            if *entry.key() != state.version + 1 {
                break;
            }
            let update = entry.remove();
            if let Err(e) = self.apply_one(state, &update) {
                // consumed anyway so later versions are not stuck behind it
                warn!(version = update.version, error = %e, "buffered update failed to merge");
                state.version = update.version;
            }
            drained += 1;
        }
        drained
    }

    fn apply_one(&self, state: &mut EntryState, update: &Update) -> Result<()> {
        if let UpdateKind::Save { payload, partial } = &update.kind {
            let merged = self
                .strategy
                .merge(state.raw_value.as_ref(), payload, *partial)?;
            state.raw_value = Some(merged);
        }
        state.version = update.version;
        state.last_accessed_at = update.last_accessed_at;
        state.max_idle_ms = update.max_idle_ms;
        Ok(())
    }

    /// Wire payload for replicating `current` to a member that may hold
    /// `previous`. Returns `(payload, partial)`.
    pub fn outgoing_payload(
        &self,
        previous: Option<&Bytes>,
        current: &Bytes,
    ) -> Result<(Bytes, bool)> {
        match previous {
            Some(previous) => match self.strategy.outgoing(previous, current)? {
                Some(delta) => Ok((delta, true)),
                None => Ok((current.clone(), false)),
            },
            None => Ok((current.clone(), false)),
        }
    }
}
