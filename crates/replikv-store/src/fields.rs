//! Structured values for dirty-field replication
//!
//! A structured value is an ordered map of field name to serialized field
//! bytes. Replicating it after the first full copy only ships the fields
//! that changed, as a [`FieldDelta`].

use bytes::Bytes;
use replikv_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field name to serialized field value
pub type FieldMap = BTreeMap<String, Vec<u8>>;

/// The fields that changed between two versions of a [`FieldMap`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDelta {
    /// Fields added or modified
    pub set: BTreeMap<String, Vec<u8>>,
    /// Fields deleted
    pub removed: Vec<String>,
}

impl FieldDelta {
    /// Compute what changed from `old` to `new`
    #[must_use]
    pub fn diff(old: &FieldMap, new: &FieldMap) -> Self {
        let set = new
            .iter()
            .filter(|(name, value)| old.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let removed = old
            .keys()
            .filter(|name| !new.contains_key(*name))
            .cloned()
            .collect();
        Self { set, removed }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Merge this delta into `fields`
    pub fn apply_to(&self, fields: &mut FieldMap) {
        for name in &self.removed {
            fields.remove(name);
        }
        for (name, value) in &self.set {
            fields.insert(name.clone(), value.clone());
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| Error::codec(format!("field delta: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::codec(format!("field delta: {e}")))
    }
}

/// Serialize a field map
pub fn encode_fields(fields: &FieldMap) -> Result<Bytes> {
    bincode::serialize(fields)
        .map(Bytes::from)
        .map_err(|e| Error::codec(format!("field map: {e}")))
}

/// Deserialize a field map
pub fn decode_fields(bytes: &[u8]) -> Result<FieldMap> {
    bincode::deserialize(bytes).map_err(|e| Error::codec(format!("field map: {e}")))
}
