//! Core type definitions for replikv
//!
//! Identifiers for cluster members, per-key version numbers and the wall
//! clock helpers shared by the store and the replication protocol.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-key version number.
///
/// Versions are minted by whichever node last wrote the key and only ever
/// grow. Zero means "never written".
pub type Version = i64;

/// Version held by an entry that has not applied any update yet
pub const INITIAL_VERSION: Version = 0;

/// Identifier of a cluster member (instance)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct InstanceId(String);

impl InstanceId {
    /// Create a new instance identifier
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if the identifier is empty.
    ///
    /// Empty identifiers show up as "no hint" and are never a valid target.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for InstanceId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({:?})", self.0)
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id() {
        let id = InstanceId::from("node-a");
        assert_eq!(id.as_str(), "node-a");
        assert_eq!(id.to_string(), "node-a");
        assert_eq!(format!("{id:?}"), "InstanceId(\"node-a\")");
        assert!(!id.is_empty());
        assert!(InstanceId::new("").is_empty());
    }

    #[test]
    fn test_instance_id_ordering() {
        let mut ids = vec![InstanceId::from("c"), InstanceId::from("a"), InstanceId::from("b")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "a");
    }

    #[test]
    fn test_now_millis_monotone_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(a > 0);
        assert!(b >= a);
    }
}
