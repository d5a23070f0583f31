//! Configuration types for replikv
//!
//! This module defines the configuration structures used by the store,
//! the dispatcher and the cache facade. Every field has a default so a
//! partial TOML document is enough.

use crate::error::{Error, Result};
use crate::types::InstanceId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration for a replikv node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity
    #[serde(default)]
    pub node: NodeConfig,
    /// Replication protocol tuning
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Command dispatcher and worker pool
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Create a configuration for the given instance and store name
    pub fn new(instance: impl Into<InstanceId>, store_name: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                instance: instance.into(),
                store_name: store_name.into(),
            },
            ..Self::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check the configuration for values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.node.instance.is_empty() {
            return Err(Error::configuration("node.instance must not be empty"));
        }
        if self.node.store_name.is_empty() {
            return Err(Error::configuration("node.store_name must not be empty"));
        }
        if self.dispatcher.core_workers == 0 {
            return Err(Error::configuration("dispatcher.core_workers must be at least 1"));
        }
        if self.dispatcher.max_workers < self.dispatcher.core_workers {
            return Err(Error::configuration(
                "dispatcher.max_workers must not be below core_workers",
            ));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(Error::configuration("dispatcher.queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's cluster instance id
    pub instance: InstanceId,
    /// Name of the replicated store (the replication group)
    pub store_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance: InstanceId::from("replikv-node"),
            store_name: "default".to_string(),
        }
    }
}

/// How incoming Save payloads are merged into an entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Every update replaces the whole value
    #[default]
    Full,
    /// Updates carry only the fields that changed
    DirtyFields,
}

/// Replication protocol configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Block writes until the replica acknowledges them
    pub synchronous_writes: bool,
    /// Wait for a Save/Touch acknowledgement (milliseconds)
    pub ack_timeout_ms: u64,
    /// Wait for each LoadRequest attempt (milliseconds)
    pub load_timeout_ms: u64,
    /// Targeted load attempts before falling back to broadcast
    pub max_replica_tries: usize,
    /// Re-replicate a value after loading it from a peer
    pub save_on_load: bool,
    /// Fan idle sweeps out to every member
    pub broadcast_remove_expired: bool,
    /// Outer bound for the cluster-wide idle sweep (milliseconds)
    pub remove_expired_timeout_ms: u64,
    /// Per-member wait for a size answer (milliseconds)
    pub size_timeout_ms: u64,
    /// Merge strategy for incoming saves
    pub merge: MergeMode,
    /// Idle limit stamped on new entries (milliseconds, 0 = sweep threshold)
    pub default_max_idle_ms: i64,
}

impl ReplicationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn remove_expired_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_expired_timeout_ms)
    }

    pub fn size_timeout(&self) -> Duration {
        Duration::from_millis(self.size_timeout_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            synchronous_writes: false,
            ack_timeout_ms: 3000,
            load_timeout_ms: 3000,
            max_replica_tries: 1,
            save_on_load: true,
            broadcast_remove_expired: true,
            remove_expired_timeout_ms: 6000,
            size_timeout_ms: 3000,
            merge: MergeMode::Full,
            default_max_idle_ms: 0,
        }
    }
}

/// What happens when the asynchronous send queue is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// The submitter waits for queue space
    #[default]
    Block,
    /// The submission fails with `Error::QueueFull`
    Reject,
}

/// Dispatcher worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Workers that live for the whole dispatcher lifetime
    pub core_workers: usize,
    /// Upper bound including transient workers spawned under load
    pub max_workers: usize,
    /// Bounded queue size for asynchronous sends
    pub queue_capacity: usize,
    /// Full-queue policy
    pub backpressure: Backpressure,
    /// Idle time before a transient worker exits (milliseconds)
    pub worker_keep_alive_ms: u64,
}

impl DispatcherConfig {
    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_millis(self.worker_keep_alive_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            core_workers: 2,
            max_workers: 8,
            queue_capacity: 1024,
            backpressure: Backpressure::Block,
            worker_keep_alive_ms: 30_000,
        }
    }
}
