//! Cluster view representation

use replikv_common::InstanceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Liveness of a member as reported by the membership service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Joined and serving
    Alive,
    /// Shutting down; no new replicas are placed on it
    Leaving,
    /// Declared failed
    Failed,
}

/// Member information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Member instance id
    pub id: InstanceId,
    /// Member status
    pub status: MemberStatus,
    /// Weight for placement (higher = more keys)
    pub weight: f64,
}

impl MemberInfo {
    /// Create an alive member with unit weight
    pub fn alive(id: impl Into<InstanceId>) -> Self {
        Self {
            id: id.into(),
            status: MemberStatus::Alive,
            weight: 1.0,
        }
    }

    /// Check if this member can hold replicas
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }
}

/// The membership snapshot that placement works from
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterView {
    /// Version number (incremented on changes)
    pub version: u64,
    /// Members keyed by instance id
    pub members: BTreeMap<InstanceId, MemberInfo>,
}

impl ClusterView {
    /// Create a new empty view
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all members
    pub fn all_members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members.values()
    }

    /// Get all alive members
    pub fn alive_members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members.values().filter(|m| m.is_alive())
    }

    /// Get a specific member by id
    pub fn get_member(&self, id: &InstanceId) -> Option<&MemberInfo> {
        self.members.get(id)
    }

    /// Add or update a member
    pub fn upsert_member(&mut self, member: MemberInfo) {
        self.members.insert(member.id.clone(), member);
        self.version += 1;
    }

    /// Change a member's status, returning false if it is unknown
    pub fn set_status(&mut self, id: &InstanceId, status: MemberStatus) -> bool {
        match self.members.get_mut(id) {
            Some(member) if member.status != status => {
                member.status = status;
                self.version += 1;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Remove a member
    pub fn remove_member(&mut self, id: &InstanceId) -> Option<MemberInfo> {
        let removed = self.members.remove(id);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }
}
