//! The membership/placement seam consumed by the replication core

use crate::hrw::HrwPlacement;
use crate::topology::{ClusterView, MemberInfo, MemberStatus};
use parking_lot::RwLock;
use replikv_common::{Error, InstanceId, Result};
use tracing::debug;

/// Who is in the cluster and where a key's replica lives.
///
/// Implementations are provided by whatever runs group membership and
/// failure detection. All methods are called on hot paths and must not block.
pub trait Membership: Send + Sync {
    /// This node's own instance id
    fn local_instance(&self) -> &InstanceId;

    /// Every member currently alive, including this node
    fn current_members(&self) -> Vec<InstanceId>;

    /// The member that should hold the replica of `key`.
    ///
    /// Never returns the local instance; fails with [`Error::NoViableTarget`]
    /// when this node has no peer.
    fn mapped_instance(&self, group: &str, key: &str) -> Result<InstanceId>;

    /// Ordered fallback candidates to load `key` from
    fn replica_choices(&self, group: &str, key: &str) -> Vec<InstanceId>;

    /// Every alive member except this node
    fn peers(&self) -> Vec<InstanceId> {
        let local = self.local_instance();
        self.current_members()
            .into_iter()
            .filter(|m| m != local)
            .collect()
    }
}

/// Membership backed by an explicitly maintained [`ClusterView`]
pub struct StaticMembership {
    local: InstanceId,
    view: RwLock<ClusterView>,
    hrw: HrwPlacement,
}

impl StaticMembership {
    /// Create a membership view; `local` is added if not listed
    pub fn new<I, S>(local: impl Into<InstanceId>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<InstanceId>,
    {
        let local = local.into();
        let mut view = ClusterView::new();
        for member in members {
            view.upsert_member(MemberInfo::alive(member));
        }
        if view.get_member(&local).is_none() {
            view.upsert_member(MemberInfo::alive(local.clone()));
        }

        Self {
            local,
            view: RwLock::new(view),
            hrw: HrwPlacement::default(),
        }
    }

    /// Use a specific HRW seed
    #[must_use]
    pub fn with_placement(mut self, hrw: HrwPlacement) -> Self {
        self.hrw = hrw;
        self
    }

    /// Add or update a member
    pub fn upsert(&self, member: MemberInfo) {
        debug!(member = %member.id, status = ?member.status, "membership upsert");
        self.view.write().upsert_member(member);
    }

    /// Mark a member as failed; it stops receiving replicas
    pub fn mark_failed(&self, id: &InstanceId) -> bool {
        debug!(member = %id, "membership mark failed");
        self.view.write().set_status(id, MemberStatus::Failed)
    }

    /// Remove a member from the view
    pub fn remove(&self, id: &InstanceId) -> Option<MemberInfo> {
        self.view.write().remove_member(id)
    }

    /// Snapshot of the current view
    pub fn view(&self) -> ClusterView {
        self.view.read().clone()
    }
}

impl Membership for StaticMembership {
    fn local_instance(&self) -> &InstanceId {
        &self.local
    }

    fn current_members(&self) -> Vec<InstanceId> {
        self.view
            .read()
            .alive_members()
            .map(|m| m.id.clone())
            .collect()
    }

    fn mapped_instance(&self, group: &str, key: &str) -> Result<InstanceId> {
        let view = self.view.read();
        self.hrw
            .select(group, key, view.alive_members(), &self.local)
            .ok_or(Error::NoViableTarget)
    }

    fn replica_choices(&self, group: &str, key: &str) -> Vec<InstanceId> {
        let view = self.view.read();
        self.hrw
            .rank(group, key, view.alive_members(), &self.local)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }
}
