//! Rendezvous (HRW) hashing for replica placement
//!
//! `score(member) = hash(group, key, member_id) * weight`; the member with the
//! highest score holds the key's replica. When a member leaves only the keys
//! it scored highest for move, everything else keeps its replica.

use crate::topology::MemberInfo;
use replikv_common::InstanceId;

/// Weight multiplier so fractional weights survive the integer score
const WEIGHT_SCALE: f64 = 1000.0;

/// Stateless HRW scorer
#[derive(Clone, Copy, Debug, Default)]
pub struct HrwPlacement {
    seed: u64,
}

impl HrwPlacement {
    /// Create a scorer with a seed.
    ///
    /// Every member of a cluster must use the same seed or they will disagree
    /// on placement.
    #[must_use]
    pub const fn with_seed(seed: u64) -> Self {
        Self { seed }
    }

    /// Hash a key within its group
    #[must_use]
    pub fn hash_key(&self, group: &str, key: &str) -> u64 {
        let group_hash = xxhash_rust::xxh64::xxh64(group.as_bytes(), self.seed);
        xxhash_rust::xxh64::xxh64(key.as_bytes(), group_hash)
    }

    /// Score a member for an already hashed key
    #[must_use]
    pub fn score(&self, key_hash: u64, member: &MemberInfo) -> u64 {
        let member_hash = xxhash_rust::xxh64::xxh64(member.id.as_str().as_bytes(), key_hash);
        let weight_factor = (member.weight.max(0.0) * WEIGHT_SCALE) as u64;
        member_hash.wrapping_mul(weight_factor)
    }

    /// Rank members for a key, best first, skipping `exclude`
    pub fn rank<'a>(
        &self,
        group: &str,
        key: &str,
        members: impl IntoIterator<Item = &'a MemberInfo>,
        exclude: &InstanceId,
    ) -> Vec<(InstanceId, u64)> {
        let key_hash = self.hash_key(group, key);

        let mut scored: Vec<(InstanceId, u64)> = members
            .into_iter()
            .filter(|m| &m.id != exclude)
            .map(|m| (m.id.clone(), self.score(key_hash, m)))
            .collect();

        // Sort by score descending; ties broken by id so every node agrees
        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored
    }

    /// Pick the single best member for a key
    pub fn select<'a>(
        &self,
        group: &str,
        key: &str,
        members: impl IntoIterator<Item = &'a MemberInfo>,
        exclude: &InstanceId,
    ) -> Option<InstanceId> {
        self.rank(group, key, members, exclude)
            .into_iter()
            .next()
            .map(|(id, _)| id)
    }
}
