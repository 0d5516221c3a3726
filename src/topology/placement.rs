//! Target Selection
//!
//! The placement function maps an object to an ordered set of shards. The
//! crate treats it as a pure function of the snapshot; [`HashPlacement`] is a
//! rendezvous-hashing default, and any closure with the right signature can
//! stand in for an external placement engine.

use std::collections::BTreeMap;

use super::snapshot::{PlacementPolicy, ShardInfo};
use crate::types::{ObjectId, ShardId};

/// Pure object → acting-set function.
pub trait Placement: Send + Sync {
    /// Ordered target set for `oid` under `policy`, primary first.
    fn place(
        &self,
        oid: &ObjectId,
        policy: &PlacementPolicy,
        shards: &BTreeMap<ShardId, ShardInfo>,
    ) -> Vec<ShardId>;
}

impl<F> Placement for F
where
    F: Fn(&ObjectId, &PlacementPolicy, &BTreeMap<ShardId, ShardInfo>) -> Vec<ShardId>
        + Send
        + Sync,
{
    fn place(
        &self,
        oid: &ObjectId,
        policy: &PlacementPolicy,
        shards: &BTreeMap<ShardId, ShardInfo>,
    ) -> Vec<ShardId> {
        self(oid, policy, shards)
    }
}

/// Highest-random-weight placement over every shard in the snapshot.
///
/// Liveness is ignored here. A down shard keeps its position in the acting
/// set and the router skips it when choosing a target.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPlacement;

impl HashPlacement {
    /// FxHash-style mix of the object name, policy and shard.
    #[inline]
    fn score(oid: &ObjectId, policy: u64, shard: ShardId) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED ^ policy;
        for &byte in oid.as_str().as_bytes() {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash = (hash.rotate_left(5) ^ shard.0 as u64).wrapping_mul(SEED);
        // final avalanche so neighbouring shard ids spread out
        hash ^= hash >> 33;
        hash = hash.wrapping_mul(0xff51afd7ed558ccd);
        hash ^ (hash >> 33)
    }
}

impl Placement for HashPlacement {
    fn place(
        &self,
        oid: &ObjectId,
        policy: &PlacementPolicy,
        shards: &BTreeMap<ShardId, ShardInfo>,
    ) -> Vec<ShardId> {
        let mut scored: Vec<(u64, ShardId)> = shards
            .keys()
            .map(|&id| (Self::score(oid, policy.id.0, id), id))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(policy.redundancy.width())
            .map(|(_, id)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::striper::StripeLayout;

    fn shards(n: u32) -> BTreeMap<ShardId, ShardInfo> {
        (0..n)
            .map(|i| (ShardId(i), ShardInfo::new(i, format!("node-{}", i))))
            .collect()
    }

    fn policy(size: usize) -> PlacementPolicy {
        PlacementPolicy::replicated(1, size, StripeLayout::new(65536, 1, 4 << 20))
    }

    #[test]
    fn test_hash_placement_is_deterministic() {
        let shards = shards(8);
        let oid = ObjectId::new("10000000000.00000000");
        let a = HashPlacement.place(&oid, &policy(3), &shards);
        let b = HashPlacement.place(&oid, &policy(3), &shards);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);

        let mut dedup = a.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn test_hash_placement_spreads_primaries() {
        let shards = shards(4);
        let mut primaries = std::collections::HashSet::new();
        for i in 0..64 {
            let oid = ObjectId::new(format!("obj.{:08x}", i));
            primaries.insert(HashPlacement.place(&oid, &policy(2), &shards)[0]);
        }
        assert!(primaries.len() > 1);
    }

    #[test]
    fn test_width_capped_by_shard_count() {
        let shards = shards(2);
        let acting = HashPlacement.place(&ObjectId::new("x"), &policy(3), &shards);
        assert_eq!(acting.len(), 2);
    }

    #[test]
    fn test_closure_placement() {
        let fixed = |_: &ObjectId, _: &PlacementPolicy, _: &BTreeMap<ShardId, ShardInfo>| {
            vec![ShardId(1), ShardId(0)]
        };
        let acting = fixed.place(&ObjectId::new("x"), &policy(2), &shards(2));
        assert_eq!(acting, vec![ShardId(1), ShardId(0)]);
    }
}
