//! Topology Snapshot
//!
//! Immutable, versioned view of the cluster: shard membership and liveness,
//! placement policies, and the target-selection function. Snapshots are
//! shared as `Arc<TopologySnapshot>` and replaced wholesale, never mutated.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::placement::{HashPlacement, Placement};
use crate::error::{Error, Result};
use crate::striper::StripeLayout;
use crate::types::{ObjectId, PolicyId, ShardId};

/// One backend shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    /// Network address handed to the messenger when opening a session
    pub addr: String,
    /// Liveness flag as published by the cluster
    pub up: bool,
}

impl ShardInfo {
    pub fn new(id: u32, addr: impl Into<String>) -> Self {
        Self {
            id: ShardId(id),
            addr: addr.into(),
            up: true,
        }
    }

    pub fn down(mut self) -> Self {
        self.up = false;
        self
    }
}

/// Replication / redundancy descriptor of a placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Redundancy {
    /// `size` full copies
    Replicated { size: usize },
    /// `data + parity` erasure-coded shards
    Erasure { data: usize, parity: usize },
}

impl Redundancy {
    /// Number of shards in the acting set.
    pub fn width(&self) -> usize {
        match self {
            Redundancy::Replicated { size } => *size,
            Redundancy::Erasure { data, parity } => data + parity,
        }
    }
}

/// Placement policy descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPolicy {
    pub id: PolicyId,
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub object_size: u64,
    pub redundancy: Redundancy,
}

impl PlacementPolicy {
    /// Replicated policy with the given default striping.
    pub fn replicated(id: u64, size: usize, layout: StripeLayout) -> Self {
        Self {
            id: PolicyId(id),
            stripe_unit: layout.stripe_unit,
            stripe_count: layout.stripe_count,
            object_size: layout.object_size,
            redundancy: Redundancy::Replicated { size },
        }
    }

    /// Default striping for files created under this policy.
    pub fn layout(&self) -> StripeLayout {
        StripeLayout {
            stripe_unit: self.stripe_unit,
            stripe_count: self.stripe_count,
            object_size: self.object_size,
        }
    }
}

/// Immutable, versioned cluster view.
#[derive(Clone)]
pub struct TopologySnapshot {
    epoch: u64,
    shards: BTreeMap<ShardId, ShardInfo>,
    policies: HashMap<PolicyId, PlacementPolicy>,
    placement: Arc<dyn Placement>,
}

impl std::fmt::Debug for TopologySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologySnapshot")
            .field("epoch", &self.epoch)
            .field("shards", &self.shards.len())
            .field("policies", &self.policies.len())
            .finish()
    }
}

impl TopologySnapshot {
    /// Start building a snapshot for `epoch`.
    pub fn builder(epoch: u64) -> TopologyBuilder {
        TopologyBuilder {
            epoch,
            shards: BTreeMap::new(),
            policies: HashMap::new(),
            placement: Arc::new(HashPlacement),
        }
    }

    /// Epoch 0 snapshot with no shards; every request blocks against it.
    pub fn empty() -> Self {
        Self::builder(0).build()
    }

    /// Derive the next snapshot: same placement, new epoch, edited contents.
    pub fn next(&self) -> TopologyBuilder {
        TopologyBuilder {
            epoch: self.epoch + 1,
            shards: self.shards.clone(),
            policies: self.policies.clone(),
            placement: Arc::clone(&self.placement),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn shard(&self, id: ShardId) -> Option<&ShardInfo> {
        self.shards.get(&id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardInfo> {
        self.shards.values()
    }

    /// A shard is usable when it exists and is flagged up.
    pub fn is_up(&self, id: ShardId) -> bool {
        self.shards.get(&id).map(|s| s.up).unwrap_or(false)
    }

    pub fn policy(&self, id: PolicyId) -> Result<&PlacementPolicy> {
        self.policies.get(&id).ok_or(Error::PolicyNotFound(id))
    }

    /// Ordered target set for an object, primary first.
    pub fn target(&self, oid: &ObjectId, policy: PolicyId) -> Result<Vec<ShardId>> {
        let policy = self.policy(policy)?;
        Ok(self.placement.place(oid, policy, &self.shards))
    }
}

/// Builder for [`TopologySnapshot`].
pub struct TopologyBuilder {
    epoch: u64,
    shards: BTreeMap<ShardId, ShardInfo>,
    policies: HashMap<PolicyId, PlacementPolicy>,
    placement: Arc<dyn Placement>,
}

impl TopologyBuilder {
    pub fn epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn shard(mut self, shard: ShardInfo) -> Self {
        self.shards.insert(shard.id, shard);
        self
    }

    pub fn remove_shard(mut self, id: ShardId) -> Self {
        self.shards.remove(&id);
        self
    }

    /// Flip the liveness flag of an existing shard.
    pub fn set_up(mut self, id: ShardId, up: bool) -> Self {
        if let Some(shard) = self.shards.get_mut(&id) {
            shard.up = up;
        }
        self
    }

    pub fn policy(mut self, policy: PlacementPolicy) -> Self {
        self.policies.insert(policy.id, policy);
        self
    }

    pub fn placement(mut self, placement: impl Placement + 'static) -> Self {
        self.placement = Arc::new(placement);
        self
    }

    pub fn build(self) -> TopologySnapshot {
        TopologySnapshot {
            epoch: self.epoch,
            shards: self.shards,
            policies: self.policies,
            placement: self.placement,
        }
    }

    /// Build and wrap in an `Arc`, ready for publication.
    pub fn into_shared(self) -> Arc<TopologySnapshot> {
        Arc::new(self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StripeLayout {
        StripeLayout::new(4096, 4, 4 * 1024 * 1024)
    }

    #[test]
    fn test_builder_and_lookup() {
        let snap = TopologySnapshot::builder(3)
            .shard(ShardInfo::new(0, "10.0.0.1:6800"))
            .shard(ShardInfo::new(1, "10.0.0.2:6800").down())
            .policy(PlacementPolicy::replicated(1, 2, layout()))
            .build();

        assert_eq!(snap.epoch(), 3);
        assert!(snap.is_up(ShardId(0)));
        assert!(!snap.is_up(ShardId(1)));
        assert!(!snap.is_up(ShardId(7)));
        assert_eq!(snap.policy(PolicyId(1)).unwrap().layout(), layout());
    }

    #[test]
    fn test_unknown_policy() {
        let snap = TopologySnapshot::empty();
        let err = snap.target(&ObjectId::new("x"), PolicyId(9)).unwrap_err();
        assert!(matches!(err, Error::PolicyNotFound(PolicyId(9))));
    }

    #[test]
    fn test_next_bumps_epoch_and_keeps_contents() {
        let snap = TopologySnapshot::builder(5)
            .shard(ShardInfo::new(0, "a"))
            .shard(ShardInfo::new(1, "b"))
            .policy(PlacementPolicy::replicated(1, 2, layout()))
            .build();

        let next = snap.next().set_up(ShardId(0), false).build();
        assert_eq!(next.epoch(), 6);
        assert!(!next.is_up(ShardId(0)));
        assert!(next.is_up(ShardId(1)));
        assert!(snap.is_up(ShardId(0)));
    }

    #[test]
    fn test_target_width_follows_redundancy() {
        let snap = TopologySnapshot::builder(1)
            .shard(ShardInfo::new(0, "a"))
            .shard(ShardInfo::new(1, "b"))
            .shard(ShardInfo::new(2, "c"))
            .shard(ShardInfo::new(3, "d"))
            .policy(PlacementPolicy::replicated(1, 3, layout()))
            .build();

        let acting = snap.target(&ObjectId::new("obj"), PolicyId(1)).unwrap();
        assert_eq!(acting.len(), 3);
    }
}
