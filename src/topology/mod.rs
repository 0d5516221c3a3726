//! Cluster Topology
//!
//! Versioned, immutable views of the backend cluster consumed by the router.
//!
//! ```text
//! TopologyPublisher ──watch──▶ Router::on_snapshot_update
//!        │
//!        └── Arc<TopologySnapshot> { epoch, shards, policies, placement }
//! ```

mod placement;
mod snapshot;
mod source;

pub use placement::{HashPlacement, Placement};
pub use snapshot::{PlacementPolicy, Redundancy, ShardInfo, TopologyBuilder, TopologySnapshot};
pub use source::TopologyPublisher;
