//! osdc - Object Storage Data path Client
//!
//! Client side of a sharded object store. Files are striped over fixed-size
//! objects, each object request is routed to the shard currently responsible
//! for it, and an optional write-back cache sits in between.
//!
//! # Architecture
//!
//! ```text
//!   Filer ──▶ Striper (file range → object extents)
//!     │
//!     ▼
//!   ObjectBackend ── ObjectCache (write-back, optional)
//!     │                    │
//!     ▼                    ▼
//!   Router ◀── TopologySnapshot (epoch, shards, policies, placement)
//!     │
//!     ▼
//!   Messenger (sessions per shard) ──▶ shards
//! ```
//!
//! # Modules
//!
//! - [`striper`] - Mapping of file byte ranges onto objects
//! - [`topology`] - Versioned cluster view and placement
//! - [`router`] - Request targeting, retargeting and completion
//! - [`cache`] - Write-back object cache
//! - [`filer`] - File operations over striped objects
//! - [`client`] - Facade owning the pieces and their background tasks
//! - [`config`] - YAML configuration
//! - [`metrics`] - Prometheus exposition
//! - [`error`] - Error types

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod filer;
pub mod metrics;
pub mod router;
pub mod striper;
pub mod topology;
pub mod types;

// Re-export commonly used types
pub use backend::ObjectBackend;
pub use cache::{CacheConfig, ObjectCache};
pub use client::{Client, ClientStats};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use filer::{FileHandle, Filer};
pub use router::{Router, RouterConfig};
pub use striper::StripeLayout;
pub use topology::TopologySnapshot;
pub use types::{Durability, ObjectId, ObjectLocator, OrderingToken, PolicyId, ShardId, Tid};
