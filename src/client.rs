//! Client facade wiring router, cache and file translator together.
//!
//! ```text
//!            ┌──────────────────── Client ────────────────────┐
//!  files ───▶│ Filer ──▶ ObjectCache (optional) ──▶ Router ───┼──▶ Messenger
//!            │                 ▲ flusher            ▲ ticker  │
//!            │                 │                    │ pump ◀──┼─── TransportEvent
//!            │                 │                    │ follower◀── topology updates
//!            └────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::ObjectBackend;
use crate::cache::{CacheStatsSnapshot, ObjectCache};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::filer::{FileHandle, Filer};
use crate::router::{Authenticator, Messenger, Router, RouterStatsSnapshot, TransportEvent};
use crate::topology::TopologySnapshot;
use crate::types::PolicyId;

/// One client instance: a router, an optional write-back cache and a file
/// translator on top of whichever of the two serves I/O.
pub struct Client {
    config: ClientConfig,
    router: Router,
    cache: Option<ObjectCache>,
    filer: Filer,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Combined counters of the router and the cache.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub router: RouterStatsSnapshot,
    pub cache: Option<CacheStatsSnapshot>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        messenger: Arc<dyn Messenger>,
        authenticator: Arc<dyn Authenticator>,
        topology: Arc<TopologySnapshot>,
    ) -> Result<Self> {
        config.validate()?;
        let router = Router::new(config.router.clone(), messenger, authenticator, topology)?;
        let cache = if config.cache_enabled {
            Some(ObjectCache::new(
                config.cache.clone(),
                router.clone(),
                config.durability,
            )?)
        } else {
            None
        };
        let backend: Arc<dyn ObjectBackend> = match &cache {
            Some(cache) => Arc::new(cache.clone()),
            None => Arc::new(router.clone()),
        };
        let filer = Filer::new(backend, config.durability);
        info!(
            client = %router.client_id(),
            epoch = router.epoch(),
            cache = config.cache_enabled,
            "client created"
        );
        Ok(Self {
            config,
            router,
            cache,
            filer,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the background tasks: event pump, ticker, optional topology
    /// follower and, when the cache is on, the flusher.
    pub fn start(
        &self,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        topology_updates: Option<watch::Receiver<Arc<TopologySnapshot>>>,
    ) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.router.spawn_event_pump(events, self.shutdown.clone()));
        tasks.push(self.router.spawn_ticker(self.shutdown.clone()));
        if let Some(updates) = topology_updates {
            tasks.push(
                self.router
                    .spawn_topology_follower(updates, self.shutdown.clone()),
            );
        }
        if let Some(cache) = &self.cache {
            if self.config.cache.flusher_enabled {
                tasks.push(cache.spawn_flusher(self.shutdown.clone()));
            }
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn cache(&self) -> Option<&ObjectCache> {
        self.cache.as_ref()
    }

    pub fn filer(&self) -> &Filer {
        &self.filer
    }

    /// Handle for a new empty file striped with the policy's default layout.
    pub fn create_file(&self, ino: u64, policy: PolicyId) -> Result<FileHandle> {
        let layout = self.router.snapshot().policy(policy)?.layout();
        FileHandle::new(ino, layout, policy)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            router: self.router.stats(),
            cache: self.cache.as_ref().map(ObjectCache::stats),
        }
    }

    /// Flush dirty data, stop background tasks and fail whatever is still
    /// in flight.
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = match &self.cache {
            Some(cache) => cache.flush_all().await,
            None => Ok(()),
        };
        if let Err(e) = &flushed {
            warn!(error = %e, "flush before shutdown failed");
        }
        self.shutdown.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.router.close();
        info!("client stopped");
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{MemoryCluster, NoAuth};
    use crate::striper::StripeLayout;
    use crate::topology::{PlacementPolicy, ShardInfo};
    use bytes::Bytes;

    fn topology() -> Arc<TopologySnapshot> {
        TopologySnapshot::builder(1)
            .shard(ShardInfo::new(1, "mem://1"))
            .shard(ShardInfo::new(2, "mem://2"))
            .policy(PlacementPolicy::replicated(3, 2, StripeLayout::new(1024, 2, 4096)))
            .into_shared()
    }

    #[tokio::test]
    async fn test_cached_client_flushes_on_shutdown() {
        let (cluster, events) = MemoryCluster::new();
        let client = Client::new(ClientConfig::default(), cluster.clone(), Arc::new(NoAuth), topology()).unwrap();
        client.start(events, None);

        let mut file = client.create_file(0x42, PolicyId(3)).unwrap();
        assert_eq!(file.layout.stripe_unit, 1024);
        client
            .filer()
            .write(&mut file, 0, Bytes::from(vec![9u8; 3000]))
            .await
            .unwrap();
        assert_eq!(cluster.object_count(), 0);

        client.shutdown().await.unwrap();
        assert_eq!(cluster.object_count(), 2);
        assert_eq!(client.router().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_uncached_client_writes_through() {
        let (cluster, events) = MemoryCluster::new();
        let config = ClientConfig {
            cache_enabled: false,
            ..Default::default()
        };
        let client = Client::new(config, cluster.clone(), Arc::new(NoAuth), topology()).unwrap();
        client.start(events, None);
        assert!(client.cache().is_none());

        let mut file = client.create_file(1, PolicyId(3)).unwrap();
        client
            .filer()
            .write(&mut file, 0, Bytes::from_static(b"direct"))
            .await
            .unwrap();
        assert_eq!(cluster.object_count(), 1);
        assert!(client.stats().cache.is_none());
        client.shutdown().await.unwrap();
    }

    #[test]
    fn test_unknown_policy() {
        let (cluster, _events) = MemoryCluster::new();
        let client = Client::new(ClientConfig::default(), cluster, Arc::new(NoAuth), topology()).unwrap();
        assert!(client.create_file(1, PolicyId(99)).is_err());
    }
}
