//! Topology publication channel.
//!
//! Stands in for the cluster-map subscription: whoever learns about a new
//! snapshot publishes it here, routers follow the receiving side.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::snapshot::TopologySnapshot;
use crate::error::{Error, Result};

/// Publishing side of the topology subscription.
#[derive(Debug, Clone)]
pub struct TopologyPublisher {
    tx: Arc<watch::Sender<Arc<TopologySnapshot>>>,
}

impl TopologyPublisher {
    pub fn new(initial: Arc<TopologySnapshot>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot most recently published.
    pub fn current(&self) -> Arc<TopologySnapshot> {
        self.tx.borrow().clone()
    }

    /// Publish a snapshot. Epochs must increase.
    pub fn publish(&self, snapshot: Arc<TopologySnapshot>) -> Result<()> {
        let current = self.tx.borrow().epoch();
        if snapshot.epoch() <= current {
            return Err(Error::Config(format!(
                "refusing to publish epoch {} over epoch {}",
                snapshot.epoch(),
                current
            )));
        }
        debug!(epoch = snapshot.epoch(), "publishing topology snapshot");
        self.tx.send_replace(snapshot);
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let publisher = TopologyPublisher::new(TopologySnapshot::builder(1).into_shared());
        let mut rx = publisher.subscribe();

        publisher
            .publish(TopologySnapshot::builder(2).into_shared())
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().epoch(), 2);
        assert_eq!(publisher.current().epoch(), 2);
    }

    #[test]
    fn test_rejects_non_increasing_epoch() {
        let publisher = TopologyPublisher::new(TopologySnapshot::builder(4).into_shared());
        assert!(publisher
            .publish(TopologySnapshot::builder(4).into_shared())
            .is_err());
        assert!(publisher
            .publish(TopologySnapshot::builder(3).into_shared())
            .is_err());
        assert_eq!(publisher.current().epoch(), 4);
    }
}
