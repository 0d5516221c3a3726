//! Object cache front end: read/write/flush/trim over the segment maps.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::object::{CachedObject, IoStatus};
use super::segment::{ByteAccounting, SegmentInfo};
use super::stats::{CacheStats, CacheStatsSnapshot};
use super::CacheConfig;
use crate::backend::{fill_short_read, zeros, ObjectBackend};
use crate::error::{Error, Result};
use crate::router::{Operation, PendingOp, Router, SubmitOptions};
use crate::types::{Durability, ObjectLocator, Tid};

type ObjectRef = Arc<Mutex<CachedObject>>;

/// Write-back cache in front of a [`Router`].
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct ObjectCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: CacheConfig,
    router: Router,
    /// Durability requested for flushes
    durability: Durability,
    objects: DashMap<ObjectLocator, ObjectRef>,
    bytes: ByteAccounting,
    stats: CacheStats,
    /// Signalled whenever dirty or flushing bytes go down
    space_freed: Notify,
    flusher_wake: Notify,
}

impl ObjectCache {
    pub fn new(config: CacheConfig, router: Router, durability: Durability) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                router,
                durability,
                objects: DashMap::new(),
                bytes: ByteAccounting::default(),
                stats: CacheStats::default(),
                space_freed: Notify::new(),
                flusher_wake: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read `length` bytes at `offset`, fetching only what is not cached.
    ///
    /// Bytes past the end of the object read as zeros. Fails with
    /// [`Error::CacheIo`] when a backend read this call depends on fails.
    #[instrument(skip(self), fields(object = %locator.oid))]
    pub async fn read(&self, locator: &ObjectLocator, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        loop {
            let object = self.inner.object(locator);
            let (mut parts, waits) = {
                let mut obj = object.lock();
                if obj.detached {
                    continue;
                }
                let now = Instant::now();
                let lookup = obj.lookup(offset, length, now);
                self.inner.stats.record_lookup(lookup.is_hit());

                let mut waits = Vec::new();
                for (tid, start, end) in lookup.waiting {
                    if let Some(rx) = obj.subscribe(tid) {
                        waits.push(Wait { tid, start, end, rx });
                    }
                }
                for (start, len) in lookup.missing {
                    let pending = self
                        .inner
                        .router
                        .submit(
                            locator.clone(),
                            Operation::Read { offset: start, length: len },
                            SubmitOptions::default(),
                        )
                        .map_err(|e| Error::cache_io(locator.oid.to_string(), e))?;
                    let tid = pending.tid();
                    let rx = obj.begin_read(start, len, tid, now, &self.inner.bytes);
                    self.inner.stats.record_read_issued();
                    trace!(%tid, start, len, "cache miss, reading from cluster");
                    self.spawn_read_completion(Arc::clone(&object), pending, start, len);
                    waits.push(Wait {
                        tid,
                        start,
                        end: start + len,
                        rx,
                    });
                }
                (lookup.hits, waits)
            };

            if !waits.is_empty() {
                let waiting = ReadWait {
                    inner: Arc::clone(&self.inner),
                    object,
                    waits,
                    settled: false,
                };
                parts.extend(waiting.collect(locator).await?);
            }
            return Ok(assemble(offset, length, parts));
        }
    }

    fn spawn_read_completion(&self, object: ObjectRef, pending: PendingOp, base: u64, length: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let tid = pending.tid();
            let result = match pending.await {
                Ok(reply) => fill_short_read(base, length, reply.data, reply.object_size),
                Err(e) if e.is_not_found() => Ok(zeros(length)),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!(%tid, error = %e, "cache read failed");
                inner.stats.record_read_failure();
            }
            object
                .lock()
                .complete_read(tid, result, Instant::now(), &inner.bytes);
            inner.trim();
        });
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Buffer a write. Completes without contacting the cluster unless the
    /// writer has to wait for dirty data to drain.
    #[instrument(skip(self, data), fields(object = %locator.oid, length = data.len()))]
    pub async fn write(&self, locator: &ObjectLocator, offset: u64, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.throttle().await;
        loop {
            let object = self.inner.object(locator);
            let mut obj = object.lock();
            if !obj.detached {
                obj.write(offset, data, Instant::now(), &self.inner.bytes);
                break;
            }
        }
        self.inner.stats.record_write();
        self.inner.trim();
        Ok(())
    }

    /// Block while dirty plus flushing bytes are over the high-water mark,
    /// until they drop below the low-water mark.
    async fn throttle(&self) {
        let config = &self.inner.config;
        if self.inner.bytes.dirty_and_flushing() <= config.dirty_high_water {
            return;
        }
        self.inner.stats.record_throttle();
        debug!(
            dirty = self.inner.bytes.dirty_and_flushing(),
            high_water = config.dirty_high_water,
            "dirty data over high water, throttling writer"
        );
        loop {
            let freed = self.inner.space_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if self.inner.bytes.dirty_and_flushing() < config.dirty_low_water {
                break;
            }
            self.inner.flusher_wake.notify_one();
            freed.await;
        }
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Write back every dirty segment of one object, in offset order, and
    /// wait until they and any flushes already in flight are acknowledged.
    #[instrument(skip(self), fields(object = %locator.oid))]
    pub async fn flush(&self, locator: &ObjectLocator) -> Result<()> {
        let Some(object) = self.inner.objects.get(locator).map(|e| Arc::clone(e.value())) else {
            return Ok(());
        };
        let mut first_error: Option<Arc<Error>> = None;
        let (own, foreign) = {
            let mut obj = object.lock();
            let foreign: Vec<_> = obj
                .flushing_tids()
                .into_iter()
                .filter_map(|tid| obj.subscribe(tid))
                .collect();
            let mut own = Vec::new();
            for (offset, data) in obj.dirty_extents() {
                let length = data.len();
                let submitted = self.inner.router.submit(
                    locator.clone(),
                    Operation::Write { offset, data },
                    SubmitOptions::ordered(locator, self.inner.durability),
                );
                let pending = match submitted {
                    Ok(pending) => pending,
                    Err(e) => {
                        first_error = Some(Arc::new(e));
                        break;
                    }
                };
                let tid = pending.tid();
                own.push(obj.begin_flush(offset, tid, &self.inner.bytes));
                self.inner.stats.record_flush_issued();
                trace!(%tid, offset, length, "flushing dirty segment");
                self.spawn_flush_completion(Arc::clone(&object), pending);
            }
            (own, foreign)
        };

        for mut rx in own {
            if let IoStatus::Failed(e) = wait_io(&mut rx).await {
                first_error.get_or_insert(e);
            }
        }
        for mut rx in foreign {
            wait_io(&mut rx).await;
        }
        match first_error {
            Some(e) => Err(Error::cache_io_shared(locator.oid.to_string(), e)),
            None => Ok(()),
        }
    }

    fn spawn_flush_completion(&self, object: ObjectRef, pending: PendingOp) {
        let inner = Arc::clone(&self.inner);
        let started = Instant::now();
        tokio::spawn(async move {
            let tid = pending.tid();
            let result = pending.await.map(|_| ());
            if let Err(e) = &result {
                warn!(%tid, error = %e, "flush failed, segment stays dirty");
            }
            inner.stats.record_flush_done(result.is_ok(), started.elapsed());
            object.lock().complete_flush(tid, result, &inner.bytes);
            inner.space_freed.notify_waiters();
            inner.trim();
        });
    }

    /// Flush every object holding dirty or flushing data.
    pub async fn flush_all(&self) -> Result<()> {
        let locators = self.inner.locators(|obj| obj.has_dirty() || obj.has_flushing());
        self.flush_many(&locators).await
    }

    async fn flush_many(&self, locators: &[ObjectLocator]) -> Result<()> {
        let results = join_all(locators.iter().map(|l| self.flush(l))).await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// One background flusher pass: everything while dirty data exceeds the
    /// low-water mark, otherwise only objects dirty for longer than
    /// `max_dirty_age`.
    pub async fn flush_pass(&self, now: Instant) -> Result<()> {
        let config = &self.inner.config;
        let locators = if self.inner.bytes.dirty_and_flushing() > config.dirty_low_water {
            self.inner.locators(|obj| obj.has_dirty())
        } else {
            self.inner.locators(|obj| {
                obj.oldest_dirty()
                    .is_some_and(|t| now.saturating_duration_since(t) >= config.max_dirty_age)
            })
        };
        if locators.is_empty() {
            return Ok(());
        }
        debug!(objects = locators.len(), "background flush");
        self.flush_many(&locators).await
    }

    /// Run [`ObjectCache::flush_pass`] every `flush_interval`, and whenever a
    /// throttled writer asks for it, until shutdown.
    pub fn spawn_flusher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.config.flush_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {},
                    _ = cache.inner.flusher_wake.notified() => {},
                }
                if let Err(e) = cache.flush_pass(Instant::now()).await {
                    warn!(error = %e, "background flush failed");
                }
            }
            debug!("cache flusher stopped");
        })
    }

    // =========================================================================
    // Discard and trim
    // =========================================================================

    /// Drop cached bytes in `[offset, offset + length)` regardless of state.
    /// Dirty bytes in the range are lost.
    pub fn discard(&self, locator: &ObjectLocator, offset: u64, length: u64) {
        let end = offset.saturating_add(length);
        if let Some(object) = self.inner.objects.get(locator).map(|e| Arc::clone(e.value())) {
            let removed = object.lock().carve(offset, end, &self.inner.bytes);
            if !removed.is_empty() {
                debug!(object = %locator.oid, offset, end, pieces = removed.len(), "discarded cached range");
            }
        }
        self.inner.release(locator);
        self.inner.space_freed.notify_waiters();
    }

    /// Drop everything cached for an object.
    pub fn invalidate(&self, locator: &ObjectLocator) {
        self.discard(locator, 0, u64::MAX);
    }

    /// Evict clean data until the cache fits in `max_bytes`.
    pub fn trim(&self) {
        self.inner.trim();
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn segments(&self, locator: &ObjectLocator) -> Vec<SegmentInfo> {
        self.inner
            .objects
            .get(locator)
            .map(|e| e.value().lock().segment_info())
            .unwrap_or_default()
    }

    pub fn cached_objects(&self) -> usize {
        self.inner.objects.len()
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.inner.bytes.dirty_and_flushing()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner
            .stats
            .snapshot(&self.inner.bytes, self.inner.objects.len())
    }
}

impl CacheInner {
    fn object(&self, locator: &ObjectLocator) -> ObjectRef {
        let entry = self
            .objects
            .entry(locator.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CachedObject::new())));
        Arc::clone(entry.value())
    }

    /// Sorted locators of objects matching `filter`.
    fn locators(&self, wanted: impl Fn(&CachedObject) -> bool) -> Vec<ObjectLocator> {
        let mut locators: Vec<ObjectLocator> = self
            .objects
            .iter()
            .filter(|e| wanted(&e.value().lock()))
            .map(|e| e.key().clone())
            .collect();
        locators.sort();
        locators
    }

    /// Remove the object from the index if nothing is cached or in flight.
    fn release(&self, locator: &ObjectLocator) {
        self.objects.remove_if(locator, |_, obj| {
            let mut obj = obj.lock();
            if obj.is_idle() {
                obj.detached = true;
                true
            } else {
                false
            }
        });
    }

    fn trim(&self) {
        let max = self.config.max_bytes;
        if self.bytes.total() <= max {
            return;
        }
        let mut candidates: Vec<(Instant, u64, ObjectRef)> = Vec::new();
        for entry in self.objects.iter() {
            let obj = entry.value().lock();
            for (offset, last_access) in obj.clean_segments() {
                candidates.push((last_access, offset, Arc::clone(entry.value())));
            }
        }
        candidates.sort_by_key(|(last_access, offset, _)| (*last_access, *offset));

        let mut evicted = 0u64;
        for (_, offset, object) in candidates {
            if self.bytes.total() <= max {
                break;
            }
            let freed = object.lock().evict_clean(offset, &self.bytes);
            if freed > 0 {
                self.stats.record_eviction(freed);
                evicted += freed;
            }
        }
        self.objects.retain(|_, obj| {
            let mut obj = obj.lock();
            if obj.is_idle() {
                obj.detached = true;
                false
            } else {
                true
            }
        });
        if evicted > 0 {
            debug!(evicted, total = self.bytes.total(), max, "trimmed clean data");
        }
    }
}

// =============================================================================
// Read waiting
// =============================================================================

struct Wait {
    tid: Tid,
    start: u64,
    end: u64,
    rx: watch::Receiver<IoStatus>,
}

/// Outstanding backend reads one caller depends on. Dropping it early
/// cancels reads nobody else is waiting for.
struct ReadWait {
    inner: Arc<CacheInner>,
    object: ObjectRef,
    waits: Vec<Wait>,
    settled: bool,
}

impl ReadWait {
    async fn collect(mut self, locator: &ObjectLocator) -> Result<Vec<(u64, Bytes)>> {
        let mut parts = Vec::with_capacity(self.waits.len());
        let mut failure = None;
        for wait in self.waits.iter_mut() {
            match wait_io(&mut wait.rx).await {
                IoStatus::Complete { base, data } => {
                    let from = (wait.start - base) as usize;
                    let to = (wait.end - base) as usize;
                    if to <= data.len() {
                        parts.push((wait.start, data.slice(from..to)));
                    } else {
                        failure.get_or_insert_with(|| {
                            Arc::new(Error::gap(wait.start, wait.end - wait.start, "read reply too short"))
                        });
                    }
                }
                IoStatus::Failed(e) => {
                    failure.get_or_insert(e);
                }
                IoStatus::Pending => {}
            }
        }
        self.settled = true;
        match failure {
            Some(e) => Err(Error::cache_io_shared(locator.oid.to_string(), e)),
            None => Ok(parts),
        }
    }
}

impl Drop for ReadWait {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let tids: Vec<Tid> = self.waits.drain(..).map(|w| w.tid).collect();
        let obj = self.object.lock();
        for tid in tids {
            if obj.waiters(tid) == 0 && self.inner.router.cancel(tid) {
                debug!(%tid, "cancelled cache read with no remaining waiters");
            }
        }
    }
}

async fn wait_io(rx: &mut watch::Receiver<IoStatus>) -> IoStatus {
    let settled = rx.wait_for(|status| !status.is_pending()).await;
    match settled {
        Ok(status) => status.clone(),
        Err(_) => IoStatus::Failed(Arc::new(Error::Internal(
            "cache I/O dropped without a result".into(),
        ))),
    }
}

/// Stitch non-overlapping parts into one buffer covering the request.
fn assemble(offset: u64, length: u64, mut parts: Vec<(u64, Bytes)>) -> Bytes {
    if parts.len() == 1 && parts[0].0 == offset && parts[0].1.len() as u64 == length {
        return parts.remove(0).1;
    }
    parts.sort_by_key(|(start, _)| *start);
    let mut buf = BytesMut::zeroed(length as usize);
    for (start, data) in parts {
        let at = (start - offset) as usize;
        buf[at..at + data.len()].copy_from_slice(&data);
    }
    buf.freeze()
}

#[async_trait]
impl ObjectBackend for ObjectCache {
    async fn read(&self, locator: &ObjectLocator, offset: u64, length: u64) -> Result<Bytes> {
        ObjectCache::read(self, locator, offset, length).await
    }

    /// Acknowledged once buffered; durability is provided by the flush.
    async fn write(
        &self,
        locator: &ObjectLocator,
        offset: u64,
        data: Bytes,
        _durability: Durability,
    ) -> Result<()> {
        ObjectCache::write(self, locator, offset, data).await
    }

    async fn zero(&self, locator: &ObjectLocator, offset: u64, length: u64) -> Result<()> {
        self.discard(locator, offset, length);
        self.inner.router.zero(locator, offset, length).await
    }

    async fn truncate(&self, locator: &ObjectLocator, size: u64) -> Result<()> {
        self.discard(locator, size, u64::MAX - size);
        self.inner.router.truncate(locator, size).await
    }

    async fn remove(&self, locator: &ObjectLocator) -> Result<()> {
        self.invalidate(locator);
        self.inner.router.remove(locator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SegmentState;
    use crate::router::{MemoryCluster, NoAuth, RouterConfig};
    use crate::striper::StripeLayout;
    use crate::topology::{PlacementPolicy, ShardInfo, TopologySnapshot};
    use crate::types::PolicyId;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn setup(config: CacheConfig) -> (ObjectCache, Arc<MemoryCluster>, CancellationToken) {
        let (cluster, events) = MemoryCluster::new();
        let topology = TopologySnapshot::builder(1)
            .shard(ShardInfo::new(1, "mem://1"))
            .shard(ShardInfo::new(2, "mem://2"))
            .policy(PlacementPolicy::replicated(1, 2, StripeLayout::new(4096, 1, 4096)))
            .into_shared();
        let router = Router::new(RouterConfig::default(), cluster.clone(), Arc::new(NoAuth), topology).unwrap();
        let shutdown = CancellationToken::new();
        router.spawn_event_pump(events, shutdown.clone());
        let cache = ObjectCache::new(config, router, Durability::Applied).unwrap();
        (cache, cluster, shutdown)
    }

    fn no_flusher() -> CacheConfig {
        CacheConfig {
            flusher_enabled: false,
            ..Default::default()
        }
    }

    fn loc(name: &str) -> ObjectLocator {
        ObjectLocator::new(name, PolicyId(1))
    }

    fn reads(cluster: &MemoryCluster) -> usize {
        cluster
            .deliveries()
            .iter()
            .filter(|d| matches!(d.request.op, Operation::Read { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_read_after_write_is_served_from_memory() {
        let (cache, cluster, _shutdown) = setup(no_flusher());
        cache.write(&loc("a"), 100, Bytes::from_static(b"hello")).await.unwrap();
        let out = cache.read(&loc("a"), 100, 5).await.unwrap();
        assert_eq!(&out[..], b"hello");
        assert!(cluster.deliveries().is_empty());
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_miss_reads_only_missing_range() {
        let (cache, cluster, _shutdown) = setup(no_flusher());
        cluster.put_object(loc("a"), &[7u8; 64]);
        cache.write(&loc("a"), 16, Bytes::from_static(b"wwww")).await.unwrap();

        let out = cache.read(&loc("a"), 0, 32).await.unwrap();
        assert_eq!(&out[..16], &[7u8; 16]);
        assert_eq!(&out[16..20], b"wwww");
        assert_eq!(&out[20..], &[7u8; 12]);

        let ranges: Vec<(u64, u64)> = cluster
            .deliveries()
            .iter()
            .filter_map(|d| match d.request.op {
                Operation::Read { offset, length } => Some((offset, length)),
                _ => None,
            })
            .collect();
        assert_eq!(ranges, vec![(0, 16), (20, 12)]);

        // now fully cached
        cache.read(&loc("a"), 0, 32).await.unwrap();
        assert_eq!(reads(&cluster), 2);
    }

    #[tokio::test]
    async fn test_missing_object_reads_zeros() {
        let (cache, _cluster, _shutdown) = setup(no_flusher());
        let out = cache.read(&loc("nothing"), 0, 8).await.unwrap();
        assert_eq!(&out[..], &[0u8; 8]);
    }

    #[tokio::test]
    async fn test_concurrent_readers_share_one_backend_read() {
        let (cache, cluster, _shutdown) = setup(no_flusher());
        cluster.put_object(loc("a"), b"0123456789");
        cluster.set_auto_reply(false);

        let first = tokio::spawn({
            let cache = cache.clone();
            async move { cache.read(&loc("a"), 0, 10).await }
        });
        while cluster.pending().is_empty() {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let cache = cache.clone();
            async move { cache.read(&loc("a"), 2, 4).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cluster.pending().len(), 1);

        cluster.reply_all();
        assert_eq!(&first.await.unwrap().unwrap()[..], b"0123456789");
        assert_eq!(&second.await.unwrap().unwrap()[..], b"2345");
        assert_eq!(reads(&cluster), 1);
    }

    #[tokio::test]
    async fn test_read_failure_is_cache_io() {
        let (cache, cluster, _shutdown) = setup(no_flusher());
        cluster.put_object(loc("a"), b"abc");
        cluster.set_auto_reply(false);
        let reader = tokio::spawn({
            let cache = cache.clone();
            async move { cache.read(&loc("a"), 0, 3).await }
        });
        let tid = loop {
            if let Some(d) = cluster.pending().first() {
                break d.request.tid;
            }
            tokio::task::yield_now().await;
        };
        cluster.reply_with(
            tid,
            Err(crate::router::ReplyError::Rejected {
                code: crate::types::RejectCode::PermissionDenied,
                message: "denied".into(),
            }),
        );
        assert_matches!(reader.await.unwrap(), Err(Error::CacheIo { .. }));
        assert!(cache.segments(&loc("a")).is_empty());
    }

    #[tokio::test]
    async fn test_flush_orders_segments_and_cleans_on_ack() {
        let (cache, cluster, _shutdown) = setup(no_flusher());
        cache.write(&loc("a"), 200, Bytes::from_static(b"cc")).await.unwrap();
        cache.write(&loc("a"), 0, Bytes::from_static(b"aa")).await.unwrap();
        cache.write(&loc("a"), 100, Bytes::from_static(b"bb")).await.unwrap();
        assert_eq!(cache.dirty_bytes(), 6);

        cache.flush(&loc("a")).await.unwrap();
        let offsets: Vec<u64> = cluster
            .deliveries()
            .iter()
            .filter_map(|d| match d.request.op {
                Operation::Write { offset, .. } => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 100, 200]);
        assert!(cache
            .segments(&loc("a"))
            .iter()
            .all(|s| s.state == SegmentState::Clean));
        assert_eq!(cache.dirty_bytes(), 0);
        assert_eq!(&cluster.object(&loc("a")).unwrap()[200..202], b"cc");
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_data_dirty() {
        let (cache, cluster, _shutdown) = setup(no_flusher());
        cluster.set_auto_reply(false);
        cache.write(&loc("a"), 0, Bytes::from_static(b"data")).await.unwrap();

        let flusher = tokio::spawn({
            let cache = cache.clone();
            async move { cache.flush(&loc("a")).await }
        });
        let tid = loop {
            if let Some(d) = cluster.pending().first() {
                break d.request.tid;
            }
            tokio::task::yield_now().await;
        };
        assert_matches!(cache.segments(&loc("a"))[0].state, SegmentState::Flushing(_));
        cluster.reply_with(
            tid,
            Err(crate::router::ReplyError::Rejected {
                code: crate::types::RejectCode::NoSpace,
                message: "full".into(),
            }),
        );
        assert_matches!(flusher.await.unwrap(), Err(Error::CacheIo { .. }));
        assert_eq!(cache.segments(&loc("a"))[0].state, SegmentState::Dirty);
        assert_eq!(cache.stats().flush_failures, 1);
    }

    #[tokio::test]
    async fn test_trim_evicts_least_recently_used_clean() {
        let config = CacheConfig {
            max_bytes: 16,
            dirty_high_water: 16,
            dirty_low_water: 8,
            flusher_enabled: false,
            ..Default::default()
        };
        let (cache, cluster, _shutdown) = setup(config);
        cluster.put_object(loc("old"), &[1u8; 10]);
        cluster.put_object(loc("new"), &[2u8; 10]);
        cache.read(&loc("old"), 0, 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.read(&loc("new"), 0, 10).await.unwrap();
        // completion tasks trim after filling
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.trim();

        assert!(cache.segments(&loc("old")).is_empty());
        assert_eq!(cache.segments(&loc("new")).len(), 1);
        assert!(cache.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn test_dirty_data_is_never_evicted() {
        let config = CacheConfig {
            max_bytes: 4,
            dirty_high_water: 64,
            dirty_low_water: 32,
            flusher_enabled: false,
            ..Default::default()
        };
        let (cache, _cluster, _shutdown) = setup(config);
        cache.write(&loc("a"), 0, Bytes::from_static(b"0123456789")).await.unwrap();
        cache.trim();
        assert_eq!(cache.segments(&loc("a"))[0].state, SegmentState::Dirty);
    }

    #[tokio::test]
    async fn test_truncate_discards_cached_tail() {
        let (cache, cluster, _shutdown) = setup(no_flusher());
        cache.write(&loc("a"), 0, Bytes::from_static(b"abcdefgh")).await.unwrap();
        cache.flush(&loc("a")).await.unwrap();

        ObjectBackend::truncate(&cache, &loc("a"), 3).await.unwrap();
        assert_eq!(cache.segments(&loc("a")).iter().map(|s| s.length).sum::<u64>(), 3);
        assert_eq!(cluster.object(&loc("a")).unwrap().len(), 3);
        let out = cache.read(&loc("a"), 0, 8).await.unwrap();
        assert_eq!(&out[..], b"abc\0\0\0\0\0");
    }

    #[tokio::test]
    async fn test_flush_pass_picks_aged_objects() {
        let config = CacheConfig {
            max_dirty_age: Duration::from_millis(50),
            flusher_enabled: false,
            ..Default::default()
        };
        let (cache, cluster, _shutdown) = setup(config);
        cache.write(&loc("a"), 0, Bytes::from_static(b"x")).await.unwrap();

        cache.flush_pass(Instant::now()).await.unwrap();
        assert!(cluster.deliveries().is_empty());

        cache
            .flush_pass(Instant::now() + Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(cluster.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_low_water_is_refused() {
        let (cache, _cluster, _shutdown) = setup(no_flusher());
        let config = CacheConfig {
            dirty_high_water: 8,
            dirty_low_water: 0,
            flusher_enabled: false,
            ..Default::default()
        };
        let built = ObjectCache::new(config, cache.router().clone(), Durability::Applied);
        assert!(matches!(built, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_throttled_writer_resumes_after_flush() {
        let config = CacheConfig {
            dirty_high_water: 8,
            dirty_low_water: 1,
            flusher_enabled: false,
            ..Default::default()
        };
        let (cache, _cluster, _shutdown) = setup(config);
        cache.write(&loc("a"), 0, Bytes::from_static(b"0123456789")).await.unwrap();
        let writer = tokio::spawn({
            let cache = cache.clone();
            async move { cache.write(&loc("a"), 10, Bytes::from_static(b"x")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        cache.flush_all().await.unwrap();
        tokio::time::timeout(Duration::from_millis(500), writer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(cache.dirty_bytes(), 1);
    }

    #[test]
    fn test_assemble_fills_holes_with_zeros() {
        let out = assemble(
            10,
            6,
            vec![(14, Bytes::from_static(b"cd")), (10, Bytes::from_static(b"ab"))],
        );
        assert_eq!(&out[..], b"ab\0\0cd");
    }
}
