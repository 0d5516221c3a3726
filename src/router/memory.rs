//! In-process cluster.
//!
//! Implements [`Messenger`] over a shared in-memory object store so the
//! whole data path can run without a network. Replies are generated either
//! immediately (auto mode) or when the caller releases them, which lets
//! tests hold requests in flight while the topology changes underneath.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::op::{Operation, OsdReply, OsdRequest, ReplyError, ReplyPayload};
use super::transport::{Credential, Messenger, SessionHandle, TransportEvent};
use crate::error::{Error, Result};
use crate::types::{Durability, ObjectLocator, RejectCode, ShardId, Tid};

/// A request as it arrived at a shard.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub shard: ShardId,
    pub conn_id: u64,
    pub request: OsdRequest,
}

#[derive(Default)]
struct StoredObject {
    data: Vec<u8>,
    version: u64,
}

/// In-memory shards sharing one object namespace.
pub struct MemoryCluster {
    events: mpsc::UnboundedSender<TransportEvent>,
    objects: DashMap<ObjectLocator, StoredObject>,
    sessions: Mutex<HashMap<u64, ShardId>>,
    next_conn: AtomicU64,
    auto_reply: AtomicBool,
    /// Deliveries not yet answered, in arrival order
    held: Mutex<Vec<Delivery>>,
    /// Every delivery ever received, in arrival order
    log: Mutex<Vec<Delivery>>,
    refused: Mutex<HashSet<ShardId>>,
    /// Requests resolved against an older epoch are answered StaleEpoch
    min_epoch: AtomicU64,
    watchers: Mutex<HashMap<ObjectLocator, Vec<(Tid, ShardId, u64)>>>,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("objects", &self.objects.len())
            .field("auto_reply", &self.auto_reply.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryCluster {
    /// New cluster plus the event stream to feed into a router.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cluster = Arc::new(Self {
            events: tx,
            objects: DashMap::new(),
            sessions: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            auto_reply: AtomicBool::new(true),
            held: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            min_epoch: AtomicU64::new(0),
            watchers: Mutex::new(HashMap::new()),
        });
        (cluster, rx)
    }

    /// Answer requests as they arrive (default) or hold them for
    /// [`MemoryCluster::reply`].
    pub fn set_auto_reply(&self, enabled: bool) {
        self.auto_reply.store(enabled, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.log.lock().clone()
    }

    pub fn pending(&self) -> Vec<Delivery> {
        self.held.lock().clone()
    }

    /// Execute the most recent held delivery of `tid` and send its replies.
    pub fn reply(&self, tid: Tid) -> bool {
        match self.take_held(tid) {
            Some(delivery) => {
                self.execute(&delivery);
                true
            }
            None => false,
        }
    }

    /// Answer the most recent held delivery of `tid` with `result` without
    /// touching the store.
    pub fn reply_with(
        &self,
        tid: Tid,
        result: std::result::Result<ReplyPayload, ReplyError>,
    ) -> bool {
        match self.take_held(tid) {
            Some(delivery) => {
                self.emit(OsdReply {
                    tid,
                    from: delivery.shard,
                    epoch: delivery.request.epoch,
                    result,
                });
                true
            }
            None => false,
        }
    }

    /// Execute every held delivery in arrival order.
    pub fn reply_all(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        let n = held.len();
        for delivery in &held {
            self.execute(delivery);
        }
        n
    }

    /// Sessions to `shard` fail from now on until [`MemoryCluster::restore`].
    pub fn refuse(&self, shard: ShardId) {
        self.refused.lock().insert(shard);
    }

    pub fn restore(&self, shard: ShardId) {
        self.refused.lock().remove(&shard);
    }

    /// Report the session to `shard` as broken. Held requests sent to it
    /// are lost.
    pub fn break_session(&self, shard: ShardId) {
        self.held.lock().retain(|d| d.shard != shard);
        self.sessions.lock().retain(|_, s| *s != shard);
        let _ = self.events.send(TransportEvent::SessionBroken(shard));
    }

    pub fn require_epoch(&self, epoch: u64) {
        self.min_epoch.store(epoch, Ordering::SeqCst);
    }

    /// Push a notification to every watcher of `locator`.
    pub fn notify(&self, locator: &ObjectLocator, payload: Bytes) -> usize {
        let watchers = self.watchers.lock().get(locator).cloned().unwrap_or_default();
        for (tid, shard, cookie) in &watchers {
            trace!(%tid, %shard, cookie, "notify");
            self.emit(OsdReply {
                tid: *tid,
                from: *shard,
                epoch: self.min_epoch.load(Ordering::SeqCst),
                result: Ok(ReplyPayload {
                    data: payload.clone(),
                    object_size: 0,
                    committed: true,
                    version: *cookie,
                }),
            });
        }
        watchers.len()
    }

    pub fn object(&self, locator: &ObjectLocator) -> Option<Bytes> {
        self.objects
            .get(locator)
            .map(|o| Bytes::copy_from_slice(&o.data))
    }

    pub fn put_object(&self, locator: ObjectLocator, data: &[u8]) {
        let mut obj = self.objects.entry(locator).or_default();
        obj.data = data.to_vec();
        obj.version += 1;
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn take_held(&self, tid: Tid) -> Option<Delivery> {
        let mut held = self.held.lock();
        let idx = held.iter().rposition(|d| d.request.tid == tid)?;
        Some(held.remove(idx))
    }

    fn emit(&self, reply: OsdReply) {
        // The router may be gone; nothing to deliver to then
        let _ = self.events.send(TransportEvent::Reply(reply));
    }

    fn execute(&self, delivery: &Delivery) {
        let req = &delivery.request;
        let min_epoch = self.min_epoch.load(Ordering::SeqCst);
        if req.epoch < min_epoch {
            debug!(tid = %req.tid, epoch = req.epoch, min_epoch, "rejecting stale epoch");
            self.emit(OsdReply {
                tid: req.tid,
                from: delivery.shard,
                epoch: min_epoch,
                result: Err(ReplyError::StaleEpoch {
                    server_epoch: min_epoch,
                }),
            });
            return;
        }

        let result = self.apply(delivery);
        let split = req.op.is_mutation() && req.durability == Durability::Committed;
        if let (true, Ok(payload)) = (split, &result) {
            self.emit(OsdReply {
                tid: req.tid,
                from: delivery.shard,
                epoch: req.epoch,
                result: Ok(ReplyPayload {
                    committed: false,
                    ..payload.clone()
                }),
            });
        }
        self.emit(OsdReply {
            tid: req.tid,
            from: delivery.shard,
            epoch: req.epoch,
            result,
        });
    }

    fn apply(&self, delivery: &Delivery) -> std::result::Result<ReplyPayload, ReplyError> {
        let req = &delivery.request;
        let not_found = || ReplyError::Rejected {
            code: RejectCode::NotFound,
            message: format!("{} does not exist", req.locator.oid),
        };
        let ok = |obj: &StoredObject, data: Bytes| ReplyPayload {
            data,
            object_size: obj.data.len() as u64,
            committed: true,
            version: obj.version,
        };

        match &req.op {
            Operation::Read { offset, length } => {
                let obj = self.objects.get(&req.locator).ok_or_else(not_found)?;
                let start = (*offset as usize).min(obj.data.len());
                let end = (offset.saturating_add(*length) as usize).min(obj.data.len());
                let mut buf = BytesMut::with_capacity(end - start);
                buf.extend_from_slice(&obj.data[start..end]);
                Ok(ok(&*obj, buf.freeze()))
            }
            Operation::Write { offset, data } => {
                let mut obj = self.objects.entry(req.locator.clone()).or_default();
                let start = *offset as usize;
                let end = start + data.len();
                if obj.data.len() < end {
                    obj.data.resize(end, 0);
                }
                obj.data[start..end].copy_from_slice(data);
                obj.version += 1;
                Ok(ok(&*obj, Bytes::new()))
            }
            Operation::Zero { offset, length } => {
                let mut obj = self.objects.get_mut(&req.locator).ok_or_else(not_found)?;
                let start = (*offset as usize).min(obj.data.len());
                let end = (offset.saturating_add(*length) as usize).min(obj.data.len());
                obj.data[start..end].fill(0);
                obj.version += 1;
                Ok(ok(&*obj, Bytes::new()))
            }
            Operation::Truncate { size } => {
                let mut obj = self.objects.entry(req.locator.clone()).or_default();
                obj.data.resize(*size as usize, 0);
                obj.version += 1;
                Ok(ok(&*obj, Bytes::new()))
            }
            Operation::Stat => {
                let obj = self.objects.get(&req.locator).ok_or_else(not_found)?;
                Ok(ok(&*obj, Bytes::new()))
            }
            Operation::Remove => {
                let (_, obj) = self.objects.remove(&req.locator).ok_or_else(not_found)?;
                Ok(ReplyPayload {
                    data: Bytes::new(),
                    object_size: 0,
                    committed: true,
                    version: obj.version,
                })
            }
            Operation::Watch { cookie } => {
                let mut watchers = self.watchers.lock();
                let list = watchers.entry(req.locator.clone()).or_default();
                list.retain(|(tid, _, _)| *tid != req.tid);
                list.push((req.tid, delivery.shard, *cookie));
                Ok(ReplyPayload {
                    committed: true,
                    version: *cookie,
                    ..Default::default()
                })
            }
        }
    }
}

impl Messenger for MemoryCluster {
    fn open_session(
        &self,
        shard: ShardId,
        addr: &str,
        _credential: &Credential,
    ) -> Result<SessionHandle> {
        if self.refused.lock().contains(&shard) {
            return Err(Error::Transport(format!("{shard} at {addr} refused session")));
        }
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(conn_id, shard);
        Ok(SessionHandle { shard, conn_id })
    }

    fn send(&self, session: &SessionHandle, request: OsdRequest) -> Result<()> {
        if self.refused.lock().contains(&session.shard) {
            return Err(Error::Transport(format!("{} refused send", session.shard)));
        }
        if !self.sessions.lock().contains_key(&session.conn_id) {
            return Err(Error::Transport(format!(
                "connection {} to {} is closed",
                session.conn_id, session.shard
            )));
        }
        let delivery = Delivery {
            shard: session.shard,
            conn_id: session.conn_id,
            request,
        };
        self.log.lock().push(delivery.clone());
        if self.auto_reply.load(Ordering::SeqCst) {
            self.execute(&delivery);
        } else {
            self.held.lock().push(delivery);
        }
        Ok(())
    }

    fn close_session(&self, session: &SessionHandle) {
        self.sessions.lock().remove(&session.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::op::ReqId;
    use crate::types::PolicyId;
    use uuid::Uuid;

    fn request(tid: u64, op: Operation, durability: Durability) -> OsdRequest {
        OsdRequest {
            reqid: ReqId {
                client: Uuid::nil(),
                tid: Tid(tid),
            },
            tid: Tid(tid),
            target: ShardId(1),
            locator: ObjectLocator::new("obj", PolicyId(1)),
            epoch: 1,
            op,
            durability,
            attempt: 0,
        }
    }

    fn replies(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<OsdReply> {
        let mut out = Vec::new();
        while let Ok(TransportEvent::Reply(r)) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_write_then_read() {
        let (cluster, mut rx) = MemoryCluster::new();
        let session = cluster
            .open_session(ShardId(1), "mem://1", &Credential::default())
            .unwrap();
        cluster
            .send(
                &session,
                request(
                    1,
                    Operation::Write {
                        offset: 2,
                        data: Bytes::from_static(b"hi"),
                    },
                    Durability::Applied,
                ),
            )
            .unwrap();
        cluster
            .send(
                &session,
                request(2, Operation::Read { offset: 0, length: 10 }, Durability::Applied),
            )
            .unwrap();

        let out = replies(&mut rx);
        assert_eq!(out.len(), 2);
        let read = out[1].result.as_ref().unwrap();
        assert_eq!(&read.data[..], b"\0\0hi");
        assert_eq!(read.object_size, 4);
    }

    #[test]
    fn test_committed_write_sends_ack_then_commit() {
        let (cluster, mut rx) = MemoryCluster::new();
        let session = cluster
            .open_session(ShardId(1), "mem://1", &Credential::default())
            .unwrap();
        cluster
            .send(
                &session,
                request(
                    1,
                    Operation::Write {
                        offset: 0,
                        data: Bytes::from_static(b"x"),
                    },
                    Durability::Committed,
                ),
            )
            .unwrap();

        let flags: Vec<bool> = replies(&mut rx)
            .iter()
            .map(|r| r.result.as_ref().unwrap().committed)
            .collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn test_held_replies_and_stale_epoch() {
        let (cluster, mut rx) = MemoryCluster::new();
        cluster.set_auto_reply(false);
        cluster.require_epoch(5);
        let session = cluster
            .open_session(ShardId(1), "mem://1", &Credential::default())
            .unwrap();
        cluster
            .send(&session, request(7, Operation::Stat, Durability::Applied))
            .unwrap();
        assert!(replies(&mut rx).is_empty());
        assert_eq!(cluster.pending().len(), 1);

        assert!(cluster.reply(Tid(7)));
        let out = replies(&mut rx);
        assert_eq!(
            out[0].result,
            Err(ReplyError::StaleEpoch { server_epoch: 5 })
        );
    }

    #[test]
    fn test_refused_shard() {
        let (cluster, _rx) = MemoryCluster::new();
        cluster.refuse(ShardId(2));
        assert!(cluster
            .open_session(ShardId(2), "mem://2", &Credential::default())
            .is_err());
        cluster.restore(ShardId(2));
        assert!(cluster
            .open_session(ShardId(2), "mem://2", &Credential::default())
            .is_ok());
    }
}
