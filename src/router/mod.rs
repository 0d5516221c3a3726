//! Request Router
//!
//! Tracks every in-flight object request from submission to completion and
//! keeps it pointed at a live target as the topology changes.
//!
//! # Architecture
//!
//! ```text
//!   submit ──▶ ┌────────────────────────────────────────────┐
//!              │ RouterState (one lock)                     │
//!              │   snapshot   Arc<TopologySnapshot>         │
//!              │   ops        BTreeMap<Tid, InFlightOp>     │──▶ Messenger::send
//!              │   pins       OrderingToken ─▶ target       │
//!              │   sessions   ShardId ─▶ Session            │
//!              └────────────────────────────────────────────┘
//!                     ▲            ▲               ▲
//!          on_snapshot_update  handle_reply   on_session_failure / tick
//! ```
//!
//! # Rerouting
//!
//! Every event that can change where requests should go ends in one pass
//! over the transaction table in tid order. Requests sharing an ordering
//! token are moved together: once one of them is re-sent, every later one
//! is re-sent after it, so the backend sees them in submission order.
//!
//! No lock is held across an await. Messenger calls are made under the lock
//! and must not block.

mod memory;
mod op;
mod session;
mod stats;
mod transport;

pub use memory::{Delivery, MemoryCluster};
pub use op::{
    OpInfo, OpStatus, Operation, OsdReply, OsdRequest, PendingOp, ReplyError, ReplyPayload,
    ReqId, SubmitOptions, WatchHandle,
};
pub use session::SessionInfo;
pub use stats::{RouterStats, RouterStatsSnapshot};
pub use transport::{
    Authenticator, Credential, Messenger, NoAuth, SessionHandle, StaticAuth, TransportEvent,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::topology::TopologySnapshot;
use crate::types::{Durability, ObjectLocator, OrderingToken, ShardId, Tid};
use op::{Completion, InFlightOp, OpState};
use session::SessionTable;

/// Upper bound on follow-up reroute passes triggered by send failures.
const MAX_SETTLE_PASSES: usize = 32;

// =============================================================================
// Configuration
// =============================================================================

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Re-sends allowed before a request fails with `TargetUnreachable`
    pub max_retries: u32,
    /// How long a shard that failed is avoided; doubles per failure
    #[serde(with = "crate::config::millis")]
    pub retry_backoff: Duration,
    #[serde(with = "crate::config::millis")]
    pub max_backoff: Duration,
    /// Wait for a newer snapshot after a StaleEpoch reply
    #[serde(with = "crate::config::millis")]
    pub stale_epoch_timeout: Duration,
    /// Fail requests that stay without a usable target this long
    #[serde(with = "crate::config::millis_opt")]
    pub blocked_op_timeout: Option<Duration>,
    #[serde(with = "crate::config::millis")]
    pub session_idle_timeout: Duration,
    #[serde(with = "crate::config::millis")]
    pub tick_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            stale_epoch_timeout: Duration::from_secs(30),
            blocked_op_timeout: None,
            session_idle_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::Config("router.tick_interval must be non-zero".into()));
        }
        if self.max_backoff < self.retry_backoff {
            return Err(Error::Config(
                "router.max_backoff must not be below router.retry_backoff".into(),
            ));
        }
        Ok(())
    }

    /// Avoidance window after the `failures`-th consecutive failure.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = failures.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

// =============================================================================
// State
// =============================================================================

struct Pin {
    target: Option<ShardId>,
    outstanding: usize,
    /// Requests of this group not currently sent
    stalled: usize,
}

struct RouterState {
    snapshot: Arc<TopologySnapshot>,
    sessions: SessionTable,
    ops: BTreeMap<Tid, InFlightOp>,
    pins: HashMap<OrderingToken, Pin>,
    /// Shards this client failed to reach, avoided until the deadline
    unreachable: HashMap<ShardId, Instant>,
    failures: HashMap<ShardId, u32>,
    next_tid: u64,
    needs_reroute: bool,
}

impl RouterState {
    fn usable(&self, shard: ShardId) -> bool {
        self.snapshot.is_up(shard) && !self.unreachable.contains_key(&shard)
    }

    fn first_usable(&self, acting: &[ShardId]) -> Option<ShardId> {
        acting.iter().copied().find(|s| self.usable(*s))
    }
}

fn set_state(pins: &mut HashMap<OrderingToken, Pin>, op: &mut InFlightOp, state: OpState) {
    let was_sent = op.state.is_sent();
    op.state = state;
    let is_sent = op.state.is_sent();
    if was_sent == is_sent {
        return;
    }
    if let Some(pin) = op.ordering.as_ref().and_then(|t| pins.get_mut(t)) {
        if is_sent {
            pin.stalled = pin.stalled.saturating_sub(1);
        } else {
            pin.stalled += 1;
        }
    }
}

fn block(pins: &mut HashMap<OrderingToken, Pin>, op: &mut InFlightOp, now: Instant) {
    if !matches!(op.state, OpState::Blocked { .. }) {
        set_state(pins, op, OpState::Blocked { since: now });
    }
}

// =============================================================================
// Router
// =============================================================================

pub(crate) struct RouterInner {
    config: RouterConfig,
    client_id: Uuid,
    messenger: Arc<dyn Messenger>,
    auth: Arc<dyn Authenticator>,
    state: Mutex<RouterState>,
    stats: RouterStats,
}

/// Client-side request router.
///
/// Cheap to clone; all clones share one transaction table.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("client_id", &self.inner.client_id)
            .field("epoch", &self.epoch())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Router {
    pub fn new(
        config: RouterConfig,
        messenger: Arc<dyn Messenger>,
        auth: Arc<dyn Authenticator>,
        initial: Arc<TopologySnapshot>,
    ) -> Result<Self> {
        config.validate()?;
        let client_id = Uuid::new_v4();
        info!(%client_id, epoch = initial.epoch(), "creating router");
        Ok(Self {
            inner: Arc::new(RouterInner {
                config,
                client_id,
                messenger,
                auth,
                state: Mutex::new(RouterState {
                    snapshot: initial,
                    sessions: SessionTable::default(),
                    ops: BTreeMap::new(),
                    pins: HashMap::new(),
                    unreachable: HashMap::new(),
                    failures: HashMap::new(),
                    next_tid: 0,
                    needs_reroute: false,
                }),
                stats: RouterStats::default(),
            }),
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.inner.client_id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.inner.state.lock().snapshot)
    }

    pub fn epoch(&self) -> u64 {
        self.inner.state.lock().snapshot.epoch()
    }

    /// Submit a request. Never blocks on the network.
    ///
    /// Fails immediately only when the locator's policy is unknown.
    pub fn submit(
        &self,
        locator: ObjectLocator,
        op: Operation,
        options: SubmitOptions,
    ) -> Result<PendingOp> {
        let (tx, rx) = oneshot::channel();
        let tid = self
            .inner
            .enqueue(locator, op, options, Completion::Oneshot(tx))?;
        Ok(PendingOp::new(tid, rx, Arc::downgrade(&self.inner)))
    }

    /// Register a watch on an object. Notifications keep arriving across
    /// re-targets until the handle is dropped.
    pub fn submit_watch(&self, locator: ObjectLocator, cookie: u64) -> Result<WatchHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tid = self.inner.enqueue(
            locator,
            Operation::Watch { cookie },
            SubmitOptions::default(),
            Completion::Watch(tx),
        )?;
        Ok(WatchHandle::new(tid, rx, Arc::downgrade(&self.inner)))
    }

    /// Cancel an in-flight request. Returns false if it is unknown or
    /// already complete. Late replies for it are discarded.
    pub fn cancel(&self, tid: Tid) -> bool {
        self.inner.cancel(tid)
    }

    /// Adopt a newer topology snapshot. Returns false for a stale or
    /// duplicate epoch, which changes nothing.
    pub fn on_snapshot_update(&self, snapshot: Arc<TopologySnapshot>) -> bool {
        self.inner.on_snapshot_update(snapshot)
    }

    /// Session to `shard` broke.
    pub fn on_session_failure(&self, shard: ShardId) {
        self.inner.on_session_failure(shard)
    }

    pub fn handle_reply(&self, reply: OsdReply) {
        self.inner.handle_reply(reply)
    }

    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Reply(reply) => self.handle_reply(reply),
            TransportEvent::SessionBroken(shard) => self.on_session_failure(shard),
        }
    }

    /// Periodic housekeeping: expire backoffs and timeouts, retry blocked
    /// requests, close idle sessions.
    pub fn tick(&self, now: Instant) {
        self.inner.tick(now)
    }

    pub fn op_info(&self, tid: Tid) -> Option<OpInfo> {
        self.inner.state.lock().ops.get(&tid).map(|op| op.info())
    }

    /// All in-flight requests in tid order.
    pub fn in_flight_ops(&self) -> Vec<OpInfo> {
        self.inner
            .state
            .lock()
            .ops
            .values()
            .map(|op| op.info())
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().ops.len()
    }

    pub fn has_session(&self, shard: ShardId) -> bool {
        self.inner.state.lock().sessions.contains(shard)
    }

    pub fn session_info(&self, shard: ShardId) -> Option<SessionInfo> {
        self.inner
            .state
            .lock()
            .sessions
            .info(shard, Instant::now())
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        let st = self.inner.state.lock();
        self.inner
            .stats
            .snapshot(st.snapshot.epoch(), st.ops.len(), st.sessions.len())
    }

    /// Cancel everything and close all sessions.
    pub fn close(&self) {
        self.inner.close()
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Drain messenger events into the router until shutdown.
    pub fn spawn_event_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => router.handle_event(event),
                        None => break,
                    },
                }
            }
            debug!("router event pump stopped");
        })
    }

    /// Call [`Router::tick`] every `tick_interval` until shutdown.
    pub fn spawn_ticker(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let router = self.clone();
        let period = self.inner.config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => router.tick(Instant::now()),
                }
            }
            debug!("router ticker stopped");
        })
    }

    /// Apply every snapshot published on `updates` until shutdown.
    pub fn spawn_topology_follower(
        &self,
        mut updates: watch::Receiver<Arc<TopologySnapshot>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let current = updates.borrow_and_update().clone();
            router.on_snapshot_update(current);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = updates.borrow_and_update().clone();
                        router.on_snapshot_update(snapshot);
                    }
                }
            }
            debug!("topology follower stopped");
        })
    }
}

// =============================================================================
// Internals
// =============================================================================

impl RouterInner {
    #[instrument(skip(self, op, options, completion), fields(object = %locator.oid, op = op.name()))]
    fn enqueue(
        &self,
        locator: ObjectLocator,
        op: Operation,
        options: SubmitOptions,
        completion: Completion,
    ) -> Result<Tid> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let st = &mut *guard;

        let acting = st.snapshot.target(&locator.oid, locator.policy)?;
        let fresh = st.first_usable(&acting);
        st.next_tid += 1;
        let tid = Tid(st.next_tid);
        let epoch = st.snapshot.epoch();

        // New requests start Blocked and count as stalled until sent.
        let (target, parked) = match &options.ordering {
            Some(token) => match st.pins.get_mut(token) {
                Some(pin) => {
                    let parked = pin.stalled > 0;
                    pin.outstanding += 1;
                    pin.stalled += 1;
                    (pin.target, parked)
                }
                None => {
                    st.pins.insert(
                        token.clone(),
                        Pin {
                            target: fresh,
                            outstanding: 1,
                            stalled: 1,
                        },
                    );
                    (fresh, false)
                }
            },
            None => (fresh, false),
        };

        st.ops.insert(
            tid,
            InFlightOp {
                tid,
                locator,
                op,
                ordering: options.ordering,
                durability: options.durability,
                target,
                sent_to: None,
                submitted_epoch: epoch,
                sent_epoch: epoch,
                retries: 0,
                state: OpState::Blocked { since: now },
                acked: false,
                completion,
                submitted_at: now,
            },
        );
        self.stats.record_submit();

        match target {
            Some(_) if !parked => self.send(st, tid, now),
            Some(_) => trace!(%tid, "parked behind earlier request with the same token"),
            None => debug!(%tid, epoch, "no usable target, request blocked"),
        }
        self.settle(st, now);
        Ok(tid)
    }

    fn cancel(&self, tid: Tid) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !st.ops.contains_key(&tid) {
            return false;
        }
        debug!(%tid, "cancelling request");
        self.finish(st, tid, Err(Error::Cancelled { tid }));
        self.settle(st, now);
        true
    }

    fn on_snapshot_update(&self, snapshot: Arc<TopologySnapshot>) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let st = &mut *guard;

        let current = st.snapshot.epoch();
        if snapshot.epoch() <= current {
            debug!(
                current,
                offered = snapshot.epoch(),
                "ignoring snapshot that is not newer"
            );
            self.stats.record_snapshot(false);
            return false;
        }

        info!(from = current, to = snapshot.epoch(), in_flight = st.ops.len(), "applying topology snapshot");
        st.snapshot = snapshot;
        // Local reachability observations belong to the old epoch
        st.unreachable.clear();
        st.failures.clear();

        for shard in st.sessions.shards() {
            if !st.snapshot.is_up(shard) {
                debug!(%shard, "closing session to shard no longer up");
                self.drop_session(st, shard);
            }
        }

        self.reroute(st, now);
        self.settle(st, now);
        self.stats.record_snapshot(true);
        true
    }

    fn on_session_failure(&self, shard: ShardId) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        warn!(%shard, "session failure");
        self.stats.record_session_failure();
        self.mark_unreachable(st, shard, now);
        self.reroute(st, now);
        self.settle(st, now);
    }

    fn handle_reply(&self, reply: OsdReply) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let tid = reply.tid;

        let Some(op) = st.ops.get_mut(&tid) else {
            trace!(%tid, from = %reply.from, "reply for unknown request");
            self.stats.record_dropped_reply();
            return;
        };
        if op.target != Some(reply.from) || !op.state.is_sent() {
            debug!(%tid, from = %reply.from, target = ?op.target, "dropping reply from non-target shard");
            self.stats.record_dropped_reply();
            return;
        }
        st.sessions.touch(reply.from, now);
        // the shard answered, so the next failure starts a fresh backoff
        st.failures.remove(&reply.from);

        match reply.result {
            Ok(payload) => {
                if let Completion::Watch(tx) = &op.completion {
                    let _ = tx.send(Ok(payload));
                    return;
                }
                if op.durability == Durability::Committed && !payload.committed {
                    trace!(%tid, "applied, waiting for commit");
                    op.acked = true;
                    return;
                }
                self.finish(st, tid, Ok(payload));
            }
            Err(ReplyError::StaleEpoch { server_epoch }) => {
                self.stats.record_stale_epoch();
                debug!(
                    %tid,
                    server_epoch,
                    client_epoch = st.snapshot.epoch(),
                    "target reports stale epoch"
                );
                if let Some(shard) = op.sent_to.take() {
                    st.sessions.release(shard);
                }
                set_state(&mut st.pins, op, OpState::AwaitingEpoch { since: now });
                if st.snapshot.epoch() > op.sent_epoch {
                    self.reroute(st, now);
                    self.settle(st, now);
                }
            }
            Err(ReplyError::Rejected { code, message }) => {
                let err = Error::BackendRejected {
                    object: op.locator.oid.to_string(),
                    code,
                    message,
                };
                if let Completion::Watch(tx) = &op.completion {
                    let _ = tx.send(Err(err));
                    return;
                }
                self.finish(st, tid, Err(err));
            }
        }
    }

    fn tick(&self, now: Instant) {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        st.unreachable.retain(|_, until| *until > now);

        let mut expired = Vec::new();
        for (tid, op) in &st.ops {
            if op.is_watch() {
                continue;
            }
            match op.state {
                OpState::AwaitingEpoch { since }
                    if now.saturating_duration_since(since) >= self.config.stale_epoch_timeout =>
                {
                    expired.push((
                        *tid,
                        Error::StaleEpoch {
                            object: op.locator.oid.to_string(),
                            epoch: op.sent_epoch,
                        },
                    ));
                }
                OpState::Blocked { since }
                    if self
                        .config
                        .blocked_op_timeout
                        .is_some_and(|t| now.saturating_duration_since(since) >= t) =>
                {
                    expired.push((
                        *tid,
                        Error::TargetUnreachable {
                            object: op.locator.oid.to_string(),
                            shard: op.target,
                            attempts: op.retries,
                        },
                    ));
                }
                _ => {}
            }
        }
        for (tid, err) in expired {
            warn!(%tid, error = %err, "request timed out");
            self.finish(st, tid, Err(err));
        }

        self.reroute(st, now);
        self.settle(st, now);

        for shard in st.sessions.idle(now, self.config.session_idle_timeout) {
            debug!(%shard, "closing idle session");
            self.drop_session(st, shard);
        }
    }

    fn close(&self) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let tids: Vec<Tid> = st.ops.keys().copied().collect();
        info!(in_flight = tids.len(), "closing router");
        for tid in tids {
            self.finish(st, tid, Err(Error::Cancelled { tid }));
        }
        for shard in st.sessions.shards() {
            self.drop_session(st, shard);
        }
    }

    // =========================================================================
    // Routing core
    // =========================================================================

    /// One pass over the transaction table in tid order, re-sending every
    /// request whose target changed or that is waiting and can now go out.
    fn reroute(&self, st: &mut RouterState, now: Instant) {
        let snapshot = Arc::clone(&st.snapshot);
        let epoch = snapshot.epoch();
        let mut decided: HashMap<OrderingToken, Option<ShardId>> = HashMap::new();
        let mut moved: HashSet<OrderingToken> = HashSet::new();
        let mut held: HashSet<OrderingToken> = HashSet::new();
        let tids: Vec<Tid> = st.ops.keys().copied().collect();

        for tid in tids {
            let Some(op) = st.ops.get(&tid) else {
                continue;
            };
            let token = op.ordering.clone();
            if token.as_ref().is_some_and(|t| held.contains(t)) {
                continue;
            }
            let state = op.state;
            let current = op.target;

            let waiting = match state {
                OpState::Sent => false,
                OpState::Blocked { .. } => true,
                OpState::AwaitingEpoch { .. } if epoch > op.sent_epoch => true,
                OpState::AwaitingEpoch { .. } => {
                    // Later requests of this group must not overtake it
                    if let Some(t) = token {
                        held.insert(t);
                    }
                    continue;
                }
            };

            let acting = match snapshot.target(&op.locator.oid, op.locator.policy) {
                Ok(acting) => acting,
                Err(e) => {
                    self.finish(st, tid, Err(e));
                    continue;
                }
            };
            let current_ok = current.is_some_and(|t| acting.contains(&t) && st.usable(t));
            let fresh = if current_ok {
                current
            } else {
                st.first_usable(&acting)
            };
            let target = match &token {
                Some(t) => *decided.entry(t.clone()).or_insert(fresh),
                None => fresh,
            };
            let group_moved = token.as_ref().is_some_and(|t| moved.contains(t));

            if !waiting && !group_moved && target == current {
                continue;
            }
            let was_blocked = matches!(state, OpState::Blocked { .. });
            if was_blocked && target.is_none() {
                if let Some(t) = token {
                    held.insert(t);
                }
                continue;
            }

            if let Some(t) = token {
                if let Some(pin) = st.pins.get_mut(&t) {
                    pin.target = target;
                }
                moved.insert(t);
            }
            self.resend(st, tid, target, !was_blocked, now);
        }
    }

    fn resend(
        &self,
        st: &mut RouterState,
        tid: Tid,
        target: Option<ShardId>,
        count_retry: bool,
        now: Instant,
    ) {
        let Some(op) = st.ops.get_mut(&tid) else {
            return;
        };
        if count_retry {
            op.retries += 1;
            self.stats.record_retry();
            if !op.is_watch() && op.retries > self.config.max_retries {
                let err = Error::TargetUnreachable {
                    object: op.locator.oid.to_string(),
                    shard: op.target,
                    attempts: op.retries,
                };
                warn!(%tid, error = %err, "retry bound exhausted");
                self.finish(st, tid, Err(err));
                return;
            }
        }
        if let Some(prev) = op.sent_to.take() {
            st.sessions.release(prev);
        }
        debug!(%tid, from = ?op.target, to = ?target, retries = op.retries, "re-targeting request");
        op.target = target;
        match target {
            Some(_) => self.send(st, tid, now),
            None => block(&mut st.pins, op, now),
        }
    }

    fn send(&self, st: &mut RouterState, tid: Tid, now: Instant) {
        let Some(shard) = st.ops.get(&tid).and_then(|op| op.target) else {
            return;
        };
        let Err(e) = self.transmit(st, tid, shard, now) else {
            return;
        };

        warn!(%tid, %shard, error = %e, "send failed");
        self.stats.record_session_failure();
        self.mark_unreachable(st, shard, now);
        st.needs_reroute = true;

        let Some(op) = st.ops.get_mut(&tid) else {
            return;
        };
        op.retries += 1;
        self.stats.record_retry();
        if !op.is_watch() && op.retries > self.config.max_retries {
            let err = Error::TargetUnreachable {
                object: op.locator.oid.to_string(),
                shard: Some(shard),
                attempts: op.retries,
            };
            self.finish(st, tid, Err(err));
            return;
        }
        op.target = None;
        block(&mut st.pins, op, now);
    }

    fn transmit(&self, st: &mut RouterState, tid: Tid, shard: ShardId, now: Instant) -> Result<()> {
        if !st.usable(shard) {
            return Err(Error::Transport(format!("{shard} is not usable")));
        }
        let epoch = st.snapshot.epoch();
        let addr = st
            .snapshot
            .shard(shard)
            .map(|s| s.addr.clone())
            .ok_or_else(|| Error::Transport(format!("{shard} missing from epoch {epoch}")))?;

        let (handle, opened) = st.sessions.get_or_open(
            shard,
            &addr,
            self.messenger.as_ref(),
            self.auth.as_ref(),
            now,
        )?;
        if opened {
            self.stats.record_session_opened();
        }

        let op = st
            .ops
            .get_mut(&tid)
            .ok_or_else(|| Error::Internal(format!("{tid} left the table while sending")))?;
        if let Some(prev) = op.sent_to.take() {
            st.sessions.release(prev);
        }
        let request = OsdRequest {
            reqid: ReqId {
                client: self.client_id,
                tid,
            },
            tid,
            target: shard,
            locator: op.locator.clone(),
            epoch,
            op: op.op.clone(),
            durability: op.durability,
            attempt: op.retries,
        };
        self.messenger.send(&handle, request)?;

        trace!(%tid, %shard, epoch, "sent");
        op.sent_epoch = epoch;
        op.sent_to = Some(shard);
        op.acked = false;
        set_state(&mut st.pins, op, OpState::Sent);
        st.sessions.attach(shard, now);
        self.stats.record_send();
        Ok(())
    }

    /// Run follow-up passes until no send failure asks for another one.
    fn settle(&self, st: &mut RouterState, now: Instant) {
        let mut passes = 0;
        while std::mem::take(&mut st.needs_reroute) {
            passes += 1;
            if passes > MAX_SETTLE_PASSES {
                warn!(passes, "giving up on settling routes until next event");
                break;
            }
            self.reroute(st, now);
        }
    }

    fn mark_unreachable(&self, st: &mut RouterState, shard: ShardId, now: Instant) {
        let failures = {
            let f = st.failures.entry(shard).or_insert(0);
            *f += 1;
            *f
        };
        let avoid = self.config.backoff_for(failures);
        debug!(%shard, failures, avoid_ms = avoid.as_millis() as u64, "marking shard unreachable");
        st.unreachable.insert(shard, now + avoid);
        self.drop_session(st, shard);
    }

    fn drop_session(&self, st: &mut RouterState, shard: ShardId) {
        if st.sessions.close(shard, self.messenger.as_ref()) {
            self.stats.record_session_closed();
        }
        for op in st.ops.values_mut() {
            if op.sent_to == Some(shard) {
                op.sent_to = None;
            }
        }
    }

    /// Remove `tid` from the table and deliver its terminal result.
    fn finish(&self, st: &mut RouterState, tid: Tid, result: Result<ReplyPayload>) {
        let Some(mut op) = st.ops.remove(&tid) else {
            return;
        };
        if let Some(shard) = op.sent_to.take() {
            st.sessions.release(shard);
        }
        if let Some(token) = &op.ordering {
            let release = match st.pins.get_mut(token) {
                Some(pin) => {
                    pin.outstanding = pin.outstanding.saturating_sub(1);
                    if !op.state.is_sent() {
                        pin.stalled = pin.stalled.saturating_sub(1);
                    }
                    pin.outstanding == 0
                }
                None => false,
            };
            if release {
                st.pins.remove(token);
            }
            if !op.state.is_sent() {
                // Parked successors may be free to go
                st.needs_reroute = true;
            }
        }

        match &result {
            Ok(_) => self.stats.record_completion(true, op.submitted_at.elapsed()),
            Err(Error::Cancelled { .. }) => self.stats.record_cancel(),
            Err(e) => {
                debug!(%tid, error = %e, "request failed");
                self.stats.record_completion(false, op.submitted_at.elapsed());
            }
        }
        match op.completion {
            Completion::Oneshot(tx) => {
                let _ = tx.send(result);
            }
            Completion::Watch(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}
