//! In-flight request types.
//!
//! Requests are owned by the router's transaction table and referenced
//! everywhere else by [`Tid`]. Callers hold a [`PendingOp`] (one terminal
//! result) or a [`WatchHandle`] (a stream of replies until cancelled).

use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::RouterInner;
use crate::error::{Error, Result};
use crate::types::{Durability, ObjectLocator, OrderingToken, RejectCode, ShardId, Tid};

// =============================================================================
// Operations
// =============================================================================

/// Object operation payload. Opaque to routing decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Read { offset: u64, length: u64 },
    Write { offset: u64, data: Bytes },
    Zero { offset: u64, length: u64 },
    Truncate { size: u64 },
    Stat,
    Remove,
    /// Long-lived registration; replies are notifications
    Watch { cookie: u64 },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::Zero { .. } => "zero",
            Operation::Truncate { .. } => "truncate",
            Operation::Stat => "stat",
            Operation::Remove => "remove",
            Operation::Watch { .. } => "watch",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Write { .. }
                | Operation::Zero { .. }
                | Operation::Truncate { .. }
                | Operation::Remove
        )
    }
}

/// Per-request submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Pins this request to the target of earlier requests with the same token
    pub ordering: Option<OrderingToken>,
    /// Acknowledgement level that completes the request
    pub durability: Durability,
}

impl SubmitOptions {
    /// Ordered submission for `locator` at the given durability.
    pub fn ordered(locator: &ObjectLocator, durability: Durability) -> Self {
        Self {
            ordering: Some(locator.ordering_token()),
            durability,
        }
    }
}

// =============================================================================
// Wire-level request / reply (logical fields only)
// =============================================================================

/// Globally unique request id: client instance plus transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqId {
    pub client: Uuid,
    pub tid: Tid,
}

/// Request handed to the messenger.
#[derive(Debug, Clone)]
pub struct OsdRequest {
    pub reqid: ReqId,
    pub tid: Tid,
    pub target: ShardId,
    pub locator: ObjectLocator,
    /// Epoch of the snapshot the target was resolved against
    pub epoch: u64,
    pub op: Operation,
    pub durability: Durability,
    /// Number of times this request was re-sent
    pub attempt: u32,
}

/// Successful reply contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyPayload {
    /// Data returned by reads and notifications
    pub data: Bytes,
    /// Object size after the operation
    pub object_size: u64,
    /// `false` for an "applied" ack that precedes the commit
    pub committed: bool,
    pub version: u64,
}

/// Failure reported by a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// Target rejected the request as resolved against an obsolete topology
    StaleEpoch { server_epoch: u64 },
    /// Semantic failure unrelated to topology
    Rejected { code: RejectCode, message: String },
}

/// Reply delivered by the messenger.
#[derive(Debug, Clone)]
pub struct OsdReply {
    pub tid: Tid,
    pub from: ShardId,
    pub epoch: u64,
    pub result: std::result::Result<ReplyPayload, ReplyError>,
}

// =============================================================================
// Transaction table entries
// =============================================================================

/// Where an in-flight request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    /// Handed to the target's session
    Sent,
    /// No usable target, or parked behind an earlier request with its token
    Blocked { since: Instant },
    /// Target answered StaleEpoch; waiting for a newer snapshot
    AwaitingEpoch { since: Instant },
}

impl OpState {
    pub(crate) fn is_sent(&self) -> bool {
        matches!(self, OpState::Sent)
    }
}

/// Public view of [`OpState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpStatus {
    Sent,
    Blocked,
    AwaitingEpoch,
}

pub(crate) enum Completion {
    Oneshot(oneshot::Sender<Result<ReplyPayload>>),
    Watch(mpsc::UnboundedSender<Result<ReplyPayload>>),
}

pub(crate) struct InFlightOp {
    pub tid: Tid,
    pub locator: ObjectLocator,
    pub op: Operation,
    pub ordering: Option<OrderingToken>,
    pub durability: Durability,
    pub target: Option<ShardId>,
    /// Session currently counting this request as outstanding
    pub sent_to: Option<ShardId>,
    pub submitted_epoch: u64,
    pub sent_epoch: u64,
    pub retries: u32,
    pub state: OpState,
    /// Applied ack seen while waiting for commit
    pub acked: bool,
    pub completion: Completion,
    pub submitted_at: Instant,
}

impl InFlightOp {
    pub fn is_watch(&self) -> bool {
        matches!(self.completion, Completion::Watch(_))
    }

    pub fn info(&self) -> OpInfo {
        OpInfo {
            tid: self.tid,
            locator: self.locator.clone(),
            op: self.op.name(),
            ordering: self.ordering.clone(),
            target: self.target,
            retries: self.retries,
            submitted_epoch: self.submitted_epoch,
            sent_epoch: self.sent_epoch,
            status: match self.state {
                OpState::Sent => OpStatus::Sent,
                OpState::Blocked { .. } => OpStatus::Blocked,
                OpState::AwaitingEpoch { .. } => OpStatus::AwaitingEpoch,
            },
            acked: self.acked,
            watch: self.is_watch(),
            age: self.submitted_at.elapsed(),
        }
    }
}

/// Snapshot of one in-flight request, for introspection.
#[derive(Debug, Clone)]
pub struct OpInfo {
    pub tid: Tid,
    pub locator: ObjectLocator,
    pub op: &'static str,
    pub ordering: Option<OrderingToken>,
    pub target: Option<ShardId>,
    pub retries: u32,
    pub submitted_epoch: u64,
    pub sent_epoch: u64,
    pub status: OpStatus,
    pub acked: bool,
    pub watch: bool,
    pub age: std::time::Duration,
}

// =============================================================================
// Caller handles
// =============================================================================

/// Completion of a submitted request.
///
/// Resolves to the terminal result. Dropping it before it resolves cancels
/// the request; use [`PendingOp::detach`] to let it run unobserved.
#[must_use = "dropping a PendingOp cancels the request"]
pub struct PendingOp {
    tid: Tid,
    rx: oneshot::Receiver<Result<ReplyPayload>>,
    router: Weak<RouterInner>,
    done: bool,
}

impl std::fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp")
            .field("tid", &self.tid)
            .field("done", &self.done)
            .finish()
    }
}

impl PendingOp {
    pub(crate) fn new(
        tid: Tid,
        rx: oneshot::Receiver<Result<ReplyPayload>>,
        router: Weak<RouterInner>,
    ) -> Self {
        Self {
            tid,
            rx,
            router,
            done: false,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Stop tracking the result without cancelling the request.
    pub fn detach(mut self) -> Tid {
        self.done = true;
        self.tid
    }
}

impl Future for PendingOp {
    type Output = Result<ReplyPayload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let tid = self.tid;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.unwrap_or(Err(Error::Cancelled { tid })))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.cancel(self.tid);
        }
    }
}

/// Handle of a persistent watch request.
///
/// Every reply for the watch, across retries and re-targets, arrives on
/// [`WatchHandle::next`]. Dropping the handle cancels the watch.
pub struct WatchHandle {
    tid: Tid,
    rx: mpsc::UnboundedReceiver<Result<ReplyPayload>>,
    router: Weak<RouterInner>,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("tid", &self.tid).finish()
    }
}

impl WatchHandle {
    pub(crate) fn new(
        tid: Tid,
        rx: mpsc::UnboundedReceiver<Result<ReplyPayload>>,
        router: Weak<RouterInner>,
    ) -> Self {
        Self { tid, rx, router }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Next notification; `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<Result<ReplyPayload>> {
        self.rx.recv().await
    }

    pub fn cancel(self) {
        // Drop does the work
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.cancel(self.tid);
        }
    }
}
