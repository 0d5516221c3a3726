//! Per-object segment map and in-flight I/O bookkeeping.
//!
//! Segments never overlap. Every insert and removal goes through
//! [`CachedObject::insert`] / [`CachedObject::take`] so the cache-wide byte
//! counters stay exact.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::watch;

use super::segment::{BufferSegment, ByteAccounting, SegmentInfo, SegmentState};
use crate::error::{Error, Result};
use crate::types::Tid;

/// Progress of one backend sub-request as seen by waiters.
#[derive(Debug, Clone)]
pub(crate) enum IoStatus {
    Pending,
    /// `data` covers the request starting at object offset `base`
    Complete { base: u64, data: Bytes },
    Failed(Arc<Error>),
}

impl IoStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, IoStatus::Pending)
    }
}

#[derive(Debug)]
enum IoKind {
    Read { base: u64 },
    Flush { base: u64 },
}

#[derive(Debug)]
struct InflightIo {
    kind: IoKind,
    tx: watch::Sender<IoStatus>,
}

/// Result of matching a read range against the segment map.
#[derive(Debug, Default)]
pub(crate) struct Lookup {
    /// Cached bytes at their object offsets
    pub hits: Vec<(u64, Bytes)>,
    /// Ranges nobody is reading yet, as `(offset, length)`
    pub missing: Vec<(u64, u64)>,
    /// Ranges covered by someone else's read, as `(tid, start, end)`
    pub waiting: Vec<(Tid, u64, u64)>,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        self.missing.is_empty() && self.waiting.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct CachedObject {
    segments: BTreeMap<u64, BufferSegment>,
    io: HashMap<Tid, InflightIo>,
    /// Set once the object left the cache index; holders must look it up again
    pub detached: bool,
}

impl CachedObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.segments.is_empty() && self.io.is_empty()
    }

    pub fn has_dirty(&self) -> bool {
        self.segments
            .values()
            .any(|s| s.state == SegmentState::Dirty)
    }

    pub fn has_flushing(&self) -> bool {
        self.io
            .values()
            .any(|io| matches!(io.kind, IoKind::Flush { .. }))
    }

    pub fn oldest_dirty(&self) -> Option<Instant> {
        self.segments.values().filter_map(|s| s.dirtied_at).min()
    }

    pub fn segment_info(&self) -> Vec<SegmentInfo> {
        self.segments.values().map(SegmentInfo::from).collect()
    }

    fn insert(&mut self, seg: BufferSegment, acct: &ByteAccounting) {
        if seg.length == 0 {
            return;
        }
        acct.add(seg.state, seg.length);
        self.segments.insert(seg.offset, seg);
    }

    fn take(&mut self, offset: u64, acct: &ByteAccounting) -> Option<BufferSegment> {
        let seg = self.segments.remove(&offset)?;
        acct.sub(seg.state, seg.length);
        Some(seg)
    }

    /// Keys of segments intersecting `[start, end)`, ascending.
    fn overlapping(&self, start: u64, end: u64) -> Vec<u64> {
        let mut keys = Vec::new();
        if let Some((&k, seg)) = self.segments.range(..start).next_back() {
            if seg.end() > start {
                keys.push(k);
            }
        }
        keys.extend(self.segments.range(start..end).map(|(k, _)| *k));
        keys
    }

    fn keys_in_state(&self, state: SegmentState) -> Vec<u64> {
        self.segments
            .iter()
            .filter(|(_, s)| s.state == state)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Remove everything inside `[start, end)`, splitting segments that
    /// straddle the boundaries. Returns the removed pieces.
    pub fn carve(&mut self, start: u64, end: u64, acct: &ByteAccounting) -> Vec<BufferSegment> {
        let mut removed = Vec::new();
        for key in self.overlapping(start, end) {
            let Some(seg) = self.take(key, acct) else {
                continue;
            };
            if seg.offset < start {
                self.insert(seg.slice(seg.offset, start), acct);
            }
            if seg.end() > end {
                self.insert(seg.slice(end, seg.end()), acct);
            }
            removed.push(seg.slice(start, end));
        }
        removed
    }

    pub fn lookup(&mut self, offset: u64, length: u64, now: Instant) -> Lookup {
        let end = offset + length;
        let mut lookup = Lookup::default();
        let mut cursor = offset;
        for key in self.overlapping(offset, end) {
            let Some(seg) = self.segments.get_mut(&key) else {
                continue;
            };
            if seg.offset > cursor {
                lookup.missing.push((cursor, seg.offset - cursor));
            }
            let s = seg.offset.max(offset);
            let e = seg.end().min(end);
            match seg.state {
                SegmentState::Reading(tid) => lookup.waiting.push((tid, s, e)),
                _ => {
                    seg.last_access = now;
                    let data = seg
                        .data
                        .slice((s - seg.offset) as usize..(e - seg.offset) as usize);
                    lookup.hits.push((s, data));
                }
            }
            cursor = e;
        }
        if cursor < end {
            lookup.missing.push((cursor, end - cursor));
        }
        lookup
    }

    /// Merge the segment at `offset` with adjacent segments in the same
    /// state.
    fn coalesce(&mut self, offset: u64, acct: &ByteAccounting) {
        let Some(mut seg) = self.take(offset, acct) else {
            return;
        };
        let left = self
            .segments
            .range(..offset)
            .next_back()
            .filter(|(_, l)| l.end() == offset && l.state == seg.state)
            .map(|(k, _)| *k);
        if let Some(left) = left.and_then(|k| self.take(k, acct)) {
            seg = left.append(seg);
        }
        let end = seg.end();
        let right_same = self
            .segments
            .get(&end)
            .is_some_and(|r| r.state == seg.state);
        if right_same {
            if let Some(right) = self.take(end, acct) {
                seg = seg.append(right);
            }
        }
        self.insert(seg, acct);
    }

    /// Buffer a write as dirty, replacing whatever it overlaps and merging
    /// with adjacent dirty segments.
    pub fn write(&mut self, offset: u64, data: Bytes, now: Instant, acct: &ByteAccounting) {
        let end = offset + data.len() as u64;
        self.carve(offset, end, acct);
        self.insert(BufferSegment::dirty(offset, data, now), acct);
        self.coalesce(offset, acct);
    }

    /// Track a backend read for `[offset, offset + length)`.
    pub fn begin_read(
        &mut self,
        offset: u64,
        length: u64,
        tid: Tid,
        now: Instant,
        acct: &ByteAccounting,
    ) -> watch::Receiver<IoStatus> {
        self.insert(BufferSegment::reading(offset, length, tid, now), acct);
        let (tx, rx) = watch::channel(IoStatus::Pending);
        self.io.insert(
            tid,
            InflightIo {
                kind: IoKind::Read { base: offset },
                tx,
            },
        );
        rx
    }

    /// Dirty segments in ascending offset order.
    pub fn dirty_extents(&self) -> Vec<(u64, Bytes)> {
        self.segments
            .values()
            .filter(|s| s.state == SegmentState::Dirty)
            .map(|s| (s.offset, s.data.clone()))
            .collect()
    }

    /// Move the dirty segment at `offset` to flushing under `tid`.
    pub fn begin_flush(
        &mut self,
        offset: u64,
        tid: Tid,
        acct: &ByteAccounting,
    ) -> watch::Receiver<IoStatus> {
        if let Some(mut seg) = self.take(offset, acct) {
            seg.state = SegmentState::Flushing(tid);
            self.insert(seg, acct);
        }
        let (tx, rx) = watch::channel(IoStatus::Pending);
        self.io.insert(
            tid,
            InflightIo {
                kind: IoKind::Flush { base: offset },
                tx,
            },
        );
        rx
    }

    pub fn subscribe(&self, tid: Tid) -> Option<watch::Receiver<IoStatus>> {
        self.io.get(&tid).map(|io| io.tx.subscribe())
    }

    pub fn flushing_tids(&self) -> Vec<Tid> {
        self.io
            .iter()
            .filter(|(_, io)| matches!(io.kind, IoKind::Flush { .. }))
            .map(|(tid, _)| *tid)
            .collect()
    }

    /// Number of callers still waiting on `tid`.
    pub fn waiters(&self, tid: Tid) -> usize {
        self.io.get(&tid).map_or(0, |io| io.tx.receiver_count())
    }

    /// Settle a backend read. Pieces of the read range still marked as
    /// reading become clean on success and are dropped on failure.
    /// Adjacent clean pieces are merged.
    pub fn complete_read(
        &mut self,
        tid: Tid,
        result: Result<Bytes>,
        now: Instant,
        acct: &ByteAccounting,
    ) {
        let Some(io) = self.io.remove(&tid) else {
            return;
        };
        let base = match io.kind {
            IoKind::Read { base } | IoKind::Flush { base } => base,
        };
        let keys = self.keys_in_state(SegmentState::Reading(tid));
        let status = match result {
            Ok(data) => {
                for key in keys {
                    let Some(seg) = self.take(key, acct) else {
                        continue;
                    };
                    let from = (seg.offset - base) as usize;
                    let to = (seg.end() - base) as usize;
                    if to <= data.len() {
                        self.insert(BufferSegment::clean(seg.offset, data.slice(from..to), now), acct);
                        self.coalesce(seg.offset, acct);
                    }
                }
                IoStatus::Complete { base, data }
            }
            Err(e) => {
                for key in keys {
                    self.take(key, acct);
                }
                IoStatus::Failed(Arc::new(e))
            }
        };
        io.tx.send_replace(status);
    }

    /// Settle a flush. Acked bytes become clean; on failure they return to
    /// dirty and will be retried by the next flush.
    pub fn complete_flush(&mut self, tid: Tid, result: Result<()>, acct: &ByteAccounting) {
        let Some(io) = self.io.remove(&tid) else {
            return;
        };
        let base = match io.kind {
            IoKind::Read { base } | IoKind::Flush { base } => base,
        };
        let ok = result.is_ok();
        for key in self.keys_in_state(SegmentState::Flushing(tid)) {
            if let Some(mut seg) = self.take(key, acct) {
                if ok {
                    seg.state = SegmentState::Clean;
                    seg.dirtied_at = None;
                } else {
                    seg.state = SegmentState::Dirty;
                }
                let offset = seg.offset;
                self.insert(seg, acct);
                self.coalesce(offset, acct);
            }
        }
        let status = match result {
            Ok(()) => IoStatus::Complete {
                base,
                data: Bytes::new(),
            },
            Err(e) => IoStatus::Failed(Arc::new(e)),
        };
        io.tx.send_replace(status);
    }

    /// Clean segments as `(offset, last_access)`.
    pub fn clean_segments(&self) -> Vec<(u64, Instant)> {
        self.segments
            .values()
            .filter(|s| s.state == SegmentState::Clean)
            .map(|s| (s.offset, s.last_access))
            .collect()
    }

    /// Drop the clean segment at `offset`. Returns the bytes released.
    pub fn evict_clean(&mut self, offset: u64, acct: &ByteAccounting) -> u64 {
        let clean = self
            .segments
            .get(&offset)
            .is_some_and(|s| s.state == SegmentState::Clean);
        if !clean {
            return 0;
        }
        self.take(offset, acct).map_or(0, |s| s.length)
    }
}
