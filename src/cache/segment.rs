//! Buffer segments and byte accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::types::Tid;

/// Lifecycle of a cached byte range.
///
/// ```text
///            write                 flush submitted            ack
///  CLEAN ─────────────▶ DIRTY ─────────────────▶ FLUSHING ─────────▶ CLEAN
///    ▲                    ▲                          │
///    │ data arrived       └──────── flush failed ────┘
///  READING (miss)   read failed: reported to waiters, segment dropped
/// ```
///
/// There is no error state. A failed read is reported to its waiters as
/// `IoStatus::Failed` and its reading segments are removed, so the next
/// read of the range goes back to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SegmentState {
    Clean,
    Dirty,
    Flushing(Tid),
    Reading(Tid),
}

impl SegmentState {
    pub fn has_data(&self) -> bool {
        !matches!(self, SegmentState::Reading(_))
    }
}

/// Contiguous cached range of one object.
#[derive(Debug, Clone)]
pub struct BufferSegment {
    pub offset: u64,
    pub length: u64,
    /// Empty while reading
    pub data: Bytes,
    pub state: SegmentState,
    pub last_access: Instant,
    /// When the oldest byte in this segment became dirty
    pub dirtied_at: Option<Instant>,
}

impl BufferSegment {
    pub fn clean(offset: u64, data: Bytes, now: Instant) -> Self {
        Self {
            offset,
            length: data.len() as u64,
            data,
            state: SegmentState::Clean,
            last_access: now,
            dirtied_at: None,
        }
    }

    pub fn dirty(offset: u64, data: Bytes, now: Instant) -> Self {
        Self {
            offset,
            length: data.len() as u64,
            data,
            state: SegmentState::Dirty,
            last_access: now,
            dirtied_at: Some(now),
        }
    }

    pub fn reading(offset: u64, length: u64, tid: Tid, now: Instant) -> Self {
        Self {
            offset,
            length,
            data: Bytes::new(),
            state: SegmentState::Reading(tid),
            last_access: now,
            dirtied_at: None,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// The part of this segment inside `[start, end)`.
    pub fn slice(&self, start: u64, end: u64) -> BufferSegment {
        let s = start.max(self.offset);
        let e = end.min(self.end()).max(s);
        let data = if self.state.has_data() {
            self.data
                .slice((s - self.offset) as usize..(e - self.offset) as usize)
        } else {
            Bytes::new()
        };
        BufferSegment {
            offset: s,
            length: e - s,
            data,
            state: self.state,
            last_access: self.last_access,
            dirtied_at: self.dirtied_at,
        }
    }

    /// Concatenate `self` with `next`, which must start where `self` ends.
    pub fn append(self, next: BufferSegment) -> BufferSegment {
        debug_assert_eq!(self.end(), next.offset);
        let mut data = BytesMut::with_capacity((self.length + next.length) as usize);
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&next.data);
        let dirtied_at = match (self.dirtied_at, next.dirtied_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        BufferSegment {
            offset: self.offset,
            length: self.length + next.length,
            data: data.freeze(),
            state: self.state,
            last_access: self.last_access.max(next.last_access),
            dirtied_at,
        }
    }
}

/// Public view of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub offset: u64,
    pub length: u64,
    pub state: SegmentState,
}

impl From<&BufferSegment> for SegmentInfo {
    fn from(seg: &BufferSegment) -> Self {
        Self {
            offset: seg.offset,
            length: seg.length,
            state: seg.state,
        }
    }
}

/// Cache-wide byte counts per segment state.
#[derive(Debug, Default)]
pub struct ByteAccounting {
    clean: AtomicU64,
    dirty: AtomicU64,
    flushing: AtomicU64,
    reading: AtomicU64,
}

impl ByteAccounting {
    fn counter(&self, state: SegmentState) -> &AtomicU64 {
        match state {
            SegmentState::Clean => &self.clean,
            SegmentState::Dirty => &self.dirty,
            SegmentState::Flushing(_) => &self.flushing,
            SegmentState::Reading(_) => &self.reading,
        }
    }

    pub fn add(&self, state: SegmentState, bytes: u64) {
        self.counter(state).fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub(&self, state: SegmentState, bytes: u64) {
        self.counter(state).fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn clean(&self) -> u64 {
        self.clean.load(Ordering::Relaxed)
    }

    pub fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn flushing(&self) -> u64 {
        self.flushing.load(Ordering::Relaxed)
    }

    pub fn reading(&self) -> u64 {
        self.reading.load(Ordering::Relaxed)
    }

    /// Bytes subject to write admission control
    pub fn dirty_and_flushing(&self) -> u64 {
        self.dirty() + self.flushing()
    }

    pub fn total(&self) -> u64 {
        self.clean() + self.dirty() + self.flushing() + self.reading()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_and_append() {
        let now = Instant::now();
        let seg = BufferSegment::dirty(10, Bytes::from_static(b"abcdef"), now);
        let mid = seg.slice(12, 14);
        assert_eq!((mid.offset, mid.length), (12, 2));
        assert_eq!(&mid.data[..], b"cd");

        let left = seg.slice(0, 12);
        let right = seg.slice(12, 100);
        let joined = left.append(right);
        assert_eq!(joined.offset, 10);
        assert_eq!(&joined.data[..], b"abcdef");
    }

    #[test]
    fn test_reading_slice_has_no_data() {
        let seg = BufferSegment::reading(0, 100, Tid(4), Instant::now());
        let part = seg.slice(50, 70);
        assert_eq!(part.length, 20);
        assert!(part.data.is_empty());
        assert_eq!(part.state, SegmentState::Reading(Tid(4)));
    }

    #[test]
    fn test_accounting_by_state() {
        let acct = ByteAccounting::default();
        acct.add(SegmentState::Dirty, 100);
        acct.add(SegmentState::Flushing(Tid(1)), 50);
        acct.add(SegmentState::Clean, 10);
        assert_eq!(acct.dirty_and_flushing(), 150);
        acct.sub(SegmentState::Dirty, 100);
        assert_eq!(acct.total(), 60);
    }
}
