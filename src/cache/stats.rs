//! Cache counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::segment::ByteAccounting;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    reads_issued: AtomicU64,
    read_failures: AtomicU64,
    writes: AtomicU64,
    throttled_writes: AtomicU64,
    flushes_issued: AtomicU64,
    flush_failures: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,

    // Flush round-trip (microseconds, exponential moving average)
    flush_latency_us: AtomicU64,
}

impl CacheStats {
    pub fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_read_issued(&self) {
        self.reads_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle(&self) {
        self.throttled_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_issued(&self) {
        self.flushes_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_done(&self, ok: bool, elapsed: Duration) {
        if !ok {
            self.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
        let new_us = elapsed.as_micros() as u64;
        let alpha = 0.1;
        loop {
            let current = self.flush_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };
            if self
                .flush_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self, bytes: &ByteAccounting, objects: usize) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            reads_issued: self.reads_issued.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            throttled_writes: self.throttled_writes.load(Ordering::Relaxed),
            flushes_issued: self.flushes_issued.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            flush_latency: Duration::from_micros(self.flush_latency_us.load(Ordering::Relaxed)),
            clean_bytes: bytes.clean(),
            dirty_bytes: bytes.dirty(),
            flushing_bytes: bytes.flushing(),
            reading_bytes: bytes.reading(),
            objects,
        }
    }
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub reads_issued: u64,
    pub read_failures: u64,
    pub writes: u64,
    pub throttled_writes: u64,
    pub flushes_issued: u64,
    pub flush_failures: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub flush_latency: Duration,
    pub clean_bytes: u64,
    pub dirty_bytes: u64,
    pub flushing_bytes: u64,
    pub reading_bytes: u64,
    pub objects: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_ratio(), 0.0);
        stats.record_lookup(true);
        stats.record_lookup(true);
        stats.record_lookup(true);
        stats.record_lookup(false);
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_includes_gauges() {
        let stats = CacheStats::default();
        let bytes = ByteAccounting::default();
        bytes.add(super::super::segment::SegmentState::Dirty, 42);
        stats.record_eviction(10);
        let snap = stats.snapshot(&bytes, 3);
        assert_eq!(snap.dirty_bytes, 42);
        assert_eq!(snap.evicted_bytes, 10);
        assert_eq!(snap.objects, 3);
    }
}
