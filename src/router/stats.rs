//! Router counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Router metrics collector
#[derive(Debug, Default)]
pub struct RouterStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    sent: AtomicU64,
    retries: AtomicU64,
    session_failures: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    dropped_replies: AtomicU64,
    stale_epoch_replies: AtomicU64,
    snapshots_applied: AtomicU64,
    snapshots_ignored: AtomicU64,

    // Completion latency (microseconds, exponential moving average)
    latency_us: AtomicU64,
}

impl RouterStats {
    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, ok: bool, elapsed: Duration) {
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.update_latency_ema(elapsed);
    }

    pub fn record_cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_failure(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_reply(&self) {
        self.dropped_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_epoch(&self) {
        self.stale_epoch_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self, applied: bool) {
        if applied {
            self.snapshots_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshots_ignored.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn update_latency_ema(&self, elapsed: Duration) {
        let new_us = elapsed.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = self.latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };
            if self
                .latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn snapshot(&self, epoch: u64, in_flight: usize, sessions: usize) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            epoch,
            in_flight: in_flight as u64,
            sessions: sessions as u64,
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            session_failures: self.session_failures.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            dropped_replies: self.dropped_replies.load(Ordering::Relaxed),
            stale_epoch_replies: self.stale_epoch_replies.load(Ordering::Relaxed),
            snapshots_applied: self.snapshots_applied.load(Ordering::Relaxed),
            snapshots_ignored: self.snapshots_ignored.load(Ordering::Relaxed),
            latency_us: self.latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RouterStats`] plus gauges.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStatsSnapshot {
    pub epoch: u64,
    pub in_flight: u64,
    pub sessions: u64,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub sent: u64,
    pub retries: u64,
    pub session_failures: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub dropped_replies: u64,
    pub stale_epoch_replies: u64,
    pub snapshots_applied: u64,
    pub snapshots_ignored: u64,
    pub latency_us: u64,
}
