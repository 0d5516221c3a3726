//! Prometheus exposition of router and cache counters.
//!
//! The data path keeps its own atomics; [`MetricsExporter::update`] copies a
//! [`ClientStats`] snapshot into a private registry right before scraping.

use prometheus::{
    Encoder, Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::client::ClientStats;
use crate::error::{Error, Result};

/// Registry plus the metric families it exports
pub struct MetricsExporter {
    registry: Registry,
    router_ops: IntCounterVec,
    router_events: IntCounterVec,
    epoch: IntGauge,
    in_flight: IntGauge,
    sessions: IntGauge,
    latency: Gauge,
    cache_events: IntCounterVec,
    cache_bytes: IntGaugeVec,
    cache_objects: IntGauge,
    cache_hit_ratio: Gauge,
}

impl MetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("osdc".to_string()), None)
            .map_err(metrics_error)?;

        let router_ops = IntCounterVec::new(
            Opts::new("router_ops_total", "Requests by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let router_events = IntCounterVec::new(
            Opts::new("router_events_total", "Routing events"),
            &["event"],
        )
        .map_err(metrics_error)?;
        let epoch = IntGauge::new("topology_epoch", "Epoch of the applied topology snapshot")
            .map_err(metrics_error)?;
        let in_flight = IntGauge::new("router_in_flight", "Requests awaiting a terminal result")
            .map_err(metrics_error)?;
        let sessions = IntGauge::new("router_sessions", "Open shard sessions")
            .map_err(metrics_error)?;
        let latency = Gauge::new(
            "router_latency_seconds",
            "Moving average of request completion latency",
        )
        .map_err(metrics_error)?;
        let cache_events = IntCounterVec::new(
            Opts::new("cache_events_total", "Cache events"),
            &["event"],
        )
        .map_err(metrics_error)?;
        let cache_bytes = IntGaugeVec::new(
            Opts::new("cache_bytes", "Cached bytes by segment state"),
            &["state"],
        )
        .map_err(metrics_error)?;
        let cache_objects = IntGauge::new("cache_objects", "Objects with cached state")
            .map_err(metrics_error)?;
        let cache_hit_ratio = Gauge::new("cache_hit_ratio", "Fraction of reads served from memory")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(router_ops.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(router_events.clone()))
            .map_err(metrics_error)?;
        registry.register(Box::new(epoch.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(in_flight.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(sessions.clone()))
            .map_err(metrics_error)?;
        registry.register(Box::new(latency.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(cache_events.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(cache_bytes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(cache_objects.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(cache_hit_ratio.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            router_ops,
            router_events,
            epoch,
            in_flight,
            sessions,
            latency,
            cache_events,
            cache_bytes,
            cache_objects,
            cache_hit_ratio,
        })
    }

    /// Bring every metric up to the values in `stats`.
    pub fn update(&self, stats: &ClientStats) {
        let r = &stats.router;
        for (outcome, value) in [
            ("submitted", r.submitted),
            ("completed", r.completed),
            ("failed", r.failed),
            ("cancelled", r.cancelled),
        ] {
            advance(&self.router_ops, outcome, value);
        }
        for (event, value) in [
            ("sent", r.sent),
            ("retry", r.retries),
            ("session_failure", r.session_failures),
            ("session_opened", r.sessions_opened),
            ("session_closed", r.sessions_closed),
            ("dropped_reply", r.dropped_replies),
            ("stale_epoch", r.stale_epoch_replies),
            ("snapshot_applied", r.snapshots_applied),
            ("snapshot_ignored", r.snapshots_ignored),
        ] {
            advance(&self.router_events, event, value);
        }
        self.epoch.set(r.epoch as i64);
        self.in_flight.set(r.in_flight as i64);
        self.sessions.set(r.sessions as i64);
        self.latency.set(r.latency_us as f64 / 1_000_000.0);

        if let Some(c) = &stats.cache {
            for (event, value) in [
                ("hit", c.hits),
                ("miss", c.misses),
                ("read_issued", c.reads_issued),
                ("read_failure", c.read_failures),
                ("write", c.writes),
                ("throttled_write", c.throttled_writes),
                ("flush_issued", c.flushes_issued),
                ("flush_failure", c.flush_failures),
                ("eviction", c.evictions),
            ] {
                advance(&self.cache_events, event, value);
            }
            for (state, value) in [
                ("clean", c.clean_bytes),
                ("dirty", c.dirty_bytes),
                ("flushing", c.flushing_bytes),
                ("reading", c.reading_bytes),
            ] {
                self.cache_bytes.with_label_values(&[state]).set(value as i64);
            }
            self.cache_objects.set(c.objects as i64);
            self.cache_hit_ratio.set(c.hit_ratio);
        }
    }

    /// Text exposition format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

/// Counters only move forward; catch up to `value`.
fn advance(family: &IntCounterVec, label: &str, value: u64) {
    let counter = family.with_label_values(&[label]);
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {e}"))
}
