//! Write-back object cache
//!
//! Buffers object byte ranges in memory between the file translator and the
//! router. Reads are served from cached segments and only the missing
//! ranges go to the cluster; concurrent readers of the same range share one
//! backend read. Writes complete in memory and reach the cluster when the
//! object is flushed.
//!
//! ```text
//!   read ──▶ lookup ──hit──────────────────────────▶ assemble
//!              │ miss                                   ▲
//!              └──▶ READING ──router read──▶ CLEAN ─────┘
//!
//!   write ─▶ throttle (dirty > high water) ─▶ DIRTY
//!   flush ─▶ FLUSHING ──ordered router write──▶ CLEAN (on ack)
//!                                        └────▶ DIRTY (on failure)
//!   trim  ─▶ evict least recently used CLEAN while over max_bytes
//! ```

mod manager;
mod object;
mod segment;
mod stats;

#[cfg(test)]
mod proptest;

pub use manager::ObjectCache;
pub use segment::{SegmentInfo, SegmentState};
pub use stats::{CacheStats, CacheStatsSnapshot};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cache sizing and write-back policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on cached bytes before clean data is evicted
    pub max_bytes: u64,
    /// Writers block while dirty plus flushing bytes exceed this
    pub dirty_high_water: u64,
    /// Blocked writers resume once usage falls below this
    pub dirty_low_water: u64,
    /// Background flusher period
    #[serde(with = "crate::config::millis")]
    pub flush_interval: Duration,
    /// Dirty data older than this is flushed by the background flusher
    #[serde(with = "crate::config::millis")]
    pub max_dirty_age: Duration,
    pub flusher_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            dirty_high_water: 32 * 1024 * 1024,
            dirty_low_water: 16 * 1024 * 1024,
            flush_interval: Duration::from_secs(1),
            max_dirty_age: Duration::from_secs(5),
            flusher_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(Error::Config("cache max_bytes must be positive".into()));
        }
        if self.dirty_high_water == 0 {
            return Err(Error::Config("dirty_high_water must be positive".into()));
        }
        // writers resume only below the low-water mark
        if self.dirty_low_water == 0 {
            return Err(Error::Config("dirty_low_water must be positive".into()));
        }
        if self.dirty_low_water > self.dirty_high_water {
            return Err(Error::Config(format!(
                "dirty_low_water ({}) exceeds dirty_high_water ({})",
                self.dirty_low_water, self.dirty_high_water
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush_interval must be positive".into()));
        }
        Ok(())
    }
}
